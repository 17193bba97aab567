//! Per-connection tasks
//!
//! Each accepted socket gets a reader (this task) and a writer task fed by
//! the client's outbound queue. The reader ends on EOF, a read error, an
//! idle timeout, a buffer overflow, a kick from the registry, or the writer
//! finishing after a `Close`. Teardown always runs through
//! [`Registry::remove_client`], so room rosters stay in step with sockets.
//!
//! A peer whose address is banned is told so and closed before it is ever
//! registered. With `ban_invalid_after` set, that many consecutive invalid
//! frames ban the sender; any valid frame resets the count.

use crate::client::{Outbound, encode};
use crate::config::RelayConfig;
use crate::registry::{BANNED_MESSAGE, Registry};
use anchor_core::{ClientId, FrameDecoder, Packet, RelayError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Drive one client connection until it closes
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    if registry.lock().await.is_banned(peer.ip()) {
        info!("Refused banned peer {}", peer);
        if let Err(e) = refuse_banned(&mut writer).await {
            debug!("Ban notice to {} failed: {}", peer, e);
        }
        return;
    }

    let (tx, rx) = mpsc::channel(config.outbound_queue_capacity);
    let kick = Arc::new(Notify::new());
    let id = registry.register_client(peer, tx, kick.clone()).await;
    info!("Client {} connected from {}", id, peer);

    let mut writer_task = tokio::spawn(write_loop(id, writer, rx));

    let reason = read_loop(id, reader, &registry, &config, &kick, &mut writer_task).await;
    match &reason {
        Ok(()) => info!("Client {} disconnected", id),
        Err(e) => info!("Client {} disconnected: {}", id, e),
    }

    registry.remove_client(id).await;
    if !writer_task.is_finished() {
        writer_task.abort();
    }
}

/// Tell a banned peer why it is being turned away, then close
async fn refuse_banned<W>(writer: &mut WriteHalf<W>) -> Result<()>
where
    W: AsyncRead + AsyncWrite,
{
    let notice = encode(&Packet::server_message(BANNED_MESSAGE))?;
    let disable = encode(&Packet::disable_anchor())?;
    let written = async {
        writer.write_all(notice.as_bytes()).await?;
        writer.write_all(disable.as_bytes()).await?;
        writer.flush().await?;
        writer.shutdown().await
    }
    .await;
    written.map_err(|e| RelayError::ConnectionError(format!("write failed: {}", e)))
}

async fn read_loop<R>(
    id: ClientId,
    mut reader: ReadHalf<R>,
    registry: &Registry,
    config: &RelayConfig,
    kick: &Notify,
    writer_task: &mut tokio::task::JoinHandle<()>,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite,
{
    let mut decoder = match config.max_buffered_bytes {
        Some(limit) => FrameDecoder::with_limit(limit),
        None => FrameDecoder::new(),
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut invalid: u32 = 0;

    loop {
        let read = tokio::select! {
            _ = kick.notified() => {
                return Err(RelayError::ConnectionError("dropped by relay".into()));
            }
            _ = &mut *writer_task => return Ok(()),
            read = read_chunk(&mut reader, &mut chunk, config) => read?,
        };
        if read == 0 {
            return Ok(());
        }

        for frame in decoder.push(&chunk[..read])? {
            if frame.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match Packet::decode(&frame) {
                Ok(packet) => {
                    invalid = 0;
                    let routing = registry.handle_packet(id, packet).await;
                    debug!("Client {}: {:?}", id, routing);
                }
                Err(e) if e.is_frame_local() => {
                    warn!("Client {} sent a bad frame, dropped: {}", id, e);
                    invalid = invalid.saturating_add(1);
                    if config.ban_invalid_after == Some(invalid) {
                        registry.lock().await.ban(id)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn read_chunk<R>(
    reader: &mut ReadHalf<R>,
    chunk: &mut [u8],
    config: &RelayConfig,
) -> Result<usize>
where
    R: AsyncRead + AsyncWrite,
{
    let read = reader.read(chunk);
    let result = match config.idle_timeout {
        Some(limit) => tokio::time::timeout(limit, read)
            .await
            .map_err(|_| RelayError::ConnectionError(format!("idle for {:?}", limit)))?,
        None => read.await,
    };
    result.map_err(|e| RelayError::ConnectionError(format!("read failed: {}", e)))
}

/// Drain the outbound queue onto the socket. Ends on `Close`, a write error,
/// or when the registry drops the client's queue.
async fn write_loop<W>(id: ClientId, mut writer: WriteHalf<W>, mut rx: mpsc::Receiver<Outbound>)
where
    W: AsyncRead + AsyncWrite,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let written = async {
                    writer.write_all(frame.as_bytes()).await?;
                    writer.flush().await
                }
                .await;
                if let Err(e) = written {
                    debug!("Client {} write failed: {}", id, e);
                    return;
                }
            }
            Outbound::Close => {
                if let Err(e) = writer.shutdown().await {
                    debug!("Client {} shutdown failed: {}", id, e);
                }
                return;
            }
        }
    }
}
