//! Anchor relay client
//!
//! A small async client for the relay's newline-delimited JSON protocol,
//! used by the integration tests and by tooling that drives a relay.

use anchor_core::{ClientId, Packet, RelayError, Result, encode_frame};
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Connection to a relay
pub struct AnchorClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: Vec<u8>,
}

impl AnchorClient {
    /// Connect to a relay at `addr`
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| RelayError::ConnectionError(format!("connect failed: {}", e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RelayError::ConnectionError(format!("set_nodelay failed: {}", e)))?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer,
            line: Vec::new(),
        })
    }

    /// Send one packet
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let frame = encode_frame(packet)?;
        debug!("Sending {}", packet.kind());
        self.write(frame.as_bytes()).await
    }

    /// Send `line` verbatim, appending the delimiter if it is missing
    pub async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.write(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.write(b"\n").await?;
        }
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .await
            .map_err(|e| RelayError::ConnectionError(format!("write failed: {}", e)))
    }

    /// Next frame as raw JSON
    pub async fn recv_value(&mut self) -> Result<Value> {
        // Partial lines survive a cancelled read in `self.line`
        let read = self
            .reader
            .read_until(b'\n', &mut self.line)
            .await
            .map_err(|e| RelayError::ConnectionError(format!("read failed: {}", e)))?;
        if read == 0 {
            return Err(RelayError::ConnectionError("relay closed the connection".into()));
        }
        let line = std::mem::take(&mut self.line);
        serde_json::from_slice(&line).map_err(|e| RelayError::MalformedFrame(e.to_string()))
    }

    /// Next packet. Unlike the relay side, the sender's `clientId` is kept:
    /// here it was stamped by the relay and can be trusted.
    pub async fn recv(&mut self) -> Result<Packet> {
        let value = self.recv_value().await?;
        let sender = value
            .get("clientId")
            .and_then(Value::as_u64)
            .map(ClientId);
        let mut packet = Packet::decode(value.to_string().as_bytes())?;
        packet.client_id = sender;
        Ok(packet)
    }

    /// Next packet, or `None` if nothing arrives within `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(packet) => packet.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Skip packets until one of type `kind` arrives
    pub async fn recv_kind(&mut self, kind: &str, timeout: Duration) -> Result<Packet> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let packet = tokio::time::timeout_at(deadline, self.recv())
                .await
                .map_err(|_| RelayError::ConnectionError(format!("timed out waiting for {}", kind)))??;
            if packet.kind() == kind {
                return Ok(packet);
            }
            debug!("Skipping {} while waiting for {}", packet.kind(), kind);
        }
    }

    /// Shut down the write side and drop the connection
    pub async fn close(mut self) -> Result<()> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| RelayError::ConnectionError(format!("shutdown failed: {}", e)))
    }
}
