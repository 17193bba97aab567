//! # anchor-relay
//!
//! Room-based TCP relay for Anchor game sessions.
//!
//! This crate provides:
//! - `Registry`: every live client and room, and the packet routing rules
//! - Per-connection reader/writer tasks over newline-delimited JSON
//! - An operator console driven from any line-oriented stream
//! - Idle-client heartbeats and an optional status file, which also
//!   carries the ban list across restarts
//! - `RelayServer`, which wires the above together around a `TcpListener`

pub mod client;
pub mod config;
pub mod connection;
pub mod console;
pub mod health;
pub mod registry;
pub mod room;
pub mod routing;

pub use client::{ClientHandle, Outbound};
pub use config::RelayConfig;
pub use console::{Command, Console, ConsoleExit};
pub use health::{StatusDocument, StatusReporter};
pub use registry::{Registry, RelayState};
pub use room::Room;
pub use routing::{DropReason, Routing};

use anchor_core::{RelayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Relay server: shared registry plus configuration
#[derive(Debug, Clone)]
pub struct RelayServer {
    registry: Arc<Registry>,
    config: Arc<RelayConfig>,
}

impl RelayServer {
    /// Create a server after validating `config`
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: Arc::new(Registry::new()),
            config: Arc::new(config),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let address = self.config.listen_address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| RelayError::ConnectionError(format!("bind {} failed: {}", address, e)))?;
        if let Ok(local) = listener.local_addr() {
            info!("Anchor relay listening on {}", local);
        }
        Ok(listener)
    }

    /// Accept connections forever, one task per client
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }
            tokio::spawn(connection::serve_connection(
                stream,
                peer,
                self.registry.clone(),
                self.config.clone(),
            ));
        }
    }

    /// Serve until the operator issues `stop` or the process gets Ctrl-C.
    ///
    /// Heartbeats and, when configured, the status file run alongside. A
    /// closed console stream leaves the relay serving.
    pub async fn run<R, W>(self, listener: TcpListener, console_in: R, console_out: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let heartbeat = tokio::spawn(health::heartbeat_loop(
            self.registry.clone(),
            self.config.heartbeat_interval,
        ));
        let reporter = self
            .config
            .status_file
            .as_ref()
            .map(|path| StatusReporter::new(path, self.config.status_interval));
        if let Some(reporter) = &reporter {
            match health::load_ban_list(reporter.path()).await {
                Ok(bans) if !bans.is_empty() => {
                    info!("Restored {} bans from {}", bans.len(), reporter.path().display());
                    self.registry.lock().await.restore_bans(bans);
                }
                Ok(_) => {}
                Err(e) => warn!("Could not read bans from {}: {}", reporter.path().display(), e),
            }
        }
        let status = reporter
            .clone()
            .map(|reporter| tokio::spawn(reporter.run(self.registry.clone())));

        let console = Console::new(self.registry.clone(), self.config.stop_grace);
        let operator = async {
            match console.run(console_in, console_out).await {
                Ok(ConsoleExit::Stop) => return,
                Ok(ConsoleExit::InputClosed) => {}
                Err(e) => error!("Console failed: {}", e),
            }
            std::future::pending::<()>().await
        };

        let outcome = tokio::select! {
            result = self.serve(listener) => result,
            _ = operator => {
                info!("Stopped by operator");
                Ok(())
            }
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("Interrupted, disconnecting clients"),
                    Err(e) => error!("Signal handler failed: {}", e),
                }
                console
                    .execute(Command::Stop {
                        text: console::DEFAULT_STOP_MESSAGE.to_string(),
                    })
                    .await;
                Ok(())
            }
        };

        heartbeat.abort();
        if let Some(status) = status {
            status.abort();
        }
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.write_once(&self.registry).await {
                warn!("Final status write to {} failed: {}", reporter.path().display(), e);
            }
        }
        outcome
    }
}
