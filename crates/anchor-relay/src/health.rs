//! Liveness: idle-client heartbeats and the status file read by the
//! external health watcher

use crate::registry::{Registry, RelayState};
use anchor_core::{RelayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Snapshot written to the status file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    pub last_stats_heartbeat: DateTime<Utc>,
    pub online_count: usize,
    pub room_count: usize,
    pub unique_count: usize,
    pub pid: u32,
    #[serde(rename = "clientSHAs")]
    pub client_shas: Vec<String>,
    /// Digests of banned peer addresses; read back on the next start
    #[serde(default)]
    pub ban_list: Vec<String>,
}

impl StatusDocument {
    pub fn capture(state: &RelayState, now: DateTime<Utc>) -> Self {
        let client_shas: Vec<String> = state.seen_peers().iter().cloned().collect();
        Self {
            last_stats_heartbeat: now,
            online_count: state.client_count(),
            room_count: state.room_count(),
            unique_count: client_shas.len(),
            pid: std::process::id(),
            client_shas,
            ban_list: state.banned().iter().cloned().collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SavedBans {
    #[serde(default)]
    ban_list: Vec<String>,
}

/// Ban list from an earlier status document. A missing file means no bans.
pub async fn load_ban_list(path: &Path) -> Result<Vec<String>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(RelayError::ConnectionError(format!(
                "reading {}: {}",
                path.display(),
                e
            )));
        }
    };
    let saved: SavedBans = serde_json::from_slice(&raw)?;
    Ok(saved.ban_list)
}

/// Periodic writer for the status file
#[derive(Debug, Clone)]
pub struct StatusReporter {
    path: PathBuf,
    interval: Duration,
}

impl StatusReporter {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Capture the registry and replace the status file in one rename
    pub async fn write_once(&self, registry: &Registry) -> Result<StatusDocument> {
        let document = {
            let state = registry.lock().await;
            StatusDocument::capture(&state, Utc::now())
        };
        let json = serde_json::to_vec_pretty(&document)?;

        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, &json).await.map_err(|e| {
            RelayError::ConnectionError(format!("writing {}: {}", temp.display(), e))
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            RelayError::ConnectionError(format!("replacing {}: {}", self.path.display(), e))
        })?;
        debug!("Status written to {}", self.path.display());
        Ok(document)
    }

    /// Write every interval, forever. Failures are logged and retried on
    /// the next tick.
    pub async fn run(self, registry: Arc<Registry>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.write_once(&registry).await {
                warn!("Status file update failed: {}", e);
            }
        }
    }
}

/// Every `interval`, heartbeat clients idle for at least that long and log
/// the online count
pub async fn heartbeat_loop(registry: Arc<Registry>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let mut state = registry.lock().await;
        let sent = state.send_heartbeats(interval, Instant::now());
        if !state.quiet() {
            info!(
                "{} clients online in {} rooms ({} heartbeats)",
                state.client_count(),
                state.room_count(),
                sent
            );
        }
    }
}
