//! Server-wide counters and the periodic stats snapshot
//!
//! Counters are append-only and read without taking the registry lock.
//! The snapshot writer serializes them to a JSON file that `linechat info`
//! prints.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::server::{wait_for_shutdown, ChatServer};

/// Monotonic server counters
#[derive(Debug)]
pub struct ServerStats {
    started_at: Instant,
    total_messages: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_messages: AtomicU64::new(0),
        }
    }

    /// Count one broadcast
    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view written to the stats file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub clients: usize,
    pub uptime_sec: u64,
    pub messages: u64,
}

/// Write one snapshot as pretty JSON
pub async fn write_snapshot(path: &Path, snapshot: &StatsSnapshot) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    tokio::fs::write(path, json).await
}

/// Read a snapshot file back
pub async fn read_snapshot(path: &Path) -> std::io::Result<StatsSnapshot> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Rewrite `path` every `interval` until shutdown
pub fn spawn_snapshot_writer(
    server: ChatServer,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = server.stats_snapshot();
                    match write_snapshot(&path, &snapshot).await {
                        Ok(()) => debug!(path = %path.display(), "stats snapshot written"),
                        Err(e) => warn!("Failed to write stats to {}: {}", path.display(), e),
                    }
                }
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }
    })
}
