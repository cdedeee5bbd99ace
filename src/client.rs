//! Client struct definition
//!
//! A registered client as seen by the registry and the broadcast engine,
//! plus the per-client message throttle owned by its handler.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::types::ClientId;

/// Default outbound queue capacity per client
pub const DEFAULT_OUTBOUND_QUEUE: usize = 16;

/// Registered client information
///
/// Cheap to clone: the outbound queue is shared through the sender.
#[derive(Debug, Clone)]
pub struct Client {
    /// Connection identifier
    pub id: ClientId,
    /// Final nickname, unique in the registry
    pub nick: String,
    /// Source address
    pub addr: IpAddr,
    /// Server → Client line queue, drained by the writer task
    pub sender: mpsc::Sender<String>,
}

impl Client {
    pub fn new(id: ClientId, nick: String, addr: IpAddr, sender: mpsc::Sender<String>) -> Self {
        Self {
            id,
            nick,
            addr,
            sender,
        }
    }

    /// Queue a line without waiting
    ///
    /// Fails with `QueueFull` when the writer is behind.
    pub fn try_send(&self, line: String) -> Result<(), ChatError> {
        self.sender.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChatError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ChatError::ChannelClosed,
        })
    }

    /// Queue a line, waiting for capacity
    ///
    /// Only used for replies to this client's own commands.
    pub async fn send(&self, line: String) -> Result<(), ChatError> {
        self.sender
            .send(line)
            .await
            .map_err(|_| ChatError::ChannelClosed)
    }
}

/// Hard per-client throttle for `MSG`
///
/// A message is accepted only if at least `interval` has passed since the
/// previously accepted one. Rejected messages do not move the window.
#[derive(Debug)]
pub struct MessageThrottle {
    interval: Duration,
    last_accepted: Option<Instant>,
}

impl MessageThrottle {
    /// `max_per_sec` is clamped to at least 1
    pub fn new(max_per_sec: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / max_per_sec.max(1),
            last_accepted: None,
        }
    }

    /// Returns whether a message arriving at `now` is accepted
    pub fn try_accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.interval {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }
}
