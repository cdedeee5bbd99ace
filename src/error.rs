//! Error types for the chat server
//!
//! Transport-level failures are always terminal for the connection.
//! Session-level errors describe why a handler left its loop.
//! Uses thiserror for ergonomic error definitions.

use std::net::IpAddr;

use thiserror::Error;

/// Line transport errors
///
/// Every variant ends the connection it occurred on.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No complete line arrived (or the write did not finish) before the deadline
    #[error("Timed out")]
    Timeout,

    /// Line exceeds the configured maximum size
    #[error("Line too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    /// Embedded newline/carriage return, or bytes that are not UTF-8
    #[error("Invalid line framing")]
    InvalidFraming,

    /// Peer closed the stream
    #[error("Connection closed")]
    Closed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session errors
///
/// Covers terminal conditions (connection closes) and the single
/// non-terminal `QueueFull` delivery drop.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Transport failure (fatal)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// First command was not HELLO or the nickname is invalid
    #[error("Handshake rejected")]
    HandshakeRejected,

    /// Suffixed nickname collided as well
    #[error("No free nickname derived from '{0}'")]
    NickExhausted(String),

    /// Source address is over its connection cap
    #[error("Connection limit reached for {0}")]
    SlotLimitReached(IpAddr),

    /// Recipient outbound queue is full (message dropped for that client)
    #[error("Outbound queue full")]
    QueueFull,

    /// Recipient outbound queue is closed (internal channel broken)
    #[error("Channel closed")]
    ChannelClosed,
}
