//! Line-oriented broadcast chat server
//!
//! Clients connect over TCP or TLS, register a nickname with `HELLO`, and
//! exchange single-line `MSG` lines relayed to every connected peer.
//!
//! # Features
//! - Newline framing with size limits and read/write deadlines
//! - Per-address connection caps
//! - Unique nicknames with random numeric suffixes on collision
//! - Per-client message throttling
//! - Best-effort broadcast that never waits on slow receivers
//! - Graceful shutdown
//!
//! # Architecture
//! - `ChatServer` holds the shared registry behind one lock
//! - Each connection runs a handler task plus a writer task
//! - Handler and writer only communicate through a bounded `mpsc` queue
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use linechat::{shutdown_channel, ChatServer, Settings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:6667").await.unwrap();
//!     let (_stop, shutdown) = shutdown_channel();
//!
//!     ChatServer::new(Settings::default())
//!         .serve(listener, None, shutdown)
//!         .await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;
pub mod stats;
pub mod tls;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use client::{Client, MessageThrottle};
pub use config::{Config, ConfigError, Settings};
pub use error::{ChatError, TransportError};
pub use message::{split_command, ClientMessage, ErrorCode, ServerMessage};
pub use registry::{Registration, Registry, SlotReservation};
pub use server::{shutdown_channel, wait_for_shutdown, BroadcastReport, ChatServer};
pub use stats::{ServerStats, StatsSnapshot};
pub use tls::{build_acceptor, TlsError};
pub use transport::{LineReader, LineWriter, TransportConfig};
pub use types::{ClientId, Nickname};
