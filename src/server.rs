//! ChatServer shared state and accept loop
//!
//! `ChatServer` owns the registry, the resolved settings and the server-wide
//! counters. It is cheap to clone and is passed explicitly to every
//! connection task. Broadcast fans a line out to every registered client
//! without ever waiting on a slow receiver.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{ChatError, TransportError};
use crate::handler::{reserve_slot, run_session};
use crate::registry::Registry;
use crate::stats::{ServerStats, StatsSnapshot};

/// Create the shutdown channel shared by listeners and sessions
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolve once shutdown is signalled or the sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Outcome of one broadcast call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Clients whose queue accepted the line
    pub delivered: usize,
    /// Clients skipped because their queue was full or closed
    pub dropped: usize,
}

struct Shared {
    settings: Settings,
    registry: Registry,
    stats: ServerStats,
}

/// The chat server
///
/// Constructed once at startup; all clones share the same state.
#[derive(Clone)]
pub struct ChatServer {
    shared: Arc<Shared>,
}

impl ChatServer {
    pub fn new(settings: Settings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                registry: Registry::new(),
                stats: ServerStats::new(),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Send `line` to every registered client without blocking
    ///
    /// Clients whose outbound queue is full miss this line. The message
    /// counter moves once per call.
    pub fn broadcast(&self, line: &str) -> BroadcastReport {
        let recipients = self.shared.registry.snapshot();
        let mut report = BroadcastReport::default();

        for client in &recipients {
            match client.try_send(line.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(ChatError::QueueFull) => {
                    report.dropped += 1;
                    debug!(nick = %client.nick, "outbound queue full, line dropped");
                }
                Err(_) => report.dropped += 1,
            }
        }

        self.shared.stats.record_message();
        report
    }

    /// Number of registered clients
    pub fn active_clients(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn total_messages(&self) -> u64 {
        self.shared.stats.total_messages()
    }

    pub fn uptime(&self) -> Duration {
        self.shared.stats.uptime()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            name: self.shared.settings.name.clone(),
            clients: self.active_clients(),
            uptime_sec: self.uptime().as_secs(),
            messages: self.total_messages(),
        }
    }

    /// Run one accepted connection to completion
    ///
    /// Connections over the per-address limit are dropped without a reply.
    pub async fn handle<S>(
        &self,
        stream: S,
        peer: IpAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChatError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let slot = reserve_slot(self, peer)?;
        run_session(self, stream, slot, shutdown).await
    }

    /// Like [`ChatServer::handle`], with a TLS handshake after admission
    pub async fn handle_tls(
        &self,
        stream: TcpStream,
        peer: IpAddr,
        acceptor: TlsAcceptor,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChatError> {
        let slot = reserve_slot(self, peer)?;

        let idle = self.settings().transport.idle_timeout;
        let accepted = tokio::select! {
            accepted = timeout(idle, acceptor.accept(stream)) => accepted,
            _ = wait_for_shutdown(&mut shutdown) => {
                debug!("Shutdown during TLS handshake with {}", peer);
                return Ok(());
            }
        };
        let tls_stream = match accepted {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => return Err(TransportError::Io(e).into()),
            Err(_) => return Err(TransportError::Timeout.into()),
        };

        run_session(self, tls_stream, slot, shutdown).await
    }

    /// Accept connections until shutdown, then wait for every session
    ///
    /// With `tls` set, each connection is wrapped in TLS before the
    /// handshake. The listener is dropped as soon as shutdown is signalled.
    pub async fn serve(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        shutdown: watch::Receiver<bool>,
    ) {
        let kind = if tls.is_some() { "tls" } else { "tcp" };
        if let Ok(addr) = listener.local_addr() {
            info!("Listening for {} connections on {}", kind, addr);
        }

        let mut stop = shutdown.clone();
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New {} connection from {}", kind, addr);
                        let server = self.clone();
                        let tls = tls.clone();
                        let shutdown = shutdown.clone();

                        sessions.spawn(async move {
                            let result = match tls {
                                Some(acceptor) => {
                                    server.handle_tls(stream, addr.ip(), acceptor, shutdown).await
                                }
                                None => server.handle(stream, addr.ip(), shutdown).await,
                            };
                            if let Err(e) = result {
                                debug!("Session from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Session task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!(
            "{} listener closed, waiting for {} sessions",
            kind,
            sessions.len()
        );

        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                warn!("Session task failed: {}", e);
            }
        }
    }
}
