//! Connection handler
//!
//! Drives one client through `Connecting → AwaitingHello → Active → Closed`.
//!
//! After the handshake the write half of the transport moves into a writer
//! task that drains the client's bounded outbound queue. The handler keeps
//! the read half and only talks to the writer through that queue.
//!
//! Teardown is driven by ownership: the slot reservation and the nickname
//! registration are guards held by the session, so leaving the session for
//! any reason releases each of them exactly once.

use std::net::IpAddr;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::client::{Client, MessageThrottle};
use crate::error::{ChatError, TransportError};
use crate::message::{ClientMessage, ErrorCode, ServerMessage};
use crate::registry::{Registration, SlotReservation};
use crate::server::{wait_for_shutdown, ChatServer};
use crate::transport::{self, LineReader, LineWriter};
use crate::types::{ClientId, Nickname};

/// `Connecting`: reserve a per-address slot before any other work
pub(crate) fn reserve_slot(
    server: &ChatServer,
    peer: IpAddr,
) -> Result<SlotReservation, ChatError> {
    let limit = server.settings().max_conns_per_ip;
    match server.registry().try_reserve_slot(peer, limit) {
        Some(slot) => Ok(slot),
        None => {
            info!(
                "Refusing connection from {}: {} connections already open",
                peer, limit
            );
            Err(ChatError::SlotLimitReached(peer))
        }
    }
}

/// Run a session on an admitted connection until it reaches `Closed`
///
/// Returns `Ok` for `BYE` and shutdown, otherwise the reason the session
/// ended.
pub(crate) async fn run_session<S>(
    server: &ChatServer,
    stream: S,
    slot: SlotReservation,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ChatError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = ClientId::new();
    let peer = slot.addr();
    let span = info_span!("session", %id, %peer);

    async move {
        debug!("Client {} connected from {}", id, peer);
        let result = drive(server, stream, id, peer, shutdown).await;
        // Slot goes last: the count covers every connection not yet closed.
        drop(slot);
        result
    }
    .instrument(span)
    .await
}

async fn drive<S>(
    server: &ChatServer,
    stream: S,
    id: ClientId,
    peer: IpAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ChatError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let settings = server.settings();
    let (mut reader, mut writer) = transport::split(stream, &settings.transport);
    let (tx, rx) = mpsc::channel::<String>(settings.outbound_queue);

    let registration =
        match handshake(server, &mut reader, &mut writer, id, peer, &tx, &mut shutdown).await {
            Ok(Some(registration)) => registration,
            Ok(None) => {
                writer.close().await;
                return Ok(());
            }
            Err(e) => {
                writer.close().await;
                return Err(e);
            }
        };

    let nick = registration.nick().to_string();
    info!("Client {} joined as '{}'", id, nick);

    let mut writer_task = tokio::spawn(write_loop(writer, rx));
    let me = Client::new(id, nick.clone(), peer, tx);

    let mut session = Session {
        server,
        nick: &nick,
        throttle: MessageThrottle::new(settings.max_msgs_per_sec),
        me: &me,
    };
    let (result, writer_done) =
        active_loop(&mut session, &mut reader, &mut writer_task, &mut shutdown).await;

    // Closed: unregister, close the queue, let the writer drain, close the stream.
    drop(registration);
    drop(me);
    if !writer_done {
        finish_writer(writer_task, settings.transport.write_timeout).await;
    }
    drop(reader);

    info!("Client '{}' disconnected", nick);
    result
}

/// `AwaitingHello`: validate the first line and register the nickname
///
/// `Ok(None)` means shutdown arrived before the client said hello.
async fn handshake<R, W>(
    server: &ChatServer,
    reader: &mut LineReader<R>,
    writer: &mut LineWriter<W>,
    id: ClientId,
    peer: IpAddr,
    tx: &mpsc::Sender<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<Option<Registration>, ChatError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let line = tokio::select! {
        line = reader.read_line() => line?,
        _ = wait_for_shutdown(shutdown) => return Ok(None),
    };

    let requested = match ClientMessage::parse(&line) {
        ClientMessage::Hello(arg) => Nickname::parse(&arg),
        _ => None,
    };
    let Some(requested) = requested else {
        warn!("Handshake rejected from {}", peer);
        reject(writer).await;
        return Err(ChatError::HandshakeRejected);
    };

    let registration = match server
        .registry()
        .register_unique(&requested, |nick| Client::new(id, nick, peer, tx.clone()))
    {
        Ok(registration) => registration,
        Err(e) => {
            warn!("Handshake from {} failed: {}", peer, e);
            reject(writer).await;
            return Err(e);
        }
    };

    let ack = ServerMessage::Hello {
        nick: registration.nick().to_string(),
    };
    writer.write_line(&ack.to_line()).await?;

    for line in &server.settings().motd {
        let motd = ServerMessage::Motd { line: line.clone() };
        writer.write_line(&motd.to_line()).await?;
    }

    Ok(Some(registration))
}

async fn reject<W: AsyncWrite + Unpin>(writer: &mut LineWriter<W>) {
    let error = ServerMessage::Error {
        code: ErrorCode::HandshakeRejected,
    };
    if let Err(e) = writer.write_line(&error.to_line()).await {
        debug!("Failed to send handshake rejection: {}", e);
    }
}

struct Session<'a> {
    server: &'a ChatServer,
    nick: &'a str,
    throttle: MessageThrottle,
    me: &'a Client,
}

/// What the active loop should do after one command
enum Flow {
    Continue,
    Close,
}

impl Session<'_> {
    async fn on_message(&mut self, message: ClientMessage) -> Flow {
        match message {
            ClientMessage::Msg(text) => {
                let relay = ServerMessage::Msg {
                    from: self.nick.to_string(),
                    text,
                }
                .to_line();
                let max = self.server.settings().transport.max_line_len;
                if relay.len() > max {
                    debug!("Relay from '{}' exceeds {} bytes, dropped", self.nick, max);
                    return Flow::Continue;
                }

                // Oversized relays never reach the throttle window.
                if !self.throttle.try_accept(Instant::now()) {
                    debug!("Message from '{}' throttled", self.nick);
                    return Flow::Continue;
                }

                let report = self.server.broadcast(&relay);
                debug!(
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "Broadcast from '{}'",
                    self.nick
                );
                Flow::Continue
            }
            ClientMessage::Ping => match self.me.send(ServerMessage::Pong.to_line()).await {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Close,
            },
            ClientMessage::Bye => {
                let _ = self.me.send(ServerMessage::Cya.to_line()).await;
                Flow::Close
            }
            ClientMessage::Hello(_) | ClientMessage::Unknown(_) => {
                debug!("Ignoring command from '{}'", self.nick);
                Flow::Continue
            }
        }
    }
}

/// `Active`: returns the session result and whether the writer already ended
async fn active_loop<R: AsyncRead + Unpin>(
    session: &mut Session<'_>,
    reader: &mut LineReader<R>,
    writer_task: &mut JoinHandle<Result<(), TransportError>>,
    shutdown: &mut watch::Receiver<bool>,
) -> (Result<(), ChatError>, bool) {
    loop {
        tokio::select! {
            line = reader.read_line() => match line {
                Ok(line) => {
                    if let Flow::Close = session.on_message(ClientMessage::parse(&line)).await {
                        return (Ok(()), false);
                    }
                }
                Err(e) => {
                    debug!("Read from '{}' failed: {}", session.nick, e);
                    return (Err(e.into()), false);
                }
            },
            joined = &mut *writer_task => {
                let result = match joined {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.into()),
                    Err(_) => Err(ChatError::ChannelClosed),
                };
                debug!("Writer for '{}' stopped early", session.nick);
                return (result, true);
            }
            _ = wait_for_shutdown(shutdown) => {
                debug!("Shutdown, closing '{}'", session.nick);
                return (Ok(()), false);
            }
        }
    }
}

/// Writer task: drain the outbound queue onto the transport
///
/// Ends when every sender is gone or a write fails, then closes the
/// transport's write side.
async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: LineWriter<W>,
    mut rx: mpsc::Receiver<String>,
) -> Result<(), TransportError> {
    let mut result = Ok(());
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_line(&line).await {
            result = Err(e);
            break;
        }
    }
    rx.close();
    writer.close().await;
    result
}

/// Give the writer one write deadline to drain, then abort it
async fn finish_writer(
    mut writer_task: JoinHandle<Result<(), TransportError>>,
    grace: std::time::Duration,
) {
    if timeout(grace, &mut writer_task).await.is_err() {
        debug!("Writer did not drain in time, aborting");
        writer_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::transport::TransportConfig;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn settings() -> Settings {
        Settings {
            motd: vec!["welcome".to_string()],
            transport: TransportConfig {
                idle_timeout: Duration::from_secs(5),
                ..TransportConfig::default()
            },
            ..Settings::default()
        }
    }

    struct Peer {
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        write: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn send(&mut self, line: &str) {
            self.write.write_all(line.as_bytes()).await.unwrap();
            self.write.write_all(b"\n").await.unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            timeout(Duration::from_secs(2), self.lines.next_line())
                .await
                .expect("timed out waiting for line")
                .unwrap()
        }
    }

    fn connect(
        server: &ChatServer,
        shutdown: watch::Receiver<bool>,
    ) -> (Peer, JoinHandle<Result<(), ChatError>>) {
        connect_with_buffer(server, shutdown, 64 * 1024)
    }

    fn connect_with_buffer(
        server: &ChatServer,
        shutdown: watch::Receiver<bool>,
        buffer: usize,
    ) -> (Peer, JoinHandle<Result<(), ChatError>>) {
        let (ours, theirs) = duplex(buffer);
        let server = server.clone();
        let handle = tokio::spawn(async move { server.handle(ours, LOCAL, shutdown).await });
        let (read, write) = tokio::io::split(theirs);
        let peer = Peer {
            lines: BufReader::new(read).lines(),
            write,
        };
        (peer, handle)
    }

    #[tokio::test]
    async fn test_handshake_and_motd() {
        let server = ChatServer::new(settings());
        let (_tx, rx) = watch::channel(false);
        let (mut peer, _handle) = connect(&server, rx);

        peer.send("HELLO alice").await;
        assert_eq!(peer.recv().await.unwrap(), "HELLO alice");
        assert_eq!(peer.recv().await.unwrap(), "MOTD welcome");
        assert!(server.registry().contains("alice"));
    }

    #[tokio::test]
    async fn test_bad_first_command_rejected() {
        let server = ChatServer::new(settings());
        let (_tx, rx) = watch::channel(false);
        let (mut peer, handle) = connect(&server, rx);

        peer.send("MSG hi").await;
        assert_eq!(peer.recv().await.unwrap(), "ERROR 100");
        assert!(peer.recv().await.is_none());
        assert!(matches!(
            handle.await.unwrap(),
            Err(ChatError::HandshakeRejected)
        ));
        assert_eq!(server.registry().connections_from(LOCAL), 0);
    }

    #[tokio::test]
    async fn test_invalid_nick_rejected() {
        let server = ChatServer::new(settings());
        let (_tx, rx) = watch::channel(false);
        let (mut peer, handle) = connect(&server, rx);

        peer.send("HELLO a!").await;
        assert_eq!(peer.recv().await.unwrap(), "ERROR 100");
        assert!(handle.await.unwrap().is_err());
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_ping_unknown_and_bye() {
        let server = ChatServer::new(settings());
        let (_tx, rx) = watch::channel(false);
        let (mut peer, handle) = connect(&server, rx);

        peer.send("HELLO alice").await;
        peer.recv().await.unwrap();
        peer.recv().await.unwrap();

        peer.send("JOIN #rust").await;
        peer.send("HELLO again").await;
        peer.send("PING").await;
        assert_eq!(peer.recv().await.unwrap(), "PONG");

        peer.send("BYE").await;
        assert_eq!(peer.recv().await.unwrap(), "CYA");
        assert!(peer.recv().await.is_none());

        assert!(handle.await.unwrap().is_ok());
        assert!(server.registry().is_empty());
        assert_eq!(server.registry().connections_from(LOCAL), 0);
    }

    #[tokio::test]
    async fn test_own_message_relayed_and_throttled() {
        let server = ChatServer::new(settings());
        let (_tx, rx) = watch::channel(false);
        let (mut peer, _handle) = connect(&server, rx);

        peer.send("HELLO alice").await;
        peer.recv().await.unwrap();
        peer.recv().await.unwrap();

        peer.send("MSG one").await;
        peer.send("MSG two").await;
        peer.send("PING").await;
        assert_eq!(peer.recv().await.unwrap(), "MSG alice: one");
        assert_eq!(peer.recv().await.unwrap(), "PONG");
        assert_eq!(server.total_messages(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let server = ChatServer::new(settings());
        let (tx, rx) = watch::channel(false);
        let (mut peer, handle) = connect(&server, rx);

        peer.send("HELLO alice").await;
        peer.recv().await.unwrap();
        peer.recv().await.unwrap();

        tx.send(true).unwrap();
        assert!(peer.recv().await.is_none());
        assert!(timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_slot_limit_drops_silently() {
        let server = ChatServer::new(Settings {
            max_conns_per_ip: 1,
            ..settings()
        });
        let (_tx, rx) = watch::channel(false);
        let (_first, _h1) = connect(&server, rx.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (mut second, h2) = connect(&server, rx);
        assert!(second.recv().await.is_none());
        assert!(matches!(
            h2.await.unwrap(),
            Err(ChatError::SlotLimitReached(_))
        ));
        assert_eq!(server.registry().connections_from(LOCAL), 1);
    }

    #[tokio::test]
    async fn test_stalled_writer_closes_session() {
        let server = ChatServer::new(Settings {
            transport: TransportConfig {
                idle_timeout: Duration::from_secs(5),
                write_timeout: Duration::from_millis(100),
                ..TransportConfig::default()
            },
            ..settings()
        });
        let (_tx, rx) = watch::channel(false);
        // Room for the handshake replies only; the peer never reads.
        let (mut peer, handle) = connect_with_buffer(&server, rx, 64);

        peer.send("HELLO alice").await;
        for _ in 0..100 {
            if server.registry().contains("alice") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.registry().contains("alice"));

        let filler = format!("MSG bob: {}", "x".repeat(100));
        for _ in 0..10 {
            server.broadcast(&filler);
        }

        let result = timeout(Duration::from_secs(2), handle)
            .await
            .expect("session did not close")
            .unwrap();
        assert!(matches!(result, Err(ChatError::Transport(_))));
        assert!(!server.registry().contains("alice"));
        assert_eq!(server.registry().connections_from(LOCAL), 0);
    }

    #[tokio::test]
    async fn test_exhausted_nick_rejected() {
        let server = ChatServer::new(settings());
        let (queue, _queue_rx) = mpsc::channel(1);
        let make = |nick: String| Client::new(ClientId::new(), nick, LOCAL, queue.clone());
        let alice = Nickname::parse("alice").unwrap();

        // Take "alice" and every "alice_NNNN" it could be suffixed to.
        let mut taken = vec![server.registry().register_unique(&alice, make).unwrap()];
        for n in 0..10_000 {
            let suffix = move || format!("_{:04}", n);
            taken.push(
                server
                    .registry()
                    .register_unique_with(&alice, suffix, make)
                    .unwrap(),
            );
        }

        let (_tx, rx) = watch::channel(false);
        let (mut peer, handle) = connect(&server, rx);
        peer.send("HELLO alice").await;
        assert_eq!(peer.recv().await.unwrap(), "ERROR 100");
        assert!(peer.recv().await.is_none());
        assert!(matches!(
            handle.await.unwrap(),
            Err(ChatError::NickExhausted(nick)) if nick == "alice"
        ));
        assert_eq!(server.registry().len(), 10_001);
        assert_eq!(server.registry().connections_from(LOCAL), 0);
    }

    #[tokio::test]
    async fn test_oversized_relay_keeps_throttle_window() {
        let server = ChatServer::new(Settings {
            transport: TransportConfig {
                max_line_len: 32,
                idle_timeout: Duration::from_secs(5),
                ..TransportConfig::default()
            },
            ..settings()
        });
        let (_tx, rx) = watch::channel(false);
        let (mut peer, _handle) = connect(&server, rx);

        peer.send("HELLO alice").await;
        peer.recv().await.unwrap();
        peer.recv().await.unwrap();

        // Fits as a command, but "MSG alice: " pushes the relay past 32 bytes.
        peer.send(&format!("MSG {}", "x".repeat(25))).await;
        peer.send("MSG hi").await;
        peer.send("PING").await;
        assert_eq!(peer.recv().await.unwrap(), "MSG alice: hi");
        assert_eq!(peer.recv().await.unwrap(), "PONG");
        assert_eq!(server.total_messages(), 1);
    }
}
