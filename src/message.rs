//! Message protocol definitions
//!
//! Newline-delimited text protocol: one `COMMAND argument` per line.
//! Arguments are opaque strings; the only grammar is the first space.

use std::fmt;

/// Split a line at the first space into `(command, argument)`
///
/// The argument is trimmed of surrounding whitespace and is empty when the
/// line has no space at all.
pub fn split_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    }
}

/// Client → Server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Handshake with the requested nickname (unvalidated)
    Hello(String),
    /// Chat message
    Msg(String),
    /// Liveness probe
    Ping,
    /// Graceful disconnect
    Bye,
    /// Anything else (ignored by the handler)
    Unknown(String),
}

impl ClientMessage {
    /// Parse one line. Commands are case-sensitive.
    pub fn parse(line: &str) -> Self {
        let (cmd, arg) = split_command(line);
        match cmd {
            "HELLO" => ClientMessage::Hello(arg.to_string()),
            "MSG" => ClientMessage::Msg(arg.to_string()),
            "PING" => ClientMessage::Ping,
            "BYE" => ClientMessage::Bye,
            other => ClientMessage::Unknown(other.to_string()),
        }
    }
}

/// Server → Client message
///
/// `Display` renders the wire line without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Handshake ack with the final (possibly suffixed) nickname
    Hello { nick: String },
    /// One message-of-the-day line
    Motd { line: String },
    /// Protocol error code
    Error { code: ErrorCode },
    /// Chat relay
    Msg { from: String, text: String },
    /// Reply to PING
    Pong,
    /// Reply to BYE
    Cya,
}

/// Error codes for ServerMessage::Error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad first command or invalid nickname
    HandshakeRejected,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::HandshakeRejected => 100,
        }
    }
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMessage::Hello { nick } => write!(f, "HELLO {}", nick),
            ServerMessage::Motd { line } => write!(f, "MOTD {}", line),
            ServerMessage::Error { code } => write!(f, "ERROR {}", code.as_u16()),
            ServerMessage::Msg { from, text } => write!(f, "MSG {}: {}", from, text),
            ServerMessage::Pong => f.write_str("PONG"),
            ServerMessage::Cya => f.write_str("CYA"),
        }
    }
}

impl ServerMessage {
    /// Render to an owned wire line
    pub fn to_line(&self) -> String {
        self.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("MSG hello world"), ("MSG", "hello world"));
        assert_eq!(split_command("PING"), ("PING", ""));
        assert_eq!(split_command("HELLO   alice  "), ("HELLO", "alice"));
        assert_eq!(split_command(""), ("", ""));
        assert_eq!(split_command("MSG "), ("MSG", ""));
    }

    #[test]
    fn test_client_message_parse() {
        assert_eq!(
            ClientMessage::parse("HELLO alice"),
            ClientMessage::Hello("alice".to_string())
        );
        assert_eq!(
            ClientMessage::parse("MSG  hi there "),
            ClientMessage::Msg("hi there".to_string())
        );
        assert_eq!(ClientMessage::parse("PING"), ClientMessage::Ping);
        assert_eq!(ClientMessage::parse("PING extra"), ClientMessage::Ping);
        assert_eq!(ClientMessage::parse("BYE"), ClientMessage::Bye);
    }

    #[test]
    fn test_commands_are_case_sensitive() {
        assert_eq!(
            ClientMessage::parse("hello alice"),
            ClientMessage::Unknown("hello".to_string())
        );
        assert_eq!(
            ClientMessage::parse("JOIN #rust"),
            ClientMessage::Unknown("JOIN".to_string())
        );
    }

    #[test]
    fn test_server_message_render() {
        let hello = ServerMessage::Hello {
            nick: "alice_0001".to_string(),
        };
        assert_eq!(hello.to_line(), "HELLO alice_0001");

        let relay = ServerMessage::Msg {
            from: "alice".to_string(),
            text: "hi".to_string(),
        };
        assert_eq!(relay.to_line(), "MSG alice: hi");

        let error = ServerMessage::Error {
            code: ErrorCode::HandshakeRejected,
        };
        assert_eq!(error.to_line(), "ERROR 100");

        assert_eq!(ServerMessage::Pong.to_line(), "PONG");
        assert_eq!(ServerMessage::Cya.to_line(), "CYA");
        assert_eq!(
            ServerMessage::Motd {
                line: "welcome".to_string()
            }
            .to_line(),
            "MOTD welcome"
        );
    }
}
