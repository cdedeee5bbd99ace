//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based connection identifier used in logs
//! - `Nickname`: validated handshake nickname

use rand::rngs::OsRng;
use rand::Rng;
use uuid::Uuid;

/// Minimum nickname length in bytes
pub const NICK_MIN_LEN: usize = 3;
/// Maximum nickname length in bytes
pub const NICK_MAX_LEN: usize = 20;

/// Unique connection identifier (newtype pattern)
///
/// Wraps a UUID v4. Assigned when a connection is accepted, before the
/// client has a nickname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nickname requested in a `HELLO` line
///
/// 3 to 20 characters drawn from ASCII letters, digits and underscore.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Nickname(String);

impl Nickname {
    /// Validate a nickname, returning `None` if it breaks the policy
    pub fn parse(raw: &str) -> Option<Self> {
        if is_valid_nick(raw) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Nickname {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Nickname policy check
pub fn is_valid_nick(nick: &str) -> bool {
    (NICK_MIN_LEN..=NICK_MAX_LEN).contains(&nick.len())
        && nick
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Generate `_0000`..`_9999`, uniformly, from the OS random source
pub fn random_suffix() -> String {
    let n: u16 = OsRng.gen_range(0..10_000);
    format!("_{:04}", n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_unique() {
        let id1 = ClientId::new();
        let id2 = ClientId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_nick_length_bounds() {
        assert!(Nickname::parse("ab").is_none());
        assert!(Nickname::parse("abc").is_some());
        assert!(Nickname::parse(&"a".repeat(20)).is_some());
        assert!(Nickname::parse(&"a".repeat(21)).is_none());
    }

    #[test]
    fn test_nick_charset() {
        assert!(Nickname::parse("Alice_99").is_some());
        assert!(Nickname::parse("al ice").is_none());
        assert!(Nickname::parse("al-ice").is_none());
        assert!(Nickname::parse("alicé").is_none());
        assert!(Nickname::parse("").is_none());
    }

    #[test]
    fn test_suffix_format() {
        for _ in 0..100 {
            let suffix = random_suffix();
            assert_eq!(suffix.len(), 5);
            assert!(suffix.starts_with('_'));
            assert!(suffix[1..].bytes().all(|b| b.is_ascii_digit()));
        }
    }
}
