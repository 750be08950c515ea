//! peerlog transport layer.
//!
//! Defines the contracts the protocol layer is written against, so the
//! broker and the replicated log never depend on a concrete network stack:
//!
//! - [`DuplexChannel`]: an ordered bidirectional message link.
//! - [`SignalChannel`]: per-key relay mailboxes carrying opaque envelopes.
//! - [`PeerConnector`] / [`PeerTransport`]: something that can be signaled
//!   into a connected duplex channel.
//!
//! In-process implementations of all three live in [`memory`]; a
//! length-prefixed channel over any tokio byte stream lives in [`framed`].
//!
//! # Quick start
//!
//! ```rust
//! use peerlog_transport::{DuplexChannel, MemoryChannel};
//!
//! # async fn example() -> Result<(), peerlog_transport::TransportError> {
//! let (left, right) = MemoryChannel::pair();
//! let mut inbound = right.listen();
//! left.send(bytes::Bytes::from_static(b"hello"))?;
//! assert_eq!(inbound.recv().await.as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod error;
pub mod framed;
pub mod memory;
mod peer;
mod signal;

pub use channel::{DuplexChannel, Listeners, Subscription};
pub use config::TransportConfig;
pub use error::TransportError;
pub use framed::FramedChannel;
pub use memory::{MemoryChannel, MemoryPeer, MemoryPeerConnector, MemoryRelay};
pub use peer::{PeerConnector, PeerEvent, PeerTransport};
pub use signal::SignalChannel;

use std::fmt;
use std::str::FromStr;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};

/// Peer identity and relay mailbox address, a 32-byte Ed25519 public key.
///
/// Displayed and parsed as lowercase hex. The hex form is canonical, so
/// comparing two keys as strings gives the same answer as [`Ord`], which
/// compares raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = HEXLOWER.encode(&self.0[..6]);
        write!(f, "PublicKey({hex}...)")
    }
}

impl FromStr for PublicKey {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|_| TransportError::InvalidPublicKey(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidPublicKey(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_hex_roundtrip() {
        let key = PublicKey::from_bytes([0xAB; 32]);
        let text = key.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text, "ab".repeat(32));
        assert_eq!(text.parse::<PublicKey>().unwrap(), key);
    }

    #[test]
    fn public_key_accepts_uppercase_hex() {
        let key: PublicKey = "AB".repeat(32).parse().unwrap();
        assert_eq!(key, PublicKey::from_bytes([0xAB; 32]));
    }

    #[test]
    fn public_key_rejects_wrong_length() {
        assert!("abcd".parse::<PublicKey>().is_err());
        assert!("zz".repeat(32).parse::<PublicKey>().is_err());
    }

    #[test]
    fn byte_order_matches_string_order() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[0] = 0x0f;
        high[0] = 0xa0;
        let (low, high) = (PublicKey::from_bytes(low), PublicKey::from_bytes(high));
        assert!(low < high);
        assert!(low.to_string() < high.to_string());
    }

    #[test]
    fn public_key_serde_as_string() {
        let key = PublicKey::from_bytes([1; 32]);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
