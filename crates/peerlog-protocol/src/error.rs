use peerlog_transport::PublicKey;

/// Protocol-level errors.
///
/// Wraps transport errors and adds the crypto, broker and log variants.
/// [`ProtocolError::Cancelled`] is reserved for intentional teardown so
/// callers can tell it apart from a failure.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("transport error: {0}")]
    Transport(#[from] peerlog_transport::TransportError),

    #[error("invalid envelope: {reason}")]
    InvalidEnvelope { reason: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("cancelled")]
    Cancelled,

    #[error("connection to {peer} failed: {reason}")]
    ConnectionFailed { peer: PublicKey, reason: String },

    #[error("connection broker is shut down")]
    BrokerClosed,

    #[error("batch starts at {start} but local log has {length} items")]
    GapInBatch { start: u64, length: u64 },

    #[error("channel closed")]
    ChannelClosed,

    #[error("policy check failed: {0}")]
    Policy(String),
}

impl ProtocolError {
    /// True for the teardown outcome, false for every real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProtocolError::Cancelled)
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_connection_failed() {
        let err = ProtocolError::ConnectionFailed {
            peer: PublicKey::from_bytes([0xab; 32]),
            reason: "ice failed".into(),
        };
        assert_eq!(
            err.to_string(),
            format!("connection to {} failed: ice failed", "ab".repeat(32))
        );
    }

    #[test]
    fn test_display_gap() {
        let err = ProtocolError::GapInBatch {
            start: 7,
            length: 3,
        };
        assert_eq!(err.to_string(), "batch starts at 7 but local log has 3 items");
    }

    #[test]
    fn test_cancelled_is_distinguished() {
        assert!(ProtocolError::Cancelled.is_cancelled());
        assert!(!ProtocolError::ChannelClosed.is_cancelled());
        assert!(!ProtocolError::InvalidSignature.is_cancelled());
    }

    #[test]
    fn test_from_transport() {
        let err: ProtocolError = peerlog_transport::TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport error: channel is closed");
    }
}
