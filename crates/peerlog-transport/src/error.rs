/// Errors returned by the peerlog transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("relay delivery failed: {0}")]
    Delivery(String),

    #[error("channel is closed")]
    Closed,

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("i/o failure: {0}")]
    Io(#[source] anyhow::Error),

    #[error("invalid signaling payload: {0}")]
    Signal(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.into())
    }
}
