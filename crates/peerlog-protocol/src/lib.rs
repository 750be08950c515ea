//! peerlog protocol layer.
//!
//! Turns relay-delivered, encrypted signaling into authenticated peer
//! sessions (the connection broker), and keeps append-only logs in sync
//! across any duplex channel (the replicated log), on top of the contracts
//! in `peerlog-transport`.
//!
//! Wire format: MessagePack (named fields).
//! Crypto: Ed25519 signatures + X25519/XChaCha20-Poly1305 sealing.

pub mod broker;
pub mod completion;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod log;
pub mod metrics;

pub use broker::{
    policy_fn, AcceptAll, AllowList, BrokerConfig, BrokerMessage, ConnectPolicy,
    ConnectionBroker, PolicyFn, SessionInfo,
};
pub use completion::{Completion, Rejection};
pub use crypto::SealedBox;
pub use envelope::{CryptoEnvelope, Envelope, Opened, SealedEnvelope};
pub use error::ProtocolError;
pub use identity::KeyPair;
pub use log::{
    apply_batch, ChannelId, ChannelState, LocalLog, LogConfig, LogItem, RemoteLog,
    RemoteLogConfig, Retry, SyncMessage, DEFAULT_BATCH_SIZE,
};
pub use metrics::{BrokerMetrics, LogMetrics};
pub use peerlog_transport::PublicKey;
