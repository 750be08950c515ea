use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{DuplexChannel, TransportError};

/// Outbound lifecycle of a peer transport, consumed by whoever created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Signaling data that must reach the remote transport.
    Signal(Bytes),
    /// The duplex link is up; `send`/`listen` now carry data.
    Connected,
    /// The transport failed and will not connect.
    Error(String),
    /// The link went away (local or remote destroy).
    Closed,
}

/// A transport that is signaled into a connected duplex channel.
pub trait PeerTransport: DuplexChannel {
    /// Feed signaling data received from the remote side.
    fn signal(&self, data: Bytes) -> Result<(), TransportError>;

    /// Tear the transport down. Idempotent.
    fn destroy(&self);

    fn is_initiator(&self) -> bool;
}

/// Factory for peer transports.
pub trait PeerConnector: Send + Sync + 'static {
    type Transport: PeerTransport;

    /// Create a transport in initiator or responder mode, together with the
    /// stream of events it emits.
    fn create(
        &self,
        initiator: bool,
    ) -> (Arc<Self::Transport>, mpsc::UnboundedReceiver<PeerEvent>);
}
