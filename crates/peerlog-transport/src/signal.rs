use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{PublicKey, TransportError};

/// Relay mailbox service used for signaling.
///
/// Mailboxes are addressed by public key. The relay only moves opaque
/// envelopes; it gives no ordering guarantee across senders and never sees
/// plaintext.
#[async_trait::async_trait]
pub trait SignalChannel: Send + Sync + 'static {
    /// Live inbound traffic for `mailbox`. Not restartable: dropping the
    /// receiver stops listening.
    async fn subscribe(&self, mailbox: &PublicKey) -> Result<mpsc::Receiver<Bytes>, TransportError>;

    /// Post `envelope` to `mailbox`, resolving once the relay acknowledges it.
    async fn broadcast(&self, mailbox: &PublicKey, envelope: Bytes) -> Result<(), TransportError>;
}
