//! In-process implementations of the transport contracts.
//!
//! Used by tests and the simulator; everything here is deterministic apart
//! from task scheduling.

mod peer;
mod relay;

pub use peer::{MemoryPeer, MemoryPeerConnector};
pub use relay::MemoryRelay;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::{DuplexChannel, Listeners, Subscription, TransportError};

/// One end of an in-memory duplex link.
pub struct MemoryChannel {
    inbox: Listeners,
    outbox: Listeners,
    closed: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Create two connected ends.
    pub fn pair() -> (Self, Self) {
        let left_inbox = Listeners::new();
        let right_inbox = Listeners::new();
        let closed = Arc::new(AtomicBool::new(false));

        let left = Self {
            inbox: left_inbox.clone(),
            outbox: right_inbox.clone(),
            closed: closed.clone(),
        };
        let right = Self {
            inbox: right_inbox,
            outbox: left_inbox,
            closed,
        };
        (left, right)
    }

    /// Close both ends.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inbox.close();
        self.outbox.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of live listeners on this end.
    pub fn listener_count(&self) -> usize {
        self.inbox.len()
    }
}

impl DuplexChannel for MemoryChannel {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbox.dispatch(data);
        Ok(())
    }

    fn listen(&self) -> Subscription {
        self.inbox.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_in_order() {
        let (left, right) = MemoryChannel::pair();
        let mut inbound = right.listen();

        for i in 0..5u8 {
            left.send(Bytes::from(vec![i])).unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(inbound.recv().await.unwrap().as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn close_affects_both_ends() {
        let (left, right) = MemoryChannel::pair();
        let mut left_in = left.listen();
        right.close();

        assert!(left.send(Bytes::from_static(b"x")).is_err());
        assert!(left_in.recv().await.is_none());
    }

    #[test]
    fn listener_count_tracks_subscriptions() {
        let (left, _right) = MemoryChannel::pair();
        let a = left.listen();
        let _b = left.listen();
        assert_eq!(left.listener_count(), 2);
        drop(a);
        assert_eq!(left.listener_count(), 1);
    }
}
