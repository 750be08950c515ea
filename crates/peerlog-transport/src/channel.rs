use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::TransportError;

/// Ordered bidirectional message link.
///
/// Messages sent on one end arrive at every live [`Subscription`] on the
/// other end, in send order. A message sent while nobody is listening is
/// not buffered for future listeners.
pub trait DuplexChannel: Send + Sync + 'static {
    /// Queue a message for the other end. Never waits.
    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Start receiving inbound messages. Dropping the subscription stops it.
    fn listen(&self) -> Subscription;
}

impl<C: DuplexChannel + ?Sized> DuplexChannel for Arc<C> {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        (**self).send(data)
    }

    fn listen(&self) -> Subscription {
        (**self).listen()
    }
}

/// A live listener on a [`DuplexChannel`].
///
/// `recv` yields `None` once the channel is closed.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Bytes>,
    set: Weak<ListenerSet>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `None` when nothing is queued or the channel is closed.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(set) = self.set.upgrade() {
            set.remove(self.id);
        }
    }
}

#[derive(Debug, Default)]
struct ListenerSet {
    next_id: AtomicU64,
    closed: AtomicBool,
    senders: Mutex<Vec<(u64, mpsc::UnboundedSender<Bytes>)>>,
}

impl ListenerSet {
    fn remove(&self, id: u64) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.retain(|(sid, _)| *sid != id);
        }
    }
}

/// Inbound fan-out shared by the channel implementations.
///
/// Cheap to clone; clones share the same listener set.
#[derive(Debug, Clone, Default)]
pub struct Listeners {
    set: Arc<ListenerSet>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription. On a closed set the subscription is
    /// already finished.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.set.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.set.closed.load(Ordering::Acquire) {
            if let Ok(mut senders) = self.set.senders.lock() {
                senders.push((id, tx));
            }
        }
        Subscription {
            id,
            rx,
            set: Arc::downgrade(&self.set),
        }
    }

    /// Deliver `data` to every subscription. Returns how many received it.
    pub fn dispatch(&self, data: Bytes) -> usize {
        let Ok(mut senders) = self.set.senders.lock() else {
            return 0;
        };
        senders.retain(|(_, tx)| tx.send(data.clone()).is_ok());
        senders.len()
    }

    /// End every subscription and refuse new ones.
    pub fn close(&self) {
        self.set.closed.store(true, Ordering::Release);
        if let Ok(mut senders) = self.set.senders.lock() {
            senders.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.set.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.set.senders.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_reaches_every_subscription_in_order() {
        let listeners = Listeners::new();
        let mut a = listeners.subscribe();
        let mut b = listeners.subscribe();

        assert_eq!(listeners.dispatch(Bytes::from_static(b"1")), 2);
        assert_eq!(listeners.dispatch(Bytes::from_static(b"2")), 2);

        assert_eq!(a.recv().await.unwrap(), "1");
        assert_eq!(a.recv().await.unwrap(), "2");
        assert_eq!(b.recv().await.unwrap(), "1");
        assert_eq!(b.recv().await.unwrap(), "2");
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let listeners = Listeners::new();
        let sub = listeners.subscribe();
        assert_eq!(listeners.len(), 1);
        drop(sub);
        assert!(listeners.is_empty());
        assert_eq!(listeners.dispatch(Bytes::from_static(b"x")), 0);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let listeners = Listeners::new();
        let mut sub = listeners.subscribe();
        listeners.close();
        assert!(sub.recv().await.is_none());

        let mut late = listeners.subscribe();
        assert!(late.recv().await.is_none());
    }
}
