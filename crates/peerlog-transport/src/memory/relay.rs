use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{PublicKey, SignalChannel, TransportConfig, TransportError};

/// In-process relay: one mailbox per public key, any number of subscribers.
///
/// Cheap to clone; clones share mailboxes.
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    mailboxes: Mutex<HashMap<PublicKey, Vec<mpsc::Sender<Bytes>>>>,
    fail_broadcasts: AtomicBool,
    delivered: AtomicU64,
    buffer: usize,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new(&TransportConfig::default())
    }
}

impl MemoryRelay {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                mailboxes: Mutex::new(HashMap::new()),
                fail_broadcasts: AtomicBool::new(false),
                delivered: AtomicU64::new(0),
                buffer: config.recv_buffer.max(1),
            }),
        }
    }

    /// Make every subsequent broadcast fail with a delivery error.
    pub fn set_fail_broadcasts(&self, fail: bool) {
        self.inner.fail_broadcasts.store(fail, Ordering::Relaxed);
    }

    /// Envelopes handed to subscribers so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Live subscribers for `mailbox`.
    pub fn subscribers(&self, mailbox: &PublicKey) -> usize {
        self.inner
            .mailboxes
            .lock()
            .map(|boxes| {
                boxes
                    .get(mailbox)
                    .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl SignalChannel for MemoryRelay {
    async fn subscribe(&self, mailbox: &PublicKey) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner
            .mailboxes
            .lock()
            .map_err(|_| TransportError::Delivery("relay state poisoned".into()))?
            .entry(*mailbox)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn broadcast(&self, mailbox: &PublicKey, envelope: Bytes) -> Result<(), TransportError> {
        if self.inner.fail_broadcasts.load(Ordering::Relaxed) {
            return Err(TransportError::Delivery(format!(
                "relay refused envelope for {mailbox}"
            )));
        }

        // Never hold the lock across an await.
        let subscribers: Vec<mpsc::Sender<Bytes>> = {
            let mut boxes = self
                .inner
                .mailboxes
                .lock()
                .map_err(|_| TransportError::Delivery("relay state poisoned".into()))?;
            match boxes.get_mut(mailbox) {
                Some(subs) => {
                    subs.retain(|s| !s.is_closed());
                    subs.clone()
                }
                None => Vec::new(),
            }
        };

        for subscriber in subscribers {
            if subscriber.send(envelope.clone()).await.is_ok() {
                self.inner.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}
