use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use peerlog_protocol::{AcceptAll, BrokerConfig, ConnectionBroker, KeyPair};
use peerlog_transport::{
    MemoryPeerConnector, MemoryRelay, PublicKey, SignalChannel, TransportError,
};
use tokio::sync::mpsc;

pub type Broker = ConnectionBroker<MemoryPeerConnector>;

/// Memory relay that holds every envelope for a fixed delay before
/// delivering it, so concurrent offers can cross in flight.
pub struct DelayedRelay {
    inner: MemoryRelay,
    delay: Duration,
}

impl DelayedRelay {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            inner: MemoryRelay::default(),
            delay: Duration::from_millis(delay_ms),
        }
    }
}

#[async_trait]
impl SignalChannel for DelayedRelay {
    async fn subscribe(&self, mailbox: &PublicKey) -> Result<mpsc::Receiver<Bytes>, TransportError> {
        self.inner.subscribe(mailbox).await
    }

    async fn broadcast(&self, mailbox: &PublicKey, envelope: Bytes) -> Result<(), TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.broadcast(mailbox, envelope).await
    }
}

/// Start a broker that accepts everyone, on a fresh random identity.
pub async fn spawn_broker(
    relay: Arc<dyn SignalChannel>,
    connector: &MemoryPeerConnector,
    config: &BrokerConfig,
) -> anyhow::Result<Broker> {
    let broker = ConnectionBroker::spawn(
        KeyPair::generate(),
        relay,
        connector.clone(),
        Arc::new(AcceptAll),
        config.clone(),
    )
    .await?;
    Ok(broker)
}

/// Elapsed seconds since `start`.
pub fn elapsed_s(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

pub fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}
