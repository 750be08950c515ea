/// Connection broker: relay signaling in, authenticated peer sessions out.
///
/// The broker listens on the local key's relay mailbox, authenticates every
/// envelope, runs the connect policy on the verified sender, and feeds the
/// signaling payload into the matching peer transport. `connect()` opens (or
/// joins) a session and resolves once the transport reports connected.
///
/// Simultaneous mutual connects (glare) are resolved by key order: the side
/// whose key is smaller replaces its initiator with a responder, and anything
/// already awaiting that session keeps waiting on the same completion.
mod r#loop;
mod message;
mod policy;
mod state;

pub use message::BrokerMessage;
pub use policy::{policy_fn, AcceptAll, AllowList, ConnectPolicy, PolicyFn};

use std::sync::{Arc, Mutex};

use peerlog_transport::{PeerConnector, PublicKey, SignalChannel};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::completion::Completion;
use crate::envelope::{CryptoEnvelope, SealedEnvelope};
use crate::metrics::BrokerMetrics;
use crate::{KeyPair, ProtocolError};

use self::r#loop::{broker_loop, Relay};
use self::state::SessionTable;

// ── Configuration ─────────────────────────────────────────────────────

/// Connection broker settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of the command and internal event queues.
    pub(crate) event_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { event_buffer: 64 }
    }
}

impl BrokerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn get_event_buffer(&self) -> usize {
        self.event_buffer
    }
}

/// One row of [`ConnectionBroker::sessions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub peer: PublicKey,
    pub initiator: bool,
    pub connected: bool,
}

// ── Commands (handle → loop) ──────────────────────────────────────────

pub(crate) enum BrokerCommand<T> {
    Connect {
        peer: PublicKey,
        reply: oneshot::Sender<Completion<Arc<T>>>,
    },
    DropSession {
        peer: PublicKey,
        reply: oneshot::Sender<bool>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
}

// ── ConnectionBroker (app-facing API) ─────────────────────────────────

/// Handle to a running broker. Dropping it shuts the broker down.
pub struct ConnectionBroker<C: PeerConnector> {
    local: PublicKey,
    cmd_tx: mpsc::Sender<BrokerCommand<C::Transport>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<BrokerMetrics>,
}

impl<C: PeerConnector> ConnectionBroker<C> {
    /// Start a broker for `keys`, using [`SealedEnvelope`] for relay traffic.
    pub async fn spawn(
        keys: KeyPair,
        signal: Arc<dyn SignalChannel>,
        connector: C,
        policy: Arc<dyn ConnectPolicy>,
        config: BrokerConfig,
    ) -> Result<Self, ProtocolError> {
        Self::spawn_with_crypto(keys, signal, connector, policy, Arc::new(SealedEnvelope), config)
            .await
    }

    /// Start a broker with a custom envelope implementation.
    ///
    /// Subscribes to the local mailbox before returning, so signals sent
    /// after this resolves are not missed.
    pub async fn spawn_with_crypto(
        keys: KeyPair,
        signal: Arc<dyn SignalChannel>,
        connector: C,
        policy: Arc<dyn ConnectPolicy>,
        crypto: Arc<dyn CryptoEnvelope>,
        config: BrokerConfig,
    ) -> Result<Self, ProtocolError> {
        let local = *keys.public();
        let mailbox = signal.subscribe(&local).await?;
        let metrics = Arc::new(BrokerMetrics::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(config.event_buffer);
        let shutdown = CancellationToken::new();

        let relay = Arc::new(Relay {
            keys,
            signal,
            crypto,
            metrics: metrics.clone(),
        });
        let table = SessionTable::new(local, connector, metrics.clone());
        let task = tokio::spawn(broker_loop(
            relay,
            table,
            policy,
            mailbox,
            cmd_rx,
            config.event_buffer,
            shutdown.clone(),
        ));

        tracing::info!(local = ?local, "connection broker started");
        Ok(Self {
            local,
            cmd_tx,
            shutdown,
            task: Mutex::new(Some(task)),
            metrics,
        })
    }

    /// This broker's identity.
    pub fn local(&self) -> &PublicKey {
        &self.local
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    /// Open a session to `peer`, or join the one already open or opening,
    /// and wait until its transport is connected.
    ///
    /// Fails with [`ProtocolError::ConnectionFailed`] if the transport
    /// errors, and with [`ProtocolError::Cancelled`] if the session is
    /// dropped or the broker destroyed first.
    pub async fn connect(&self, peer: &PublicKey) -> Result<Arc<C::Transport>, ProtocolError> {
        if *peer == self.local {
            return Err(ProtocolError::ConnectionFailed {
                peer: *peer,
                reason: "cannot connect to own key".into(),
            });
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::Connect { peer: *peer, reply })
            .await
            .map_err(|_| ProtocolError::BrokerClosed)?;
        let completion = rx.await.map_err(|_| ProtocolError::BrokerClosed)?;
        completion.wait().await.map_err(Into::into)
    }

    /// Tear down the session with `peer`, if any. Returns whether one existed.
    pub async fn drop_session(&self, peer: &PublicKey) -> Result<bool, ProtocolError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(BrokerCommand::DropSession { peer: *peer, reply })
            .await
            .map_err(|_| ProtocolError::BrokerClosed)?;
        rx.await.map_err(|_| ProtocolError::BrokerClosed)
    }

    /// Snapshot of the session table, ordered by peer key.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(BrokerCommand::Sessions { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Destroy every session and stop listening on the mailbox. Idempotent.
    pub async fn destroy(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl<C: PeerConnector> Drop for ConnectionBroker<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
