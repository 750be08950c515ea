//! Session table: the broker's pure bookkeeping.
//!
//! Every handler mutates the table synchronously and returns the effects the
//! event loop must carry out. Transport creation, signal feeding and teardown
//! are synchronous calls on the transport; only forwarding outbound signals
//! touches the network, and that happens in the pump tasks the loop spawns
//! for [`BrokerEffect::Pump`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use peerlog_transport::{PeerConnector, PeerEvent, PeerTransport, PublicKey};
use tokio::sync::mpsc;

use crate::completion::{Completion, Rejection};
use crate::metrics::BrokerMetrics;

use super::SessionInfo;

/// Work the table hands back to the event loop.
pub(super) enum BrokerEffect {
    /// Forward a new transport's events; signaling goes to `peer` tagged
    /// with `initiator`, lifecycle comes back tagged with `slot`.
    Pump {
        peer: PublicKey,
        slot: u64,
        initiator: bool,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    },
}

/// Transport lifecycle reported back by a pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum LinkStatus {
    Connected,
    Failed(String),
    Closed,
}

struct Session<T> {
    initiator: bool,
    transport: Arc<T>,
    /// Generation of the transport currently in this entry.
    slot: u64,
    connected: Completion<Arc<T>>,
    is_connected: bool,
}

pub(super) struct SessionTable<C: PeerConnector> {
    local: PublicKey,
    connector: C,
    sessions: HashMap<PublicKey, Session<C::Transport>>,
    next_slot: u64,
    metrics: Arc<BrokerMetrics>,
}

impl<C: PeerConnector> SessionTable<C> {
    pub(super) fn new(local: PublicKey, connector: C, metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            local,
            connector,
            sessions: HashMap::new(),
            next_slot: 0,
            metrics,
        }
    }

    /// New transport in a fresh slot.
    fn create(
        &mut self,
        peer: PublicKey,
        initiator: bool,
    ) -> (Arc<C::Transport>, u64, BrokerEffect) {
        let (transport, events) = self.connector.create(initiator);
        self.next_slot += 1;
        let slot = self.next_slot;
        let pump = BrokerEffect::Pump {
            peer,
            slot,
            initiator,
            events,
        };
        (transport, slot, pump)
    }

    fn insert(&mut self, peer: PublicKey, session: Session<C::Transport>) {
        if self.sessions.insert(peer, session).is_none() {
            self.metrics.sessions_created.inc();
            self.metrics.open_sessions.inc();
        }
    }

    fn remove(&mut self, peer: &PublicKey) -> Option<Session<C::Transport>> {
        let session = self.sessions.remove(peer)?;
        self.metrics.open_sessions.dec();
        Some(session)
    }

    /// Outbound connect. Returns the completion to await; an existing
    /// session is reused rather than starting a second attempt.
    pub(super) fn connect(
        &mut self,
        peer: PublicKey,
    ) -> (Completion<Arc<C::Transport>>, Option<BrokerEffect>) {
        if let Some(session) = self.sessions.get(&peer) {
            tracing::debug!(peer = ?peer, "connect: joining existing session");
            return (session.connected.clone(), None);
        }

        let (transport, slot, pump) = self.create(peer, true);
        let connected = Completion::new();
        self.insert(
            peer,
            Session {
                initiator: true,
                transport,
                slot,
                connected: connected.clone(),
                is_connected: false,
            },
        );
        tracing::info!(peer = ?peer, slot, "connect: new initiator session");
        (connected, Some(pump))
    }

    /// Inbound signal from an authenticated, policy-approved sender.
    pub(super) fn on_signal(
        &mut self,
        from: PublicKey,
        remote_initiator: bool,
        data: Bytes,
    ) -> Option<BrokerEffect> {
        let glare = match self.sessions.get(&from) {
            None => {
                let (transport, slot, pump) = self.create(from, false);
                feed(&from, transport.as_ref(), data);
                self.insert(
                    from,
                    Session {
                        initiator: false,
                        transport,
                        slot,
                        connected: Completion::new(),
                        is_connected: false,
                    },
                );
                tracing::info!(peer = ?from, slot, "inbound session");
                return Some(pump);
            }
            Some(session) => remote_initiator && session.initiator,
        };

        if glare && from > self.local {
            return Some(self.defer_to(from, data));
        }
        if glare {
            tracing::info!(peer = ?from, "glare: keeping local initiator, remote defers");
        }
        if let Some(session) = self.sessions.get(&from) {
            feed(&from, session.transport.as_ref(), data);
        }
        None
    }

    /// Glare where the remote wins: replace our initiator with a responder
    /// in the same entry, keeping the completion its waiters hold.
    fn defer_to(&mut self, from: PublicKey, data: Bytes) -> BrokerEffect {
        let (transport, slot, pump) = self.create(from, false);
        if let Some(session) = self.sessions.get_mut(&from) {
            session.transport.destroy();
            session.transport = transport;
            session.slot = slot;
            session.initiator = false;
            session.is_connected = false;
            feed(&from, session.transport.as_ref(), data);
        }
        self.metrics.glare_resolved.inc();
        tracing::info!(peer = ?from, slot, "glare: remote key wins, deferring as responder");
        pump
    }

    /// Lifecycle event from the transport in `slot`.
    pub(super) fn on_status(&mut self, peer: PublicKey, slot: u64, status: LinkStatus) {
        let current = self.sessions.get(&peer).map(|s| s.slot);
        if current != Some(slot) {
            tracing::debug!(peer = ?peer, slot, ?status, "ignoring event from replaced transport");
            return;
        }

        match status {
            LinkStatus::Connected => {
                if let Some(session) = self.sessions.get_mut(&peer) {
                    session.is_connected = true;
                    session.connected.resolve(session.transport.clone());
                    tracing::info!(peer = ?peer, initiator = session.initiator, "session connected");
                }
            }
            LinkStatus::Failed(reason) => {
                if let Some(session) = self.remove(&peer) {
                    tracing::warn!(peer = ?peer, "session failed: {reason}");
                    session.transport.destroy();
                    session.connected.reject(Rejection::Failed { peer, reason });
                }
            }
            LinkStatus::Closed => {
                if let Some(session) = self.remove(&peer) {
                    tracing::info!(peer = ?peer, "session closed");
                    session.connected.reject(Rejection::Failed {
                        peer,
                        reason: "closed before connecting".into(),
                    });
                }
            }
        }
    }

    /// Remove one session. Pending waiters see a cancellation.
    pub(super) fn drop_session(&mut self, peer: &PublicKey) -> bool {
        match self.remove(peer) {
            Some(session) => {
                session.transport.destroy();
                session.connected.reject(Rejection::Cancelled);
                tracing::info!(peer = ?peer, "session dropped");
                true
            }
            None => false,
        }
    }

    /// Tear down every session.
    pub(super) fn destroy_all(&mut self) {
        let peers: Vec<PublicKey> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.drop_session(&peer);
        }
    }

    pub(super) fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|(peer, session)| SessionInfo {
                peer: *peer,
                initiator: session.initiator,
                connected: session.is_connected,
            })
            .collect();
        sessions.sort_by(|a, b| a.peer.cmp(&b.peer));
        sessions
    }

    #[cfg(test)]
    fn transport(&self, peer: &PublicKey) -> Option<Arc<C::Transport>> {
        self.sessions.get(peer).map(|s| s.transport.clone())
    }
}

fn feed<T: PeerTransport>(peer: &PublicKey, transport: &T, data: Bytes) {
    if let Err(e) = transport.signal(data) {
        tracing::warn!(peer = ?peer, "transport rejected signal: {e}");
    }
}
