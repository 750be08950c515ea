use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    DuplexChannel, Listeners, PeerConnector, PeerEvent, PeerTransport, Subscription,
    TransportError,
};

/// Signaling payloads exchanged by memory peers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Handshake {
    Offer { endpoint: Uuid },
    Answer { endpoint: Uuid },
}

#[derive(Debug)]
enum LinkState {
    /// Created, nothing exchanged yet.
    Fresh,
    /// Responder that answered the offer of `initiator`.
    Answered { initiator: Uuid },
    Linked { remote: Weak<MemoryPeer> },
    Destroyed,
}

#[derive(Default)]
struct Switchboard {
    endpoints: Mutex<HashMap<Uuid, Weak<MemoryPeer>>>,
    created: AtomicU64,
    fail_connections: AtomicBool,
}

impl Switchboard {
    fn lookup(&self, id: &Uuid) -> Option<Arc<MemoryPeer>> {
        self.endpoints.lock().ok()?.get(id)?.upgrade()
    }
}

/// Creates [`MemoryPeer`]s that find each other through a shared switchboard.
///
/// All connectors cloned from the same value share one switchboard, so two
/// brokers in one process can connect to each other.
#[derive(Clone, Default)]
pub struct MemoryPeerConnector {
    switchboard: Arc<Switchboard>,
}

impl MemoryPeerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports created through this switchboard so far.
    pub fn created(&self) -> u64 {
        self.switchboard.created.load(Ordering::Relaxed)
    }

    /// Make initiators fail instead of linking when they receive an answer.
    pub fn set_fail_connections(&self, fail: bool) {
        self.switchboard
            .fail_connections
            .store(fail, Ordering::Relaxed);
    }
}

impl PeerConnector for MemoryPeerConnector {
    type Transport = MemoryPeer;

    fn create(&self, initiator: bool) -> (Arc<MemoryPeer>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(MemoryPeer {
            id: Uuid::new_v4(),
            initiator,
            events,
            inbox: Listeners::new(),
            state: Mutex::new(LinkState::Fresh),
            switchboard: self.switchboard.clone(),
        });

        if let Ok(mut endpoints) = self.switchboard.endpoints.lock() {
            endpoints.insert(peer.id, Arc::downgrade(&peer));
        }
        self.switchboard.created.fetch_add(1, Ordering::Relaxed);

        if initiator {
            peer.emit_handshake(&Handshake::Offer { endpoint: peer.id });
        }
        (peer, events_rx)
    }
}

/// In-memory stand-in for a signaled peer connection.
///
/// An initiator emits an offer when created. A responder answers the first
/// offer it is fed. The initiator links both ends when it receives that
/// answer, after which both emit [`PeerEvent::Connected`]. Offers fed to an
/// initiator are ignored.
pub struct MemoryPeer {
    id: Uuid,
    initiator: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
    inbox: Listeners,
    state: Mutex<LinkState>,
    switchboard: Arc<Switchboard>,
}

impl MemoryPeer {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state.lock().as_deref(),
            Ok(LinkState::Linked { .. })
        )
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.state.lock().as_deref(), Ok(LinkState::Destroyed))
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_handshake(&self, handshake: &Handshake) {
        match serde_json::to_vec(handshake) {
            Ok(data) => self.emit(PeerEvent::Signal(Bytes::from(data))),
            Err(e) => self.emit(PeerEvent::Error(format!("encode handshake: {e}"))),
        }
    }

    fn fail(&self, reason: String) {
        tracing::debug!(peer = %self.id, "memory peer failed: {reason}");
        self.emit(PeerEvent::Error(reason));
    }

    fn accept_offer(&self, initiator: Uuid) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match &*state {
                LinkState::Fresh => *state = LinkState::Answered { initiator },
                // Duplicate or late offer.
                _ => return,
            }
        }
        self.emit_handshake(&Handshake::Answer { endpoint: self.id });
    }

    fn accept_answer(self: &Arc<Self>, responder_id: Uuid) {
        if !matches!(self.state.lock().as_deref(), Ok(LinkState::Fresh)) {
            return;
        }
        if self.switchboard.fail_connections.load(Ordering::Relaxed) {
            self.fail("simulated connection failure".into());
            return;
        }
        let Some(responder) = self.switchboard.lookup(&responder_id) else {
            self.fail(format!("answer from unknown endpoint {responder_id}"));
            return;
        };

        let answered_us = {
            let Ok(mut remote_state) = responder.state.lock() else {
                return;
            };
            match &*remote_state {
                LinkState::Answered { initiator } if *initiator == self.id => {
                    *remote_state = LinkState::Linked {
                        remote: Arc::downgrade(self),
                    };
                    true
                }
                _ => false,
            }
        };
        if !answered_us {
            self.fail(format!("endpoint {responder_id} did not answer our offer"));
            return;
        }

        if let Ok(mut state) = self.state.lock() {
            *state = LinkState::Linked {
                remote: Arc::downgrade(&responder),
            };
        }
        self.emit(PeerEvent::Connected);
        responder.emit(PeerEvent::Connected);
    }

    fn remote_gone(&self) {
        if let Ok(mut state) = self.state.lock() {
            if matches!(*state, LinkState::Destroyed) {
                return;
            }
            *state = LinkState::Destroyed;
        }
        self.inbox.close();
        self.emit(PeerEvent::Closed);
    }
}

impl DuplexChannel for MemoryPeer {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let remote = match self.state.lock().as_deref() {
            Ok(LinkState::Linked { remote }) => remote.upgrade(),
            _ => None,
        };
        match remote {
            Some(remote) => {
                remote.inbox.dispatch(data);
                Ok(())
            }
            None => Err(TransportError::Closed),
        }
    }

    fn listen(&self) -> Subscription {
        self.inbox.subscribe()
    }
}

impl PeerTransport for MemoryPeer {
    fn signal(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Closed);
        }
        let handshake: Handshake = serde_json::from_slice(&data)
            .map_err(|e| TransportError::Signal(e.to_string()))?;

        match (self.initiator, handshake) {
            (true, Handshake::Offer { endpoint }) => {
                tracing::debug!(peer = %self.id, "initiator ignoring offer from {endpoint}");
            }
            (false, Handshake::Offer { endpoint }) => self.accept_offer(endpoint),
            (true, Handshake::Answer { endpoint }) => {
                // Re-enter through the switchboard to get an owning handle.
                match self.switchboard.lookup(&self.id) {
                    Some(me) => me.accept_answer(endpoint),
                    None => return Err(TransportError::Closed),
                }
            }
            (false, Handshake::Answer { endpoint }) => {
                tracing::debug!(peer = %self.id, "responder ignoring answer from {endpoint}");
            }
        }
        Ok(())
    }

    fn destroy(&self) {
        let remote = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let previous = std::mem::replace(&mut *state, LinkState::Destroyed);
            match previous {
                LinkState::Destroyed => return,
                LinkState::Linked { remote } => remote.upgrade(),
                _ => None,
            }
        };

        if let Ok(mut endpoints) = self.switchboard.endpoints.lock() {
            endpoints.remove(&self.id);
        }
        self.inbox.close();
        self.emit(PeerEvent::Closed);

        if let Some(remote) = remote {
            remote.remote_gone();
        }
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        if let Ok(mut endpoints) = self.switchboard.endpoints.lock() {
            endpoints.remove(&self.id);
        }
    }
}
