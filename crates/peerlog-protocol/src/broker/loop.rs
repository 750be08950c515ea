/// The connection broker event loop.
///
/// One task owns the session table and multiplexes over handle commands,
/// verified inbound signals and transport lifecycle reports. Inbound relay
/// traffic is authenticated and policy-checked by a separate intake task,
/// one envelope at a time, so a slow policy never stalls established
/// sessions. Outbound signaling for each transport runs in its own pump.
use std::sync::Arc;

use bytes::Bytes;
use peerlog_transport::{PeerConnector, PeerEvent, PublicKey, SignalChannel};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::envelope::CryptoEnvelope;
use crate::metrics::BrokerMetrics;
use crate::KeyPair;

use super::message::BrokerMessage;
use super::policy::{self, ConnectPolicy};
use super::state::{BrokerEffect, LinkStatus, SessionTable};
use super::BrokerCommand;

/// A signal that passed verification and the policy hook.
struct Inbound {
    from: PublicKey,
    message: BrokerMessage,
}

/// What pumps and intake need to talk to the relay.
pub(super) struct Relay {
    pub(super) keys: KeyPair,
    pub(super) signal: Arc<dyn SignalChannel>,
    pub(super) crypto: Arc<dyn CryptoEnvelope>,
    pub(super) metrics: Arc<BrokerMetrics>,
}

impl Relay {
    /// Seal and broadcast one signaling payload to `peer`'s mailbox.
    async fn send_signal(&self, peer: &PublicKey, initiator: bool, data: Bytes) {
        let message = BrokerMessage::Signal { initiator, data };
        let envelope = match message
            .to_bytes()
            .and_then(|plain| self.crypto.encrypt_and_sign(&self.keys, peer, &plain))
        {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(peer = ?peer, "cannot seal signal: {e}");
                self.metrics.delivery_failures.inc();
                return;
            }
        };

        match self.signal.broadcast(peer, Bytes::from(envelope)).await {
            Ok(()) => {
                self.metrics.signals_sent.inc();
                tracing::debug!(peer = ?peer, initiator, "signal delivered to relay");
            }
            Err(e) => {
                self.metrics.delivery_failures.inc();
                tracing::warn!(peer = ?peer, "relay delivery failed: {e}");
            }
        }
    }
}

/// Main event loop. Owns the session table.
#[allow(clippy::too_many_arguments)]
pub(super) async fn broker_loop<C: PeerConnector>(
    relay: Arc<Relay>,
    mut table: SessionTable<C>,
    policy: Arc<dyn ConnectPolicy>,
    mailbox: mpsc::Receiver<Bytes>,
    mut cmd_rx: mpsc::Receiver<BrokerCommand<C::Transport>>,
    event_buffer: usize,
    shutdown: CancellationToken,
) {
    let (inbound_tx, mut inbound_rx) = mpsc::channel(event_buffer);
    let (status_tx, mut status_rx) = mpsc::channel(event_buffer);
    let mut pumps = JoinSet::new();

    let intake_task = tokio::spawn(intake(
        relay.clone(),
        policy,
        mailbox,
        inbound_tx,
        shutdown.clone(),
    ));

    loop {
        let effect = tokio::select! {
            _ = shutdown.cancelled() => break,

            // ── 1. Commands from the handle ─────────────────────
            cmd = cmd_rx.recv() => match cmd {
                Some(BrokerCommand::Connect { peer, reply }) => {
                    let (completion, effect) = table.connect(peer);
                    let _ = reply.send(completion);
                    effect
                }
                Some(BrokerCommand::DropSession { peer, reply }) => {
                    let _ = reply.send(table.drop_session(&peer));
                    None
                }
                Some(BrokerCommand::Sessions { reply }) => {
                    let _ = reply.send(table.snapshot());
                    None
                }
                None => break,
            },

            // ── 2. Verified inbound signals ─────────────────────
            Some(Inbound { from, message }) = inbound_rx.recv() => match message {
                BrokerMessage::Signal { initiator, data } => table.on_signal(from, initiator, data),
            },

            // ── 3. Transport lifecycle ──────────────────────────
            Some((peer, slot, status)) = status_rx.recv() => {
                table.on_status(peer, slot, status);
                None
            }

            Some(_) = pumps.join_next(), if !pumps.is_empty() => None,
        };

        if let Some(BrokerEffect::Pump {
            peer,
            slot,
            initiator,
            events,
        }) = effect
        {
            pumps.spawn(pump(
                relay.clone(),
                peer,
                slot,
                initiator,
                events,
                status_tx.clone(),
                shutdown.clone(),
            ));
        }
    }

    shutdown.cancel();
    table.destroy_all();
    pumps.shutdown().await;
    let _ = intake_task.await;
    tracing::info!("connection broker stopped");
}

/// Authenticate, policy-check and decode relay envelopes in arrival order.
async fn intake(
    relay: Arc<Relay>,
    policy: Arc<dyn ConnectPolicy>,
    mut mailbox: mpsc::Receiver<Bytes>,
    inbound_tx: mpsc::Sender<Inbound>,
    shutdown: CancellationToken,
) {
    let local = *relay.keys.public();
    loop {
        let raw = tokio::select! {
            _ = shutdown.cancelled() => break,
            raw = mailbox.recv() => match raw {
                Some(raw) => raw,
                None => {
                    tracing::warn!("relay mailbox closed");
                    break;
                }
            },
        };

        let opened = match relay.crypto.decrypt_and_verify(&relay.keys, &raw) {
            Ok(opened) => opened,
            Err(e) => {
                relay.metrics.envelopes_rejected.inc();
                tracing::debug!("dropping relay envelope: {e}");
                continue;
            }
        };
        if opened.sender == local {
            tracing::debug!("dropping envelope from our own key");
            continue;
        }

        let allowed = tokio::select! {
            _ = shutdown.cancelled() => break,
            allowed = policy::admits(policy.as_ref(), &opened.sender) => allowed,
        };
        if !allowed {
            relay.metrics.policy_denials.inc();
            tracing::info!(peer = ?opened.sender, "denied connection");
            continue;
        }

        let message = match BrokerMessage::from_bytes(&opened.data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(peer = ?opened.sender, "undecodable broker message: {e}");
                continue;
            }
        };
        let inbound = Inbound {
            from: opened.sender,
            message,
        };
        if inbound_tx.send(inbound).await.is_err() {
            break;
        }
    }
}

/// Forward one transport's events: signaling to the relay, lifecycle to the loop.
async fn pump(
    relay: Arc<Relay>,
    peer: PublicKey,
    slot: u64,
    initiator: bool,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    status_tx: mpsc::Sender<(PublicKey, u64, LinkStatus)>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let status = match event {
            PeerEvent::Signal(data) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = relay.send_signal(&peer, initiator, data) => {}
                }
                continue;
            }
            PeerEvent::Connected => LinkStatus::Connected,
            PeerEvent::Error(reason) => LinkStatus::Failed(reason),
            PeerEvent::Closed => LinkStatus::Closed,
        };

        let closed = status == LinkStatus::Closed;
        if status_tx.send((peer, slot, status)).await.is_err() || closed {
            break;
        }
    }
}
