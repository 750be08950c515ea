use std::sync::Arc;
use std::time::Instant;

use peerlog_protocol::BrokerConfig;
use peerlog_transport::{MemoryPeerConnector, PeerTransport, SignalChannel};

use crate::common::{elapsed_ms, elapsed_s, spawn_broker, DelayedRelay};
use crate::events::*;

pub struct GlareConfig {
    pub rounds: u32,
    pub relay_delay_ms: u64,
    pub broker: BrokerConfig,
}

/// Two brokers dial each other at the same instant, once per round.
///
/// Returns whether every round settled on the larger key as initiator.
pub async fn run(config: GlareConfig, start: Instant) -> anyhow::Result<bool> {
    emit(&EventStarted::new("glare"));
    eprintln!(
        "Glare mode → {} rounds, relay delay {}ms",
        config.rounds, config.relay_delay_ms
    );

    let mut all_ok = true;
    for round in 1..=config.rounds {
        let relay: Arc<dyn SignalChannel> = Arc::new(DelayedRelay::new(config.relay_delay_ms));
        let connector = MemoryPeerConnector::new();
        let a = spawn_broker(relay.clone(), &connector, &config.broker).await?;
        let b = spawn_broker(relay, &connector, &config.broker).await?;
        let (ka, kb) = (*a.local(), *b.local());

        let dial = Instant::now();
        let (from_a, from_b) = tokio::join!(a.connect(&kb), b.connect(&ka));
        let (from_a, from_b) = (from_a?, from_b?);
        let connect_ms = elapsed_ms(dial);

        let (initiator, responder) = if from_a.is_initiator() { (ka, kb) } else { (kb, ka) };
        let resolved_by_key_order =
            from_a.is_initiator() != from_b.is_initiator() && initiator > responder;
        all_ok &= resolved_by_key_order;

        emit(&EventGlareRound {
            event: "glare_round",
            round,
            initiator: initiator.to_string(),
            responder: responder.to_string(),
            resolved_by_key_order,
            glare_resolved: a.metrics().glare_resolved.get() + b.metrics().glare_resolved.get(),
            connect_ms,
            elapsed_s: elapsed_s(start),
        });
        if !resolved_by_key_order {
            eprintln!("  round {round}: roles did not follow key order");
        }

        a.destroy().await;
        b.destroy().await;
    }

    eprintln!("Glare done: {}", if all_ok { "ok" } else { "FAILED" });
    Ok(all_ok)
}
