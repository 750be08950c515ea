use peerlog_metrics::{Counter, Gauge};
use serde::Serialize;

/// Connection broker counters.
#[derive(Debug, Default, Serialize)]
pub struct BrokerMetrics {
    /// Relay envelopes that failed decryption or verification.
    pub envelopes_rejected: Counter,
    pub policy_denials: Counter,
    pub sessions_created: Counter,
    pub open_sessions: Gauge,
    /// Glare collisions where the local initiator was replaced.
    pub glare_resolved: Counter,
    pub signals_sent: Counter,
    pub delivery_failures: Counter,
}

/// Replicated log counters, summed over every channel.
#[derive(Debug, Default, Serialize)]
pub struct LogMetrics {
    pub handshakes: Counter,
    pub batches_sent: Counter,
    pub items_sent: Counter,
    pub denies: Counter,
    pub abandoned_channels: Counter,
    pub piped_channels: Gauge,
}
