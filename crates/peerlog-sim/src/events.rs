use serde::Serialize;
use std::io::Write;

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

pub use peerlog_transport::now_ms;

// ── Session events ──────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub timestamp_ms: u64,
}

impl EventStarted {
    pub fn new(mode: &str) -> Self {
        Self {
            event: "started",
            mode: mode.to_string(),
            timestamp_ms: now_ms(),
        }
    }
}

// ── Glare ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventGlareRound {
    pub event: &'static str,
    pub round: u32,
    pub initiator: String,
    pub responder: String,
    /// True when exactly the larger key kept the initiator role.
    pub resolved_by_key_order: bool,
    pub glare_resolved: u64,
    pub connect_ms: f64,
    pub elapsed_s: f64,
}

// ── Sync ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventPeerSynced {
    pub event: &'static str,
    pub peer: String,
    pub remote_log_length: u64,
    pub matches: bool,
    pub sync_ms: f64,
    pub elapsed_s: f64,
}

#[derive(Serialize)]
pub struct EventSyncResult {
    pub event: &'static str,
    pub peers: u32,
    pub items: u64,
    pub batch_size: u64,
    pub handshakes: u64,
    pub batches_sent: u64,
    pub items_sent: u64,
    pub all_match: bool,
    pub elapsed_ms: f64,
    pub elapsed_s: f64,
}

// ── Summary ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventSummary<M: Serialize> {
    pub event: &'static str,
    pub mode: String,
    pub ok: bool,
    pub metrics: M,
    pub elapsed_s: f64,
}
