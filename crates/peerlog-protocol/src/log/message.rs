use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Log sync wire messages. Every message names the log it belongs to, so
/// several logs can share one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SyncMessage<T> {
    /// "I have `log_length` items, begin sync."
    SyncStart { log_id: String, log_length: u64 },
    SyncStartAccept {
        log_id: String,
        remote_log_length: u64,
        batch_size: u64,
    },
    SyncStartDeny { log_id: String, retry_ms: i64 },
    /// "Apply `log_items` starting at `log_start_index`; I now have `log_length`."
    SyncBatch {
        log_id: String,
        log_start_index: u64,
        log_items: Vec<T>,
        log_length: u64,
    },
    SyncBatchAck {
        log_id: String,
        remote_log_length: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_ms: Option<u64>,
    },
    SyncBatchDeny { log_id: String, retry_ms: i64 },
}

impl<T> SyncMessage<T> {
    pub fn log_id(&self) -> &str {
        match self {
            SyncMessage::SyncStart { log_id, .. }
            | SyncMessage::SyncStartAccept { log_id, .. }
            | SyncMessage::SyncStartDeny { log_id, .. }
            | SyncMessage::SyncBatch { log_id, .. }
            | SyncMessage::SyncBatchAck { log_id, .. }
            | SyncMessage::SyncBatchDeny { log_id, .. } => log_id,
        }
    }

    /// Wire tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncMessage::SyncStart { .. } => "sync-start",
            SyncMessage::SyncStartAccept { .. } => "sync-start-accept",
            SyncMessage::SyncStartDeny { .. } => "sync-start-deny",
            SyncMessage::SyncBatch { .. } => "sync-batch",
            SyncMessage::SyncBatchAck { .. } => "sync-batch-ack",
            SyncMessage::SyncBatchDeny { .. } => "sync-batch-deny",
        }
    }
}

impl<T: Serialize> SyncMessage<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }
}

impl<T: DeserializeOwned> SyncMessage<T> {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// What a deny's `retryMs` asks the driver to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Tear the channel down for good.
    Abandon,
    /// Go back to idle with no delay.
    Immediately,
    After(Duration),
}

impl Retry {
    /// `-1` (or anything negative) abandons, `0` retries at once, `n`
    /// waits `n` milliseconds.
    pub fn from_retry_ms(retry_ms: i64) -> Self {
        match retry_ms {
            ms if ms < 0 => Retry::Abandon,
            0 => Retry::Immediately,
            ms => Retry::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }
}
