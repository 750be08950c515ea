/// Replicated append-only log.
///
/// A [`LocalLog`] owns its items and drives one sync loop per piped channel:
/// handshake with `sync-start`, then push `sync-batch`es from the remote's
/// acknowledged length until it has everything, backing off as the remote's
/// denies dictate. `append` wakes every channel. A [`RemoteLog`] is the
/// passive copy on the other end: it answers handshakes and replaces the
/// batch range in its own sequence, so redelivered batches are harmless.
///
/// Both sides speak [`SyncMessage`] over any [`DuplexChannel`], so a log can
/// ride a broker session, a framed TCP stream or an in-memory pair.
///
/// [`DuplexChannel`]: peerlog_transport::DuplexChannel
mod local;
mod message;
mod remote;
mod state;

pub use local::{ChannelId, LocalLog};
pub use message::{Retry, SyncMessage};
pub use remote::{apply_batch, RemoteLog};
pub use state::ChannelState;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Batch size a [`RemoteLog`] asks for unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: u64 = 200;

/// Anything that can be stored in a replicated log.
pub trait LogItem: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> LogItem for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

// ── Configuration ─────────────────────────────────────────────────────

/// Settings for the driving side.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Give up on an unanswered request after this long and start over
    /// from the handshake. `None` waits forever.
    pub(crate) response_timeout: Option<Duration>,
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn get_response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }
}

/// Settings for the passive side.
#[derive(Debug, Clone)]
pub struct RemoteLogConfig {
    /// Batch size announced in `sync-start-accept`.
    pub(crate) batch_size: u64,
    /// Throttle announced as `waitMs` in every `sync-batch-ack`.
    pub(crate) ack_wait: Option<Duration>,
}

impl Default for RemoteLogConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            ack_wait: None,
        }
    }
}

impl RemoteLogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_size(mut self, size: u64) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn ack_wait(mut self, wait: Duration) -> Self {
        self.ack_wait = Some(wait);
        self
    }

    pub fn get_batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn get_ack_wait(&self) -> Option<Duration> {
        self.ack_wait
    }
}

// Log state stays usable after a panicking holder; every critical section
// leaves it consistent.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
