use serde::Serialize;

/// Sync state of one piped channel. Only that channel's driver moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(
    tag = "state",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ChannelState {
    /// About to (re)start the handshake.
    Idle,
    /// `sync-start` sent, waiting for accept or deny.
    Connecting,
    /// Handshake done; the remote is known to hold `remote_log_length` items.
    /// A driver parks here when the remote has caught up.
    Connected {
        remote_log_length: u64,
        batch_size: u64,
    },
    /// Backing off after `sync-start-deny`.
    ConnectWaiting,
    /// `sync-batch` sent, waiting for ack or deny.
    Syncing,
    /// Throttled after an ack, or backing off after `sync-batch-deny`.
    SyncWaiting,
}

impl ChannelState {
    /// Remote length if the handshake has completed.
    pub fn remote_log_length(&self) -> Option<u64> {
        match self {
            ChannelState::Connected {
                remote_log_length, ..
            } => Some(*remote_log_length),
            _ => None,
        }
    }

    /// True while a request is outstanding.
    pub fn is_waiting_reply(&self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Syncing)
    }
}
