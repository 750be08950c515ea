use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use peerlog_transport::{DuplexChannel, Subscription};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::message::SyncMessage;
use super::{lock, read, write, LogItem, RemoteLogConfig};
use crate::ProtocolError;

/// Replace `items[start..]` with `batch`.
///
/// Applying the same batch at the same start twice leaves the same
/// sequence as applying it once. A start past the end would leave a hole,
/// so it is rejected with [`ProtocolError::GapInBatch`] and `items` is left
/// untouched. Returns the new length.
pub fn apply_batch<T>(items: &mut Vec<T>, start: u64, batch: Vec<T>) -> Result<u64, ProtocolError> {
    let length = items.len() as u64;
    if start > length {
        return Err(ProtocolError::GapInBatch { start, length });
    }
    // start <= len, so it fits in usize.
    items.truncate(start as usize);
    items.extend(batch);
    Ok(items.len() as u64)
}

/// The passive copy of a replicated log.
///
/// Answers `sync-start` and `sync-batch` requests for its log id on one
/// channel, ignoring everything else on it. Dropping the handle detaches.
pub struct RemoteLog<T> {
    inner: Arc<RemoteInner<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct RemoteInner<T> {
    id: String,
    items: RwLock<Vec<T>>,
    length: watch::Sender<u64>,
    config: RemoteLogConfig,
    shutdown: CancellationToken,
}

impl<T: LogItem> RemoteInner<T> {
    fn len(&self) -> u64 {
        read(&self.items).len() as u64
    }

    /// Reply to one request addressed to this log.
    fn handle(&self, request: SyncMessage<T>) -> Option<SyncMessage<T>> {
        match request {
            SyncMessage::SyncStart { log_id, log_length } => {
                let remote_log_length = self.len();
                tracing::debug!(log = %self.id, peer_length = log_length, remote_log_length, "sync-start");
                Some(SyncMessage::SyncStartAccept {
                    log_id,
                    remote_log_length,
                    batch_size: self.config.batch_size,
                })
            }
            SyncMessage::SyncBatch {
                log_id,
                log_start_index,
                log_items,
                log_length,
            } => {
                let count = log_items.len();
                let applied = apply_batch(&mut write(&self.items), log_start_index, log_items);
                match applied {
                    Ok(remote_log_length) => {
                        self.length.send_replace(remote_log_length);
                        tracing::debug!(
                            log = %self.id,
                            start = log_start_index,
                            count,
                            peer_length = log_length,
                            remote_log_length,
                            "batch applied"
                        );
                        Some(SyncMessage::SyncBatchAck {
                            log_id,
                            remote_log_length,
                            wait_ms: self
                                .config
                                .ack_wait
                                .map(|wait| u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)),
                        })
                    }
                    Err(e) => {
                        tracing::warn!(log = %self.id, "rejecting batch: {e}");
                        Some(SyncMessage::SyncBatchDeny { log_id, retry_ms: 0 })
                    }
                }
            }
            _ => None,
        }
    }
}

impl<T: LogItem> RemoteLog<T> {
    /// Serve log `id` on `channel`, starting empty.
    pub fn attach(
        id: impl Into<String>,
        channel: Arc<dyn DuplexChannel>,
        config: RemoteLogConfig,
    ) -> Self {
        Self::attach_with_items(id, Vec::new(), channel, config)
    }

    /// Serve log `id` on `channel`, starting from `items`.
    pub fn attach_with_items(
        id: impl Into<String>,
        items: Vec<T>,
        channel: Arc<dyn DuplexChannel>,
        config: RemoteLogConfig,
    ) -> Self {
        let (length, _) = watch::channel(items.len() as u64);
        let inner = Arc::new(RemoteInner {
            id: id.into(),
            items: RwLock::new(items),
            length,
            config,
            shutdown: CancellationToken::new(),
        });
        // Subscribe now so requests sent right after attach are seen.
        let inbound = channel.listen();
        let task = tokio::spawn(respond(inner.clone(), channel, inbound));
        tracing::info!(log = %inner.id, "remote log attached");
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn items(&self) -> Vec<T> {
        read(&self.inner.items).clone()
    }

    /// Follow the length as batches land.
    pub fn watch_len(&self) -> watch::Receiver<u64> {
        self.inner.length.subscribe()
    }

    /// Wait until at least `length` items are held.
    pub async fn wait_for_len(&self, length: u64) -> u64 {
        let mut rx = self.watch_len();
        let held = match rx.wait_for(|held| *held >= length).await {
            Ok(held) => *held,
            Err(_) => self.len(),
        };
        held
    }

    /// Stop answering requests. Idempotent.
    pub async fn destroy(&self) {
        self.inner.shutdown.cancel();
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

impl<T> Drop for RemoteLog<T> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn respond<T: LogItem>(
    inner: Arc<RemoteInner<T>>,
    channel: Arc<dyn DuplexChannel>,
    mut inbound: Subscription,
) {
    loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(frame) => frame,
                None => {
                    tracing::debug!(log = %inner.id, "channel closed, detaching");
                    break;
                }
            },
        };

        let request = match SyncMessage::<T>::from_bytes(&frame) {
            Ok(request) if request.log_id() == inner.id => request,
            _ => continue,
        };
        let Some(reply) = inner.handle(request) else {
            continue;
        };
        let bytes = match reply.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(log = %inner.id, "cannot encode {}: {e}", reply.kind());
                continue;
            }
        };
        if channel.send(Bytes::from(bytes)).is_err() {
            tracing::debug!(log = %inner.id, "channel closed, detaching");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlog_transport::MemoryChannel;
    use std::time::Duration;

    type Msg = SyncMessage<u32>;

    fn batch(start: u64, items: Vec<u32>) -> Msg {
        Msg::SyncBatch {
            log_id: "L1".into(),
            log_start_index: start,
            log_length: start + items.len() as u64,
            log_items: items,
        }
    }

    async fn ask(channel: &MemoryChannel, inbound: &mut Subscription, request: Msg) -> Msg {
        channel
            .send(Bytes::from(request.to_bytes().unwrap()))
            .unwrap();
        Msg::from_bytes(&inbound.recv().await.unwrap()).unwrap()
    }

    #[test]
    fn apply_replaces_tail() {
        let mut items = vec![1, 2, 3, 4];
        assert_eq!(apply_batch(&mut items, 2, vec![9]).unwrap(), 3);
        assert_eq!(items, vec![1, 2, 9]);
    }

    #[test]
    fn apply_at_end_appends() {
        let mut items = vec![1];
        assert_eq!(apply_batch(&mut items, 1, vec![2, 3]).unwrap(), 3);
        assert_eq!(items, vec![1, 2, 3]);
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let mut once = vec![1, 2, 3];
        apply_batch(&mut once, 1, vec![7, 8]).unwrap();
        let mut twice = once.clone();
        apply_batch(&mut twice, 1, vec![7, 8]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn gap_is_rejected_untouched() {
        let mut items = vec![1, 2];
        let err = apply_batch(&mut items, 5, vec![6]).unwrap_err();
        assert!(matches!(err, ProtocolError::GapInBatch { start: 5, length: 2 }));
        assert_eq!(items, vec![1, 2]);
    }

    #[tokio::test]
    async fn answers_handshake_and_batches() {
        let (ours, theirs) = MemoryChannel::pair();
        let remote: RemoteLog<u32> = RemoteLog::attach(
            "L1",
            Arc::new(theirs),
            RemoteLogConfig::new().batch_size(2),
        );
        let mut inbound = ours.listen();

        let reply = ask(
            &ours,
            &mut inbound,
            Msg::SyncStart {
                log_id: "L1".into(),
                log_length: 3,
            },
        )
        .await;
        assert_eq!(
            reply,
            Msg::SyncStartAccept {
                log_id: "L1".into(),
                remote_log_length: 0,
                batch_size: 2
            }
        );

        let reply = ask(&ours, &mut inbound, batch(0, vec![10, 11])).await;
        assert_eq!(
            reply,
            Msg::SyncBatchAck {
                log_id: "L1".into(),
                remote_log_length: 2,
                wait_ms: None
            }
        );
        assert_eq!(remote.items(), vec![10, 11]);
        assert_eq!(*remote.watch_len().borrow(), 2);
    }

    #[tokio::test]
    async fn gap_batch_is_denied_with_immediate_retry() {
        let (ours, theirs) = MemoryChannel::pair();
        let remote: RemoteLog<u32> =
            RemoteLog::attach("L1", Arc::new(theirs), RemoteLogConfig::default());
        let mut inbound = ours.listen();

        let reply = ask(&ours, &mut inbound, batch(4, vec![1])).await;
        assert_eq!(
            reply,
            Msg::SyncBatchDeny {
                log_id: "L1".into(),
                retry_ms: 0
            }
        );
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn ack_carries_configured_wait() {
        let (ours, theirs) = MemoryChannel::pair();
        let _remote: RemoteLog<u32> = RemoteLog::attach(
            "L1",
            Arc::new(theirs),
            RemoteLogConfig::new().ack_wait(Duration::from_millis(40)),
        );
        let mut inbound = ours.listen();

        let reply = ask(&ours, &mut inbound, batch(0, vec![1])).await;
        assert!(matches!(
            reply,
            Msg::SyncBatchAck {
                wait_ms: Some(40),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn other_logs_are_not_answered() {
        let (ours, theirs) = MemoryChannel::pair();
        let remote: RemoteLog<u32> =
            RemoteLog::attach("L1", Arc::new(theirs), RemoteLogConfig::default());
        let mut inbound = ours.listen();

        let other = Msg::SyncStart {
            log_id: "L2".into(),
            log_length: 1,
        };
        ours.send(Bytes::from(other.to_bytes().unwrap())).unwrap();
        let reply = ask(
            &ours,
            &mut inbound,
            Msg::SyncStart {
                log_id: "L1".into(),
                log_length: 1,
            },
        )
        .await;
        // The first reply is for L1; L2 got nothing.
        assert_eq!(reply.log_id(), "L1");
        assert!(inbound.try_recv().is_none());

        remote.destroy().await;
        remote.destroy().await;
        assert!(remote.is_destroyed());
    }

    #[tokio::test]
    async fn seeded_items_are_reported() {
        let (ours, theirs) = MemoryChannel::pair();
        let remote = RemoteLog::attach_with_items(
            "L1",
            vec![1u32, 2, 3],
            Arc::new(theirs),
            RemoteLogConfig::default(),
        );
        let mut inbound = ours.listen();
        let reply = ask(
            &ours,
            &mut inbound,
            Msg::SyncStart {
                log_id: "L1".into(),
                log_length: 0,
            },
        )
        .await;
        assert!(matches!(
            reply,
            Msg::SyncStartAccept {
                remote_log_length: 3,
                ..
            }
        ));
        assert_eq!(remote.wait_for_len(3).await, 3);
    }
}
