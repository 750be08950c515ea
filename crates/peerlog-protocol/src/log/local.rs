use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use peerlog_transport::{DuplexChannel, Subscription};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::message::{Retry, SyncMessage};
use super::state::ChannelState;
use super::{lock, read, write, LogConfig, LogItem};
use crate::metrics::LogMetrics;
use crate::ProtocolError;

/// Identifies one piped channel of a [`LocalLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelId(u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// The driving side of a replicated log.
///
/// Cheap to clone; clones share items and channels. Each piped channel gets
/// its own sync task, so channels progress independently. Items only change
/// through [`append`](Self::append) and [`extend`](Self::extend), and the
/// length never shrinks.
pub struct LocalLog<T> {
    inner: Arc<LogInner<T>>,
}

impl<T> Clone for LocalLog<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct LogInner<T> {
    id: String,
    items: RwLock<Vec<T>>,
    channels: Mutex<HashMap<ChannelId, Piped>>,
    next_channel: AtomicU64,
    config: LogConfig,
    metrics: LogMetrics,
    shutdown: CancellationToken,
}

struct Piped {
    channel: Arc<dyn DuplexChannel>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    state: watch::Receiver<ChannelState>,
    ended: watch::Receiver<Option<Ended>>,
}

/// How a channel's driver finished, as seen by waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    /// Unpiped or destroyed on purpose.
    Cancelled,
    /// Closed, abandoned by the remote, or failed.
    Closed,
}

impl Ended {
    fn into_error(self) -> ProtocolError {
        match self {
            Ended::Cancelled => ProtocolError::Cancelled,
            Ended::Closed => ProtocolError::ChannelClosed,
        }
    }
}

impl<T> LogInner<T> {
    fn len(&self) -> u64 {
        read(&self.items).len() as u64
    }

    /// Drop a channel's entry. Returns false if it was already gone.
    fn forget(&self, id: ChannelId) -> bool {
        match lock(&self.channels).remove(&id) {
            Some(piped) => {
                piped.cancel.cancel();
                self.metrics.piped_channels.dec();
                true
            }
            None => false,
        }
    }
}

impl<T: Clone> LogInner<T> {
    /// Up to `max` items from `start`, plus the current length.
    fn slice(&self, start: u64, max: u64) -> (Vec<T>, u64) {
        let items = read(&self.items);
        let len = items.len();
        let from = usize::try_from(start).unwrap_or(usize::MAX).min(len);
        let to = from.saturating_add(usize::try_from(max).unwrap_or(usize::MAX)).min(len);
        (items[from..to].to_vec(), len as u64)
    }
}

impl<T> Drop for LogInner<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<T: LogItem> LocalLog<T> {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_config(id, LogConfig::default())
    }

    pub fn with_config(id: impl Into<String>, config: LogConfig) -> Self {
        Self {
            inner: Arc::new(LogInner {
                id: id.into(),
                items: RwLock::new(Vec::new()),
                channels: Mutex::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
                config,
                metrics: LogMetrics::default(),
                shutdown: CancellationToken::new(),
            }),
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

    /// Snapshot of the items.
    pub fn items(&self) -> Vec<T> {
        read(&self.inner.items).clone()
    }

    pub fn metrics(&self) -> &LogMetrics {
        &self.inner.metrics
    }

    /// Append one item and wake every channel.
    pub fn append(&self, item: T) {
        write(&self.inner.items).push(item);
        self.wake_all();
    }

    /// Append several items with a single wake-up.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        write(&self.inner.items).extend(items);
        self.wake_all();
    }

    fn wake_all(&self) {
        for piped in lock(&self.inner.channels).values() {
            piped.wake.notify_one();
        }
    }

    /// Start syncing over `channel`.
    ///
    /// Piping the same channel (same `Arc`) twice returns the id it already
    /// has. Fails with [`ProtocolError::Cancelled`] after [`destroy`](Self::destroy).
    pub fn pipe(&self, channel: Arc<dyn DuplexChannel>) -> Result<ChannelId, ProtocolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }

        let mut channels = lock(&self.inner.channels);
        if let Some((id, _)) = channels
            .iter()
            .find(|(_, piped)| same_channel(&piped.channel, &channel))
        {
            tracing::warn!(log = %self.inner.id, channel = %id, "channel already piped");
            return Ok(*id);
        }

        let id = ChannelId(self.inner.next_channel.fetch_add(1, Ordering::Relaxed));
        let cancel = self.inner.shutdown.child_token();
        let wake = Arc::new(Notify::new());
        let (state_tx, state_rx) = watch::channel(ChannelState::Idle);
        let (ended_tx, ended_rx) = watch::channel(None);
        channels.insert(
            id,
            Piped {
                channel: channel.clone(),
                cancel: cancel.clone(),
                wake: wake.clone(),
                state: state_rx,
                ended: ended_rx,
            },
        );
        drop(channels);
        self.inner.metrics.piped_channels.inc();

        let driver = Driver {
            log: Arc::downgrade(&self.inner),
            log_id: self.inner.id.clone(),
            channel_id: id,
            channel,
            cancel,
            wake,
            state: state_tx,
            ended: ended_tx,
            response_timeout: self.inner.config.response_timeout,
        };
        tokio::spawn(driver.run());
        tracing::info!(log = %self.inner.id, channel = %id, "channel piped");
        Ok(id)
    }

    /// Stop syncing one channel, cancelling any outstanding request or
    /// backoff. Returns false if the channel was not piped.
    pub fn unpipe(&self, id: ChannelId) -> bool {
        let removed = self.inner.forget(id);
        if removed {
            tracing::info!(log = %self.inner.id, channel = %id, "channel unpiped");
        }
        removed
    }

    /// Stop syncing every channel. Idempotent; later `pipe` calls fail.
    pub fn destroy(&self) {
        self.inner.shutdown.cancel();
        let drained: Vec<Piped> = lock(&self.inner.channels)
            .drain()
            .map(|(_, piped)| piped)
            .collect();
        for piped in &drained {
            piped.cancel.cancel();
            self.inner.metrics.piped_channels.dec();
        }
        if !drained.is_empty() {
            tracing::info!(log = %self.inner.id, channels = drained.len(), "log destroyed");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Piped channels, in pipe order.
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = lock(&self.inner.channels).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Current sync state of a channel, `None` once it is torn down.
    pub fn state(&self, id: ChannelId) -> Option<ChannelState> {
        lock(&self.inner.channels)
            .get(&id)
            .map(|piped| *piped.state.borrow())
    }

    /// Follow a channel's state changes.
    pub fn watch_state(&self, id: ChannelId) -> Option<watch::Receiver<ChannelState>> {
        lock(&self.inner.channels)
            .get(&id)
            .map(|piped| piped.state.clone())
    }

    /// Wait until the remote on `id` holds every local item.
    ///
    /// Returns the remote length. Fails with [`ProtocolError::Cancelled`] if
    /// the channel is unpiped or the log destroyed first, and with
    /// [`ProtocolError::ChannelClosed`] if the channel closes, the remote
    /// abandons it or the sync fails.
    pub async fn wait_synced(&self, id: ChannelId) -> Result<u64, ProtocolError> {
        let (mut states, ended) = lock(&self.inner.channels)
            .get(&id)
            .map(|piped| (piped.state.clone(), piped.ended.clone()))
            .ok_or(ProtocolError::ChannelClosed)?;
        let inner = self.inner.clone();
        let synced = match states
            .wait_for(|state| {
                state
                    .remote_log_length()
                    .is_some_and(|remote| remote >= inner.len())
            })
            .await
        {
            Ok(state) => Ok(state.remote_log_length().unwrap_or_default()),
            // The driver records how it ended before its state sender drops.
            Err(_) => Err(ended.borrow().unwrap_or(Ended::Closed).into_error()),
        };
        synced
    }
}

fn same_channel(a: &Arc<dyn DuplexChannel>, b: &Arc<dyn DuplexChannel>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

// ── Per-channel driver ────────────────────────────────────────────────

/// Why a driver stopped.
#[derive(Debug)]
enum Stop {
    /// Unpiped, destroyed or the log was dropped.
    Cancelled,
    /// The remote denied with a negative retry.
    Abandoned,
    ChannelClosed,
    Failed(ProtocolError),
}

struct Driver<T> {
    log: Weak<LogInner<T>>,
    log_id: String,
    channel_id: ChannelId,
    channel: Arc<dyn DuplexChannel>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    state: watch::Sender<ChannelState>,
    ended: watch::Sender<Option<Ended>>,
    response_timeout: Option<Duration>,
}

impl<T: LogItem> Driver<T> {
    async fn run(self) {
        let stop = self.drive().await;
        let ended = match stop {
            Stop::Cancelled => Ended::Cancelled,
            _ => Ended::Closed,
        };
        self.ended.send_replace(Some(ended));
        let log = self.log.upgrade();
        match stop {
            Stop::Cancelled => {
                tracing::debug!(log = %self.log_id, channel = %self.channel_id, "sync cancelled");
            }
            Stop::Abandoned => {
                tracing::info!(log = %self.log_id, channel = %self.channel_id, "remote abandoned channel");
                if let Some(log) = &log {
                    log.metrics.abandoned_channels.inc();
                }
            }
            Stop::ChannelClosed => {
                tracing::warn!(log = %self.log_id, channel = %self.channel_id, "channel closed");
            }
            Stop::Failed(e) => {
                tracing::warn!(log = %self.log_id, channel = %self.channel_id, "sync failed: {e}");
            }
        }
        if let Some(log) = log {
            log.forget(self.channel_id);
        }
    }

    async fn drive(&self) -> Stop {
        let mut state = ChannelState::Idle;
        loop {
            self.set(state);
            let next = match state {
                ChannelState::Connected {
                    remote_log_length,
                    batch_size,
                } => self.push_batch(remote_log_length, batch_size).await,
                _ => self.handshake().await,
            };
            state = match next {
                Ok(next) => next,
                Err(stop) => return stop,
            };
        }
    }

    fn set(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    fn log(&self) -> Result<Arc<LogInner<T>>, Stop> {
        self.log.upgrade().ok_or(Stop::Cancelled)
    }

    async fn handshake(&self) -> Result<ChannelState, Stop> {
        let log_length = {
            let log = self.log()?;
            log.metrics.handshakes.inc();
            log.len()
        };
        self.set(ChannelState::Connecting);

        let request = SyncMessage::SyncStart {
            log_id: self.log_id.clone(),
            log_length,
        };
        let reply = self
            .request(&request, |reply| {
                matches!(
                    reply,
                    SyncMessage::SyncStartAccept { .. } | SyncMessage::SyncStartDeny { .. }
                )
            })
            .await?;

        match reply {
            Some(SyncMessage::SyncStartAccept {
                remote_log_length,
                batch_size,
                ..
            }) => {
                tracing::debug!(
                    log = %self.log_id,
                    channel = %self.channel_id,
                    remote_log_length,
                    batch_size,
                    "handshake accepted"
                );
                Ok(ChannelState::Connected {
                    remote_log_length,
                    batch_size: batch_size.max(1),
                })
            }
            Some(SyncMessage::SyncStartDeny { retry_ms, .. }) => {
                self.backoff(retry_ms).await
            }
            _ => Ok(ChannelState::Idle),
        }
    }

    async fn push_batch(&self, remote: u64, batch_size: u64) -> Result<ChannelState, Stop> {
        let connected = ChannelState::Connected {
            remote_log_length: remote,
            batch_size,
        };
        let (log_items, log_length) = {
            let log = self.log()?;
            let (items, length) = log.slice(remote, batch_size);
            if remote < length {
                log.metrics.batches_sent.inc();
                log.metrics.items_sent.add(items.len() as u64);
            }
            (items, length)
        };

        if remote >= log_length {
            // Caught up: park until the next append.
            return tokio::select! {
                _ = self.cancel.cancelled() => Err(Stop::Cancelled),
                _ = self.wake.notified() => Ok(connected),
            };
        }

        self.set(ChannelState::Syncing);
        let request = SyncMessage::SyncBatch {
            log_id: self.log_id.clone(),
            log_start_index: remote,
            log_items,
            log_length,
        };
        let reply = self
            .request(&request, |reply| {
                matches!(
                    reply,
                    SyncMessage::SyncBatchAck { .. } | SyncMessage::SyncBatchDeny { .. }
                )
            })
            .await?;

        match reply {
            Some(SyncMessage::SyncBatchAck {
                remote_log_length,
                wait_ms,
                ..
            }) => {
                if remote_log_length < remote {
                    tracing::warn!(
                        log = %self.log_id,
                        channel = %self.channel_id,
                        remote_log_length,
                        remote,
                        "ack went backwards, restarting handshake"
                    );
                    return Ok(ChannelState::Idle);
                }
                if let Some(wait) = wait_ms.filter(|ms| *ms > 0) {
                    self.set(ChannelState::SyncWaiting);
                    self.sleep(Duration::from_millis(wait)).await?;
                }
                Ok(ChannelState::Connected {
                    remote_log_length,
                    batch_size,
                })
            }
            Some(SyncMessage::SyncBatchDeny { retry_ms, .. }) => {
                self.backoff(retry_ms).await
            }
            _ => Ok(ChannelState::Idle),
        }
    }

    /// Apply a deny's retry policy. Both deny kinds wait in `ConnectWaiting`
    /// and come back through a fresh handshake.
    async fn backoff(&self, retry_ms: i64) -> Result<ChannelState, Stop> {
        if let Some(log) = self.log.upgrade() {
            log.metrics.denies.inc();
        }
        match Retry::from_retry_ms(retry_ms) {
            Retry::Abandon => Err(Stop::Abandoned),
            Retry::Immediately => Ok(ChannelState::Idle),
            Retry::After(delay) => {
                tracing::debug!(
                    log = %self.log_id,
                    channel = %self.channel_id,
                    "denied, retrying in {delay:?}"
                );
                self.set(ChannelState::ConnectWaiting);
                self.sleep(delay).await?;
                Ok(ChannelState::Idle)
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> Result<(), Stop> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Send `request` and wait for the first reply on this log matching
    /// `expect`. `Ok(None)` means the response timeout fired.
    async fn request(
        &self,
        request: &SyncMessage<T>,
        expect: impl Fn(&SyncMessage<T>) -> bool,
    ) -> Result<Option<SyncMessage<T>>, Stop> {
        let bytes = request.to_bytes().map_err(Stop::Failed)?;

        // Listen before sending so a fast reply cannot slip past.
        let mut inbound = self.channel.listen();
        if let Err(e) = self.channel.send(Bytes::from(bytes)) {
            tracing::debug!(log = %self.log_id, channel = %self.channel_id, "send failed: {e}");
            return Err(Stop::ChannelClosed);
        }
        tracing::debug!(log = %self.log_id, channel = %self.channel_id, kind = request.kind(), "request sent");

        let reply = self.next_reply(&mut inbound, expect);
        match self.response_timeout {
            None => reply.await.map(Some),
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(reply) => reply.map(Some),
                Err(_) => {
                    tracing::debug!(
                        log = %self.log_id,
                        channel = %self.channel_id,
                        "no reply within {limit:?}, restarting handshake"
                    );
                    Ok(None)
                }
            },
        }
    }

    async fn next_reply(
        &self,
        inbound: &mut Subscription,
        expect: impl Fn(&SyncMessage<T>) -> bool,
    ) -> Result<SyncMessage<T>, Stop> {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                frame = inbound.recv() => frame.ok_or(Stop::ChannelClosed)?,
            };
            // Anything that is not a matching reply for this log belongs
            // to someone else on the channel.
            if let Ok(message) = SyncMessage::<T>::from_bytes(&frame) {
                if message.log_id() == self.log_id && expect(&message) {
                    return Ok(message);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlog_transport::MemoryChannel;

    type Msg = SyncMessage<String>;

    /// Next request the driver put on the wire.
    async fn expect_request(inbound: &mut Subscription) -> Msg {
        let frame = inbound.recv().await.expect("request");
        Msg::from_bytes(&frame).unwrap()
    }

    fn reply(channel: &MemoryChannel, message: Msg) {
        channel.send(Bytes::from(message.to_bytes().unwrap())).unwrap();
    }

    fn accept(remote_log_length: u64, batch_size: u64) -> Msg {
        Msg::SyncStartAccept {
            log_id: "L1".into(),
            remote_log_length,
            batch_size,
        }
    }

    fn ack(remote_log_length: u64) -> Msg {
        Msg::SyncBatchAck {
            log_id: "L1".into(),
            remote_log_length,
            wait_ms: None,
        }
    }

    fn setup(items: &[&str]) -> (LocalLog<String>, Arc<MemoryChannel>, MemoryChannel) {
        let log = LocalLog::new("L1");
        log.extend(items.iter().map(|s| s.to_string()));
        let (ours, theirs) = MemoryChannel::pair();
        (log, Arc::new(ours), theirs)
    }

    #[tokio::test]
    async fn scripted_exchange_in_batches_of_two() {
        let (log, ours, theirs) = setup(&["a", "b", "c", "d", "e"]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();

        assert_eq!(
            expect_request(&mut inbound).await,
            Msg::SyncStart {
                log_id: "L1".into(),
                log_length: 5
            }
        );
        reply(&theirs, accept(0, 2));

        for (start, items, acked) in [(0, vec!["a", "b"], 2), (2, vec!["c", "d"], 4), (4, vec!["e"], 5)] {
            assert_eq!(
                expect_request(&mut inbound).await,
                Msg::SyncBatch {
                    log_id: "L1".into(),
                    log_start_index: start,
                    log_items: items.into_iter().map(String::from).collect(),
                    log_length: 5,
                }
            );
            reply(&theirs, ack(acked));
        }

        assert_eq!(log.wait_synced(id).await.unwrap(), 5);
        assert_eq!(
            log.state(id),
            Some(ChannelState::Connected {
                remote_log_length: 5,
                batch_size: 2
            })
        );
        // Nothing further is sent while caught up.
        tokio::task::yield_now().await;
        assert!(inbound.try_recv().is_none());
        assert_eq!(log.metrics().batches_sent.get(), 3);
        assert_eq!(log.metrics().items_sent.get(), 5);
    }

    #[tokio::test]
    async fn append_wakes_caught_up_channel() {
        let (log, ours, theirs) = setup(&[]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();

        expect_request(&mut inbound).await;
        reply(&theirs, accept(0, 10));
        assert_eq!(log.wait_synced(id).await.unwrap(), 0);

        log.append("x".to_string());
        assert_eq!(
            expect_request(&mut inbound).await,
            Msg::SyncBatch {
                log_id: "L1".into(),
                log_start_index: 0,
                log_items: vec!["x".into()],
                log_length: 1,
            }
        );
    }

    #[tokio::test]
    async fn abandon_tears_channel_down() {
        let (log, ours, theirs) = setup(&["a"]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();

        expect_request(&mut inbound).await;
        reply(
            &theirs,
            Msg::SyncStartDeny {
                log_id: "L1".into(),
                retry_ms: -1,
            },
        );

        assert!(log.wait_synced(id).await.is_err());
        assert_eq!(log.state(id), None);
        assert!(log.channels().is_empty());
        assert_eq!(log.metrics().abandoned_channels.get(), 1);
        assert_eq!(log.metrics().piped_channels.get(), 0);

        // No further sync-start after abandon.
        log.append("b".into());
        tokio::task::yield_now().await;
        assert!(inbound.try_recv().is_none());
    }

    #[tokio::test]
    async fn zero_retry_handshakes_again_at_once() {
        let (log, ours, theirs) = setup(&["a"]);
        let mut inbound = theirs.listen();
        log.pipe(ours).unwrap();

        expect_request(&mut inbound).await;
        reply(
            &theirs,
            Msg::SyncStartDeny {
                log_id: "L1".into(),
                retry_ms: 0,
            },
        );
        assert!(matches!(
            expect_request(&mut inbound).await,
            Msg::SyncStart { log_length: 1, .. }
        ));
        assert_eq!(log.metrics().handshakes.get(), 2);
        assert_eq!(log.metrics().denies.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_retry_waits_then_retries_once() {
        let (log, ours, theirs) = setup(&["a"]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();

        expect_request(&mut inbound).await;
        reply(
            &theirs,
            Msg::SyncStartDeny {
                log_id: "L1".into(),
                retry_ms: 1_000,
            },
        );

        let started = tokio::time::Instant::now();
        let mut states = log.watch_state(id).unwrap();
        states
            .wait_for(|s| *s == ChannelState::ConnectWaiting)
            .await
            .unwrap();
        assert!(inbound.try_recv().is_none());

        assert!(matches!(
            expect_request(&mut inbound).await,
            Msg::SyncStart { .. }
        ));
        assert!(started.elapsed() >= Duration::from_millis(1_000));
        assert!(inbound.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unpipe_cancels_pending_backoff() {
        let (log, ours, theirs) = setup(&["a"]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();

        expect_request(&mut inbound).await;
        reply(
            &theirs,
            Msg::SyncStartDeny {
                log_id: "L1".into(),
                retry_ms: 5_000,
            },
        );
        let mut states = log.watch_state(id).unwrap();
        states
            .wait_for(|s| *s == ChannelState::ConnectWaiting)
            .await
            .unwrap();

        assert!(log.unpipe(id));
        assert!(!log.unpipe(id));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(inbound.try_recv().is_none());
    }

    fn batch_deny(retry_ms: i64) -> Msg {
        Msg::SyncBatchDeny {
            log_id: "L1".into(),
            retry_ms,
        }
    }

    /// Pipe, accept the handshake and return with the first batch in flight.
    async fn first_batch_in_flight(
        items: &[&str],
        batch_size: u64,
    ) -> (LocalLog<String>, ChannelId, MemoryChannel, Subscription) {
        let (log, ours, theirs) = setup(items);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();
        expect_request(&mut inbound).await;
        reply(&theirs, accept(0, batch_size));
        assert!(matches!(
            expect_request(&mut inbound).await,
            Msg::SyncBatch { log_start_index: 0, .. }
        ));
        (log, id, theirs, inbound)
    }

    #[tokio::test(start_paused = true)]
    async fn unpipe_while_connecting_reports_cancellation() {
        let (log, ours, theirs) = setup(&["a"]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();
        expect_request(&mut inbound).await;
        assert_eq!(log.state(id), Some(ChannelState::Connecting));

        let waiter = tokio::spawn({
            let log = log.clone();
            async move { log.wait_synced(id).await }
        });
        tokio::task::yield_now().await;

        assert!(log.unpipe(id));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ProtocolError::Cancelled)
        ));

        // A late accept changes nothing and no request follows.
        reply(&theirs, accept(0, 2));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(inbound.try_recv().is_none());
        assert_eq!(log.metrics().batches_sent.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_while_syncing_reports_cancellation() {
        let (log, id, theirs, mut inbound) = first_batch_in_flight(&["a", "b", "c"], 1).await;
        assert_eq!(log.state(id), Some(ChannelState::Syncing));

        let waiter = tokio::spawn({
            let log = log.clone();
            async move { log.wait_synced(id).await }
        });
        tokio::task::yield_now().await;

        log.destroy();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ProtocolError::Cancelled)
        ));

        reply(&theirs, ack(1));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(inbound.try_recv().is_none());
        assert_eq!(log.metrics().batches_sent.get(), 1);
    }

    #[tokio::test]
    async fn abandoned_channel_is_not_reported_as_cancelled() {
        let (log, id, theirs, mut inbound) = first_batch_in_flight(&["a", "b"], 1).await;

        reply(&theirs, batch_deny(-1));
        assert!(matches!(
            log.wait_synced(id).await,
            Err(ProtocolError::ChannelClosed)
        ));
        assert_eq!(log.metrics().abandoned_channels.get(), 1);
        assert_eq!(log.metrics().denies.get(), 1);
        assert!(log.channels().is_empty());

        log.append("c".into());
        tokio::task::yield_now().await;
        assert!(inbound.try_recv().is_none());
    }

    #[tokio::test]
    async fn batch_deny_zero_handshakes_again_at_once() {
        let (log, _id, theirs, mut inbound) = first_batch_in_flight(&["a", "b"], 1).await;

        reply(&theirs, batch_deny(0));
        assert!(matches!(
            expect_request(&mut inbound).await,
            Msg::SyncStart { log_length: 2, .. }
        ));
        assert_eq!(log.metrics().handshakes.get(), 2);
        assert_eq!(log.metrics().denies.get(), 1);

        // The remote's reported length is where sending resumes.
        reply(&theirs, accept(1, 1));
        assert_eq!(
            expect_request(&mut inbound).await,
            Msg::SyncBatch {
                log_id: "L1".into(),
                log_start_index: 1,
                log_items: vec!["b".into()],
                log_length: 2,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_batch_deny_waits_in_connect_waiting() {
        let (log, id, theirs, mut inbound) = first_batch_in_flight(&["a"], 1).await;
        let mut states = log.watch_state(id).unwrap();

        reply(&theirs, batch_deny(750));
        let started = tokio::time::Instant::now();
        states
            .wait_for(|s| *s == ChannelState::ConnectWaiting)
            .await
            .unwrap();
        assert!(inbound.try_recv().is_none());

        assert!(matches!(
            expect_request(&mut inbound).await,
            Msg::SyncStart { .. }
        ));
        assert!(started.elapsed() >= Duration::from_millis(750));
        assert!(inbound.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_wait_throttles_next_batch() {
        let (log, id, theirs, mut inbound) = first_batch_in_flight(&["a", "b"], 1).await;
        let mut states = log.watch_state(id).unwrap();

        reply(
            &theirs,
            Msg::SyncBatchAck {
                log_id: "L1".into(),
                remote_log_length: 1,
                wait_ms: Some(500),
            },
        );
        let started = tokio::time::Instant::now();
        states
            .wait_for(|s| *s == ChannelState::SyncWaiting)
            .await
            .unwrap();
        assert!(inbound.try_recv().is_none());

        assert!(matches!(
            expect_request(&mut inbound).await,
            Msg::SyncBatch { log_start_index: 1, .. }
        ));
        assert!(started.elapsed() >= Duration::from_millis(500));
        // Throttling is not a deny.
        assert_eq!(log.metrics().denies.get(), 0);
        assert_eq!(log.metrics().handshakes.get(), 1);
    }

    #[tokio::test]
    async fn duplicate_pipe_returns_existing_id() {
        let (log, ours, _theirs) = setup(&[]);
        let first = log.pipe(ours.clone()).unwrap();
        let second = log.pipe(ours).unwrap();
        assert_eq!(first, second);
        assert_eq!(log.channels(), vec![first]);
    }

    #[tokio::test]
    async fn destroy_stops_everything_and_is_idempotent() {
        let log: LocalLog<String> = LocalLog::new("L1");
        let (a, _a_remote) = MemoryChannel::pair();
        let (b, _b_remote) = MemoryChannel::pair();
        log.pipe(Arc::new(a)).unwrap();
        log.pipe(Arc::new(b)).unwrap();
        assert_eq!(log.metrics().piped_channels.get(), 2);

        log.destroy();
        log.destroy();
        assert!(log.is_destroyed());
        assert!(log.channels().is_empty());
        assert_eq!(log.metrics().piped_channels.get(), 0);
        let (c, _) = MemoryChannel::pair();
        assert!(matches!(
            log.pipe(Arc::new(c)),
            Err(ProtocolError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn closed_channel_removes_entry() {
        let (log, ours, theirs) = setup(&["a"]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();
        expect_request(&mut inbound).await;

        theirs.close();
        assert!(matches!(
            log.wait_synced(id).await,
            Err(ProtocolError::ChannelClosed)
        ));
        assert!(log.channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout_restarts_handshake() {
        let log: LocalLog<String> = LocalLog::with_config(
            "L1",
            LogConfig::new().response_timeout(Duration::from_secs(2)),
        );
        let (ours, theirs) = MemoryChannel::pair();
        let mut inbound = theirs.listen();
        log.pipe(Arc::new(ours)).unwrap();

        expect_request(&mut inbound).await;
        // Silence; the driver gives up and sends sync-start again.
        assert!(matches!(
            expect_request(&mut inbound).await,
            Msg::SyncStart { .. }
        ));
    }

    #[tokio::test]
    async fn replies_for_other_logs_are_ignored() {
        let (log, ours, theirs) = setup(&["a"]);
        let mut inbound = theirs.listen();
        let id = log.pipe(ours).unwrap();

        expect_request(&mut inbound).await;
        reply(
            &theirs,
            Msg::SyncStartDeny {
                log_id: "other".into(),
                retry_ms: -1,
            },
        );
        theirs.send(Bytes::from_static(b"not msgpack")).unwrap();
        reply(&theirs, accept(1, 5));
        assert_eq!(log.wait_synced(id).await.unwrap(), 1);
        assert_eq!(log.metrics().denies.get(), 0);
    }

    #[test]
    fn slice_clamps_to_length() {
        let log: LocalLog<String> = LocalLog::new("L1");
        log.extend(["a", "b", "c"].map(String::from));
        assert_eq!(log.inner.slice(1, 10), (vec!["b".into(), "c".into()], 3));
        assert_eq!(log.inner.slice(5, 2), (vec![], 3));
        assert_eq!(log.inner.slice(0, u64::MAX).0.len(), 3);
    }
}
