use std::sync::Arc;
use std::time::Instant;

use peerlog_protocol::{BrokerConfig, LocalLog, RemoteLog, RemoteLogConfig};
use peerlog_transport::{MemoryPeerConnector, SignalChannel};

use crate::common::{elapsed_ms, elapsed_s, spawn_broker, DelayedRelay};
use crate::events::*;

pub struct SyncConfig {
    pub items: u64,
    pub batch_size: u64,
    pub peers: u32,
    pub relay_delay_ms: u64,
    pub broker: BrokerConfig,
}

/// One source broker replicates a log to `peers` brokers over brokered
/// sessions. Returns the source log's metrics and whether every replica
/// ended up identical.
pub async fn run(config: SyncConfig, start: Instant) -> anyhow::Result<(bool, LocalLog<String>)> {
    emit(&EventStarted::new("sync"));
    eprintln!(
        "Sync mode → {} items, batch size {}, {} peers",
        config.items, config.batch_size, config.peers
    );

    let relay: Arc<dyn SignalChannel> = Arc::new(DelayedRelay::new(config.relay_delay_ms));
    let connector = MemoryPeerConnector::new();
    let source = spawn_broker(relay.clone(), &connector, &config.broker).await?;

    let log = LocalLog::new("sim");
    log.extend((0..config.items).map(|i| format!("item-{i}")));
    let expected = log.items();

    let sync_start = Instant::now();
    let mut peers = Vec::new();
    for _ in 0..config.peers {
        let peer = spawn_broker(relay.clone(), &connector, &config.broker).await?;
        let outbound = source.connect(peer.local()).await?;
        let inbound = peer.connect(source.local()).await?;

        let replica: RemoteLog<String> = RemoteLog::attach(
            "sim",
            inbound,
            RemoteLogConfig::new().batch_size(config.batch_size),
        );
        let channel = log.pipe(outbound)?;
        peers.push((peer, replica, channel));
    }

    let mut all_match = true;
    for (peer, replica, channel) in &peers {
        let remote_log_length = log.wait_synced(*channel).await?;
        let matches = replica.items() == expected;
        all_match &= matches;
        emit(&EventPeerSynced {
            event: "peer_synced",
            peer: peer.local().to_string(),
            remote_log_length,
            matches,
            sync_ms: elapsed_ms(sync_start),
            elapsed_s: elapsed_s(start),
        });
    }

    let metrics = log.metrics();
    emit(&EventSyncResult {
        event: "sync_result",
        peers: config.peers,
        items: config.items,
        batch_size: config.batch_size,
        handshakes: metrics.handshakes.get(),
        batches_sent: metrics.batches_sent.get(),
        items_sent: metrics.items_sent.get(),
        all_match,
        elapsed_ms: elapsed_ms(sync_start),
        elapsed_s: elapsed_s(start),
    });

    log.destroy();
    for (peer, replica, _) in peers {
        replica.destroy().await;
        peer.destroy().await;
    }
    source.destroy().await;

    eprintln!("Sync done: {}", if all_match { "ok" } else { "MISMATCH" });
    Ok((all_match, log))
}
