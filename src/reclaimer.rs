use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::Engine;

/// Background task that releases lapsed holds every `period`.
///
/// Cancellation is only observed between passes: a pass that has started
/// runs to completion, so no hold is left half-reclaimed.
pub async fn run_reclaimer(engine: Arc<Engine>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        engine.reclaim_once().await;
    }
    info!("reclaimer stopped");
}

/// Background task that compacts the WAL once it has grown by `threshold`
/// appends since the last compaction.
pub async fn run_compactor(
    engine: Arc<Engine>,
    period: Duration,
    threshold: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
    info!("compactor stopped");
}
