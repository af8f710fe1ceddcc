use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Engine;

/// Background task that rewrites the store WAL once enough appends piled up.
pub async fn run_compactor(
    engine: Arc<Engine>,
    threshold: u64,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        compact_if_needed(&engine, threshold).await;
    }
    debug!("compactor stopped");
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_stale_frames().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(written) => {
            info!("compacted store WAL: {appends} appends -> {written} live bookings");
            true
        }
        Err(e) => {
            error!("store WAL compaction failed: {e}");
            false
        }
    }
}
