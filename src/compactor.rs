use std::sync::Weak;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compacts a salon's WAL once `threshold` appends have built up since the
/// last compaction. Exits when the engine is dropped.
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            return;
        };
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        info!("compacting WAL after {appends} appends");
        if let Err(e) = engine.compact_wal().await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}
