use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use securetransfer_db::SqliteSessionStore;
use securetransfer_types::ServerConfig;

use crate::storage::DiskStorage;

/// Background task that evicts abandoned transfer sessions.
///
/// The server evicts stale sessions lazily when a message arrives for them;
/// this loop catches the ones whose client never came back, and removes
/// their partial uploads from disk.
pub async fn run_cleanup_loop(
    store: Arc<SqliteSessionStore>,
    storage: Arc<DiskStorage>,
    config: ServerConfig,
    interval: Duration,
) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        let store = store.clone();
        let storage = storage.clone();
        let config = config.clone();
        let swept = tokio::task::spawn_blocking(move || cleanup_stale(&store, &storage, &config)).await;

        match swept {
            Ok(Ok(count)) => {
                if count > 0 {
                    info!("Cleanup: evicted {} stale sessions", count);
                }
            }
            Ok(Err(e)) => warn!("Cleanup error: {}", e),
            Err(e) => warn!("Cleanup task failed: {}", e),
        }
    }
}

pub fn cleanup_stale(
    store: &SqliteSessionStore,
    storage: &DiskStorage,
    config: &ServerConfig,
) -> anyhow::Result<usize> {
    let swept = store.sweep_stale(config.session_timeout(), config.handshake_timeout())?;
    for id in &swept {
        storage.discard_partial(id).ok();
    }
    Ok(swept.len())
}
