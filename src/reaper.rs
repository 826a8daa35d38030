use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::session::MemorySessionStore;
use crate::store::{Store, StoreError};

/// Background task that periodically drops idle sessions.
pub async fn run_session_reaper(sessions: Arc<MemorySessionStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let reaped = sessions.sweep(Instant::now());
        if reaped > 0 {
            metrics::counter!(crate::observability::SESSIONS_REAPED_TOTAL).increment(reaped as u64);
            info!("reaped {reaped} idle sessions");
        }
    }
}

/// Compact once `threshold` appends have piled up since the last compaction.
pub async fn compact_if_needed(store: &Store, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    let started = Instant::now();
    store.compact_wal().await?;
    info!("compacted WAL after {appends} appends in {:?}", started.elapsed());
    Ok(true)
}

/// Background task that checks the compaction threshold every `every`.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::session::SessionStore;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let store = Store::open(test_wal_path("compact_threshold.wal"), crate::limits::DEFAULT_STORE_TIMEOUT)
            .unwrap();
        let room = store.create_room("Room".into()).await.unwrap();
        for day in 1..=4u32 {
            let start = chrono::NaiveDate::from_ymd_opt(2024, 3, day * 2).unwrap();
            store
                .add_block(room.id, Stay::new(start, start.succ_opt().unwrap()))
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&store, 10).await.unwrap());
        assert!(compact_if_needed(&store, 5).await.unwrap());
        assert_eq!(store.wal_appends_since_compact().await, 0);
        assert!(!compact_if_needed(&store, 5).await.unwrap());
    }

    #[tokio::test]
    async fn session_reaper_sweeps() {
        let sessions = Arc::new(MemorySessionStore::new(Duration::from_millis(10)));
        sessions.load_or_create(None).await.unwrap();
        let handle = tokio::spawn(run_session_reaper(sessions.clone(), Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sessions.is_empty());
        handle.abort();
    }
}
