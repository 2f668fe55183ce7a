use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::observability;

/// Background task that compacts the journal once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compaction check. Returns whether a compaction ran successfully.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted journal after {appends} appends");
            metrics::counter!(observability::COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            true
        }
        Err(e) => {
            // Retried on the next tick; the old journal is still intact.
            tracing::error!("journal compaction failed: {e}");
            metrics::counter!(observability::COMPACTIONS_TOTAL, "status" => "error").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Page;
    use chrono::NaiveDate;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeeper_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("compactor_threshold.wal");
        let engine = Engine::new(path.clone()).unwrap();
        let d = |s: &str| s.parse::<NaiveDate>().unwrap();

        engine.upsert_room(1, 1, 100, 1).await.unwrap();
        for _ in 0..4 {
            let r = engine
                .create_booking(1, 7, d("2025-03-01"), d("2025-03-02"))
                .await
                .unwrap();
            engine.cancel_booking(r.id, 7).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 9);

        assert!(!compact_if_due(&engine, 10).await);
        assert!(compact_if_due(&engine, 9).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        drop(engine);
        let engine = Engine::new(path).unwrap();
        assert!(engine.get_room(1).await.is_some());
        assert!(engine.list_all_bookings(Page::default()).await.unwrap().is_empty());
    }
}
