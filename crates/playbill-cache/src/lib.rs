use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use playbill_core::WorkId;
use playbill_store::{CatalogStore, SnapshotRecord, StoreError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("snapshot payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("refresh failed: {0}")]
    Refresh(String),
}

/// Rebuilds the snapshot for a work when a stale read asks for it. The
/// implementation writes the fresh payload through the store itself; the
/// cache only schedules and bounds the work.
#[async_trait]
pub trait SnapshotRefresher: Send + Sync {
    async fn rebuild(&self, work_id: WorkId, city_norm: Option<&str>) -> Result<(), CacheError>;
}

/// What a reader gets back: always immediately, always the last-known-good
/// payload (possibly `Null` when nothing was ever reconciled).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotView {
    pub work_id: WorkId,
    pub city_norm: Option<String>,
    pub payload: Value,
    pub stale: bool,
    pub ttl_seconds: i64,
    pub last_success_at: Option<i64>,
}

pub struct SnapshotCache {
    store: Arc<Mutex<CatalogStore>>,
    refresher: Arc<dyn SnapshotRefresher>,
    refresh_slots: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<WorkId>>>,
    default_ttl_secs: i64,
}

impl SnapshotCache {
    pub fn new(
        store: Arc<Mutex<CatalogStore>>,
        refresher: Arc<dyn SnapshotRefresher>,
        refresh_limit: usize,
        default_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            refresher,
            refresh_slots: Arc::new(Semaphore::new(refresh_limit.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            default_ttl_secs,
        }
    }

    /// Read the cached view for a work. A missing or expired snapshot is
    /// flagged stale and a background refresh is scheduled fire-and-forget;
    /// the caller never waits on it and never sees an error.
    pub fn read(&self, work_id: WorkId, city_hint: Option<&str>) -> SnapshotView {
        let snapshot = match lock_unpoisoned(&self.store).get_snapshot(work_id, city_hint) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(work_id, error = %err, "snapshot read failed");
                None
            }
        };

        let view = match snapshot {
            Some(record) => view_from_record(record),
            None => SnapshotView {
                work_id,
                city_norm: city_hint
                    .filter(|city| !city.is_empty())
                    .map(str::to_owned),
                payload: Value::Null,
                stale: true,
                ttl_seconds: self.default_ttl_secs,
                last_success_at: None,
            },
        };

        if view.stale {
            self.schedule_refresh(work_id, view.city_norm.clone());
        }
        view
    }

    /// Atomically replace the snapshot for (work, city scope) with a freshly
    /// reconciled payload.
    pub fn write(
        &self,
        work_id: WorkId,
        city_norm: Option<&str>,
        payload: &Value,
        ttl_seconds: Option<i64>,
    ) -> Result<SnapshotRecord, CacheError> {
        let body = serde_json::to_string(payload)?;
        let record = lock_unpoisoned(&self.store).upsert_snapshot(
            work_id,
            city_norm.unwrap_or(""),
            &body,
            ttl_seconds.unwrap_or(self.default_ttl_secs),
            Utc::now().timestamp(),
        )?;
        Ok(record)
    }

    /// At most one refresh is in flight per work id, and all refreshes share
    /// a bounded pool so a burst of stale reads cannot saturate the fetch
    /// path. Outside a runtime the refresh is skipped; the snapshot simply
    /// stays stale until a later read retries.
    fn schedule_refresh(&self, work_id: WorkId, city_norm: Option<String>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(work_id, "no async runtime; skipping background refresh");
            return;
        };

        {
            let mut in_flight = lock_in_flight(&self.in_flight);
            if !in_flight.insert(work_id) {
                return;
            }
        }

        let refresher = self.refresher.clone();
        let slots = self.refresh_slots.clone();
        let in_flight = self.in_flight.clone();

        handle.spawn(async move {
            match slots.acquire_owned().await {
                Ok(_permit) => {
                    if let Err(err) = refresher.rebuild(work_id, city_norm.as_deref()).await {
                        // Last-known-good stays served; a later stale read
                        // will retry.
                        tracing::warn!(work_id, error = %err, "background snapshot refresh failed");
                    }
                }
                Err(_) => {
                    tracing::warn!(work_id, "refresh pool closed before refresh ran");
                }
            }
            lock_in_flight(&in_flight).remove(&work_id);
        });
    }
}

fn view_from_record(record: SnapshotRecord) -> SnapshotView {
    let age = Utc::now().timestamp() - record.last_success_at;
    let stale = age >= record.ttl_seconds;

    let payload = match serde_json::from_str(&record.payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(
                work_id = record.work_id,
                error = %err,
                "stored snapshot payload is corrupt; serving empty"
            );
            Value::Null
        }
    };

    SnapshotView {
        work_id: record.work_id,
        city_norm: (!record.city_norm.is_empty()).then(|| record.city_norm.clone()),
        payload,
        stale,
        ttl_seconds: record.ttl_seconds,
        last_success_at: Some(record.last_success_at),
    }
}

fn lock_unpoisoned(store: &Mutex<CatalogStore>) -> MutexGuard<'_, CatalogStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lock_in_flight(in_flight: &Mutex<HashSet<WorkId>>) -> MutexGuard<'_, HashSet<WorkId>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    use super::*;

    struct CountingRefresher {
        calls: AtomicUsize,
        block_on: Option<Arc<Notify>>,
    }

    impl CountingRefresher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                block_on: None,
            })
        }

        fn blocking(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                block_on: Some(gate),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotRefresher for CountingRefresher {
        async fn rebuild(&self, _work_id: WorkId, _city: Option<&str>) -> Result<(), CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.block_on {
                gate.notified().await;
            }
            Ok(())
        }
    }

    struct FailingRefresher;

    #[async_trait]
    impl SnapshotRefresher for FailingRefresher {
        async fn rebuild(&self, _work_id: WorkId, _city: Option<&str>) -> Result<(), CacheError> {
            Err(CacheError::Refresh("upstream unavailable".to_owned()))
        }
    }

    fn open_store(path: &std::path::Path) -> Arc<Mutex<CatalogStore>> {
        Arc::new(Mutex::new(CatalogStore::open(path).expect("open store")))
    }

    async fn drain_spawned_tasks() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fresh_snapshot_reads_clean_without_refresh() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let refresher = CountingRefresher::new();
        let cache = SnapshotCache::new(store, refresher.clone(), 4, 900);

        let payload = json!({"tickets": [], "summary": {}});
        cache.write(1, None, &payload, None).expect("write");

        let view = cache.read(1, None);
        assert!(!view.stale);
        assert_eq!(view.payload, payload);
        assert_eq!(view.ttl_seconds, 900);

        drain_spawned_tasks().await;
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn absent_snapshot_is_stale_and_triggers_refresh() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let refresher = CountingRefresher::new();
        let cache = SnapshotCache::new(store, refresher.clone(), 4, 900);

        let view = cache.read(42, None);
        assert!(view.stale);
        assert_eq!(view.payload, Value::Null);
        assert_eq!(view.last_success_at, None);

        drain_spawned_tasks().await;
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn expired_snapshot_serves_last_known_good_and_refreshes() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let refresher = CountingRefresher::new();
        let cache = SnapshotCache::new(store.clone(), refresher.clone(), 4, 900);

        let old = Utc::now().timestamp() - 3_600;
        store
            .lock()
            .expect("store lock")
            .upsert_snapshot(7, "", r#"{"tickets":["kept"]}"#, 900, old)
            .expect("seed stale snapshot");

        let view = cache.read(7, None);
        assert!(view.stale);
        assert_eq!(view.payload, json!({"tickets": ["kept"]}));
        assert_eq!(view.last_success_at, Some(old));

        drain_spawned_tasks().await;
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_stale_reads_share_one_refresh() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let gate = Arc::new(Notify::new());
        let refresher = CountingRefresher::blocking(gate.clone());
        let cache = SnapshotCache::new(store, refresher.clone(), 4, 900);

        // Both reads happen before the spawned refresh can finish; the
        // second must piggyback on the first.
        let first = cache.read(9, None);
        let second = cache.read(9, None);
        assert!(first.stale && second.stale);

        drain_spawned_tasks().await;
        assert_eq!(refresher.calls(), 1);

        gate.notify_one();
        drain_spawned_tasks().await;

        // Once the first refresh has fully finished a stale read may trigger
        // a new one.
        cache.read(9, None);
        drain_spawned_tasks().await;
        assert_eq!(refresher.calls(), 2);
        gate.notify_one();
    }

    #[tokio::test]
    async fn stale_read_does_not_block_on_the_refresh() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        // The gate is never opened: the refresh would hang forever if the
        // read awaited it.
        let refresher = CountingRefresher::blocking(Arc::new(Notify::new()));
        let cache = SnapshotCache::new(store, refresher, 4, 900);

        let view = cache.read(5, None);
        assert!(view.stale);
    }

    #[tokio::test]
    async fn failed_refresh_preserves_the_previous_snapshot() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let cache = SnapshotCache::new(store.clone(), Arc::new(FailingRefresher), 4, 900);

        let old = Utc::now().timestamp() - 3_600;
        store
            .lock()
            .expect("store lock")
            .upsert_snapshot(3, "", r#"{"tickets":["good"]}"#, 900, old)
            .expect("seed stale snapshot");

        let first = cache.read(3, None);
        drain_spawned_tasks().await;
        let second = cache.read(3, None);

        assert!(first.stale && second.stale);
        assert_eq!(second.payload, json!({"tickets": ["good"]}));
        assert_eq!(second.last_success_at, Some(old));
    }

    #[tokio::test]
    async fn write_scopes_snapshots_by_city() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let cache = SnapshotCache::new(store, CountingRefresher::new(), 4, 900);

        cache
            .write(1, Some("上海"), &json!({"city": "sh"}), Some(600))
            .expect("write sh");
        cache
            .write(1, Some("北京"), &json!({"city": "bj"}), Some(600))
            .expect("write bj");

        let sh = cache.read(1, Some("上海"));
        assert_eq!(sh.payload, json!({"city": "sh"}));
        assert_eq!(sh.city_norm.as_deref(), Some("上海"));
        assert_eq!(sh.ttl_seconds, 600);

        let bj = cache.read(1, Some("北京"));
        assert_eq!(bj.payload, json!({"city": "bj"}));
    }
}
