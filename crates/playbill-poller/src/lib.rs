use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use playbill_core::{WorkId, normalize_city, payload_hash};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::sleep;

pub const DEFAULT_CALLBACK_LIMIT: usize = 8;

/// Consecutive fetch failures are capped here; beyond two the interval is
/// already at its top tier.
const FAILURE_COUNT_CAP: u32 = 3;

#[derive(Debug, Error)]
#[error("fetch failed: {0}")]
pub struct FetchError(pub String);

#[derive(Debug, Error)]
#[error("change callback failed: {0}")]
pub struct CallbackError(pub String);

/// One update returned by the external source: an opaque snapshot body for a
/// (work, city) scope, optionally pre-hashed by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePayload {
    pub work_id: WorkId,
    pub city_norm: Option<String>,
    pub snapshot: Value,
    pub payload_hash: Option<String>,
}

/// What the registered consumer receives for every deduplicated change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub work_id: WorkId,
    pub city_norm: Option<String>,
    pub payload: Value,
    pub payload_hash: String,
}

#[async_trait]
pub trait UpdateFetcher: Send + Sync {
    async fn fetch_updates(&self) -> Result<Vec<UpdatePayload>, FetchError>;
}

#[async_trait]
pub trait ChangeCallback: Send + Sync {
    async fn on_change(&self, event: ChangeEvent) -> Result<(), CallbackError>;
}

/// Poll cadence: baseline while healthy, one tier up after a single fetch
/// failure, top tier from the second consecutive failure on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub baseline: Duration,
    pub one_failure: Duration,
    pub many_failures: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            baseline: Duration::from_secs(15),
            one_failure: Duration::from_secs(30),
            many_failures: Duration::from_secs(90),
        }
    }
}

impl PollIntervals {
    pub fn from_secs(baseline: u64, one_failure: u64, many_failures: u64) -> Self {
        Self {
            baseline: Duration::from_secs(baseline),
            one_failure: Duration::from_secs(one_failure),
            many_failures: Duration::from_secs(many_failures),
        }
    }
}

/// Drives the sync cycle: fetch → dedup by content hash → emit change events
/// under a bounded pool. Failures never escape a cycle; they only steer the
/// backoff interval.
pub struct PollingScheduler {
    fetcher: Arc<dyn UpdateFetcher>,
    callback: Arc<dyn ChangeCallback>,
    intervals: PollIntervals,
    callback_limit: usize,
    last_hashes: HashMap<(WorkId, Option<String>), String>,
    failure_count: u32,
}

impl PollingScheduler {
    pub fn new(fetcher: Arc<dyn UpdateFetcher>, callback: Arc<dyn ChangeCallback>) -> Self {
        Self {
            fetcher,
            callback,
            intervals: PollIntervals::default(),
            callback_limit: DEFAULT_CALLBACK_LIMIT,
            last_hashes: HashMap::new(),
            failure_count: 0,
        }
    }

    pub fn with_intervals(mut self, intervals: PollIntervals) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn with_callback_limit(mut self, limit: usize) -> Self {
        self.callback_limit = limit.max(1);
        self
    }

    /// The sleep the loop will use before the next cycle, given recent
    /// failure history.
    pub fn current_interval(&self) -> Duration {
        match self.failure_count {
            0 => self.intervals.baseline,
            1 => self.intervals.one_failure,
            _ => self.intervals.many_failures,
        }
    }

    /// Run a single cycle. A fetch failure skips the cycle entirely; no
    /// partial processing occurs.
    pub async fn run_once(&mut self) {
        let updates = match self.fetcher.fetch_updates().await {
            Ok(updates) => updates,
            Err(err) => {
                self.failure_count = (self.failure_count + 1).min(FAILURE_COUNT_CAP);
                tracing::warn!(
                    error = %err,
                    consecutive_failures = self.failure_count,
                    "update fetch failed; backing off"
                );
                return;
            }
        };
        self.failure_count = 0;

        let limiter = Arc::new(Semaphore::new(self.callback_limit));
        let mut deliveries = JoinSet::new();

        for update in updates {
            let city_norm = update
                .city_norm
                .as_deref()
                .map(normalize_city)
                .filter(|city| !city.is_empty());
            let hash = update
                .payload_hash
                .clone()
                .filter(|hash| !hash.is_empty())
                .unwrap_or_else(|| payload_hash(&update.snapshot));

            let key = (update.work_id, city_norm.clone());
            if self.last_hashes.get(&key).is_some_and(|last| *last == hash) {
                continue;
            }
            self.last_hashes.insert(key, hash.clone());

            let event = ChangeEvent {
                work_id: update.work_id,
                city_norm,
                payload: update.snapshot,
                payload_hash: hash,
            };
            let callback = self.callback.clone();
            let limiter = limiter.clone();

            // Spawn order is fetch order; the semaphore hands out permits in
            // that same order, so deliveries start in fetch order too.
            deliveries.spawn(async move {
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if let Err(err) = callback.on_change(event).await {
                    tracing::warn!(error = %err, "change callback failed");
                }
            });
        }

        while deliveries.join_next().await.is_some() {}
    }

    /// Spawn the polling loop. Stop it through the returned handle; dropping
    /// the handle unannounced also ends the loop after its in-flight cycle,
    /// but without anyone waiting for the exit.
    pub fn start(mut self) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                self.run_once().await;
                let interval = self.current_interval();
                tokio::select! {
                    _ = sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        SchedulerHandle {
            stop: stop_tx,
            task,
        }
    }
}

pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it to exit. The in-flight cycle
    /// always completes; only the inter-cycle sleep is interrupted.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
