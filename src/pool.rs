use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::chain::{ChainMode, ProviderChain, Resolution, ResolutionSource};
use crate::providers::ProviderName;
use crate::query::{Coordinates, GeocodeQuery};
use crate::throttle::CancelSignal;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolProgress {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
}

pub type ProgressObserver = Arc<dyn Fn(PoolProgress) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub invalid: usize,
    pub cache_hits: usize,
    pub by_provider: BTreeMap<ProviderName, usize>,
    pub elapsed_ms: u64,
}

impl BatchSummary {
    fn record(&mut self, resolution: &Resolution) {
        self.total += 1;
        if resolution.source == ResolutionSource::Cache {
            self.cache_hits += 1;
        }
        if resolution.coords.is_some() {
            self.succeeded += 1;
            if let Some(provider) = resolution.provider {
                *self.by_provider.entry(provider).or_default() += 1;
            }
            return;
        }
        match resolution.source {
            ResolutionSource::Cancelled => self.cancelled += 1,
            ResolutionSource::InvalidQuery => {
                self.invalid += 1;
                self.failed += 1;
            }
            _ => self.failed += 1,
        }
    }
}

/// One pool invocation's results, keyed by normalized query.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: HashMap<GeocodeQuery, Option<Coordinates>>,
    pub summary: BatchSummary,
}

/// Runs a batch of independent resolutions on a fixed set of workers.
///
/// Provider pacing and admission live in the chain, so every worker shares
/// the same gates no matter how many are spawned.
pub struct ThrottlePool {
    chain: Arc<ProviderChain>,
    workers: usize,
}

impl ThrottlePool {
    pub fn new(chain: Arc<ProviderChain>, workers: usize) -> Self {
        Self {
            chain,
            workers: workers.max(1),
        }
    }

    pub fn chain(&self) -> &Arc<ProviderChain> {
        &self.chain
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run(
        &self,
        queries: impl IntoIterator<Item = GeocodeQuery>,
        observer: Option<ProgressObserver>,
        cancel: Option<Arc<CancelSignal>>,
    ) -> BatchReport {
        self.run_with_mode(queries, ChainMode::Full, observer, cancel)
            .await
    }

    /// Same batch shape, restricted to the secondary provider.
    pub async fn run_secondary_only(
        &self,
        queries: impl IntoIterator<Item = GeocodeQuery>,
        observer: Option<ProgressObserver>,
        cancel: Option<Arc<CancelSignal>>,
    ) -> BatchReport {
        self.run_with_mode(queries, ChainMode::SecondaryOnly, observer, cancel)
            .await
    }

    async fn run_with_mode(
        &self,
        queries: impl IntoIterator<Item = GeocodeQuery>,
        mode: ChainMode,
        observer: Option<ProgressObserver>,
        cancel: Option<Arc<CancelSignal>>,
    ) -> BatchReport {
        let started = Instant::now();
        let mut seen = HashSet::new();
        let unique: Vec<GeocodeQuery> = queries
            .into_iter()
            .filter(|query| seen.insert(query.key().to_string()))
            .collect();
        let total = unique.len();
        if total == 0 {
            return BatchReport::default();
        }

        let worker_count = self.workers.min(total);
        info!(total, workers = worker_count, ?mode, "starting geocoding batch");

        let shared = Arc::new(BatchState {
            chain: self.chain.clone(),
            mode,
            queue: Mutex::new(unique.iter().cloned().collect()),
            resolutions: Mutex::new(HashMap::with_capacity(total)),
            total,
            completed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            observer,
            cancel,
        });

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let state = shared.clone();
            handles.push(tokio::spawn(async move { state.work().await }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(?err, "geocoding worker terminated unexpectedly");
            }
        }

        let mut resolutions = std::mem::take(&mut *shared.resolutions.lock());
        let mut report = BatchReport::default();
        for query in unique {
            let resolution = resolutions
                .remove(&query)
                .unwrap_or_else(|| Resolution::failed(ResolutionSource::Aborted));
            report.summary.record(&resolution);
            report.results.insert(query, resolution.coords);
        }
        report.summary.elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            total = report.summary.total,
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            cancelled = report.summary.cancelled,
            cache_hits = report.summary.cache_hits,
            elapsed_ms = report.summary.elapsed_ms,
            "geocoding batch finished"
        );
        report
    }
}

struct BatchState {
    chain: Arc<ProviderChain>,
    mode: ChainMode,
    queue: Mutex<VecDeque<GeocodeQuery>>,
    resolutions: Mutex<HashMap<GeocodeQuery, Resolution>>,
    total: usize,
    completed: AtomicUsize,
    succeeded: AtomicUsize,
    observer: Option<ProgressObserver>,
    cancel: Option<Arc<CancelSignal>>,
}

impl BatchState {
    async fn work(&self) {
        loop {
            let next = self.queue.lock().pop_front();
            let Some(query) = next else {
                break;
            };

            let resolution = AssertUnwindSafe(self.chain.resolve_detailed(
                &query,
                self.mode,
                self.cancel.as_deref(),
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(query = %query, "geocoding task panicked; recording failure");
                Resolution::failed(ResolutionSource::Aborted)
            });

            if resolution.coords.is_some() {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            self.resolutions.lock().insert(query, resolution);
            let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
            self.report_progress(completed);
        }
    }

    fn report_progress(&self, completed: usize) {
        let progress = PoolProgress {
            total: self.total,
            completed,
            succeeded: self.succeeded.load(Ordering::SeqCst),
        };
        let tenth = (self.total / 10).max(1);
        if completed % 10 == 0 || completed % tenth == 0 || completed == self.total {
            info!(
                completed,
                total = self.total,
                succeeded = progress.succeeded,
                "geocoding progress"
            );
        }
        if let Some(callback) = &self.observer {
            callback(progress);
        }
    }
}
