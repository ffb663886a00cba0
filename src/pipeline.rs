use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{CacheStats, ResultCache};
use crate::chain::{ChainSettings, ProviderChain};
use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::pool::{BatchReport, BatchSummary, ProgressObserver, ThrottlePool};
use crate::providers::{primary_provider, secondary_provider};
use crate::throttle::CancelSignal;
use crate::query::{Coordinates, GeocodeQuery};
use crate::throttle::{AdmissionGate, PacingGate};

/// Result handed to the output writer: one entry per submitted pair.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub coordinates: HashMap<(String, String), Option<Coordinates>>,
    pub summary: BatchSummary,
}

impl PipelineOutput {
    pub fn get(&self, address: &str, city: &str) -> Option<Coordinates> {
        self.coordinates
            .get(&(address.to_string(), city.to_string()))
            .copied()
            .flatten()
    }
}

/// Entry point used by the crawler: `(address, city)` pairs in, coordinates out.
pub struct GeocodePipeline {
    pool: ThrottlePool,
    country: String,
}

impl GeocodePipeline {
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let cache = Arc::new(ResultCache::open(&config.cache_file));
        let primary = primary_provider(config)?;
        let pacing = Arc::new(PacingGate::new(config.primary_interval()));
        let secondary = secondary_provider(config)?.map(|provider| {
            (
                provider,
                Arc::new(AdmissionGate::new(config.secondary_concurrency)),
            )
        });
        let chain = ProviderChain::new(
            primary,
            pacing,
            secondary,
            cache,
            ChainSettings::from_config(config),
        );
        let pool = ThrottlePool::new(Arc::new(chain), config.worker_count());
        Ok(Self::new(pool, &config.country))
    }

    pub fn new(pool: ThrottlePool, country: &str) -> Self {
        Self {
            pool,
            country: country.to_string(),
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        self.pool.chain().cache()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }

    pub async fn geocode(
        &self,
        pairs: Vec<(String, String)>,
        observer: Option<ProgressObserver>,
        cancel: Option<Arc<CancelSignal>>,
    ) -> PipelineOutput {
        let submitted = self.queries(pairs);
        let report = self
            .pool
            .run(
                submitted.iter().map(|(_, query)| query.clone()),
                observer,
                cancel,
            )
            .await;
        fan_out(submitted, report)
    }

    /// Re-processes previously failed pairs with the secondary provider only.
    pub async fn retry_failed(
        &self,
        pairs: Vec<(String, String)>,
        observer: Option<ProgressObserver>,
        cancel: Option<Arc<CancelSignal>>,
    ) -> PipelineOutput {
        let submitted = self.queries(pairs);
        if !self.pool.chain().has_secondary() {
            warn!("retry-failed requested without a secondary provider; returning cached results");
            return self.from_cache(submitted);
        }
        let report = self
            .pool
            .run_secondary_only(
                submitted.iter().map(|(_, query)| query.clone()),
                observer,
                cancel,
            )
            .await;
        fan_out(submitted, report)
    }

    fn queries(&self, pairs: Vec<(String, String)>) -> Vec<((String, String), GeocodeQuery)> {
        pairs
            .into_iter()
            .map(|(address, city)| {
                let query = GeocodeQuery::new(address.as_str(), city.as_str(), &self.country);
                ((address, city), query)
            })
            .collect()
    }

    fn from_cache(&self, submitted: Vec<((String, String), GeocodeQuery)>) -> PipelineOutput {
        let mut report = BatchReport::default();
        for (_, query) in &submitted {
            if report.results.contains_key(query) {
                continue;
            }
            let entry = self.cache().get(query.key());
            let coords = entry.as_ref().and_then(|entry| entry.coords);
            report.summary.total += 1;
            if coords.is_some() {
                report.summary.succeeded += 1;
                report.summary.cache_hits += 1;
                if let Some(provider) = entry.and_then(|entry| entry.provider) {
                    *report.summary.by_provider.entry(provider).or_default() += 1;
                }
            } else {
                report.summary.failed += 1;
            }
            report.results.insert(query.clone(), coords);
        }
        fan_out(submitted, report)
    }
}

fn fan_out(submitted: Vec<((String, String), GeocodeQuery)>, report: BatchReport) -> PipelineOutput {
    let coordinates: HashMap<(String, String), Option<Coordinates>> = submitted
        .into_iter()
        .map(|(pair, query)| {
            let coords = report.results.get(&query).copied().flatten();
            (pair, coords)
        })
        .collect();

    info!(
        pairs = coordinates.len(),
        unique = report.summary.total,
        succeeded = report.summary.succeeded,
        failed = report.summary.failed,
        cancelled = report.summary.cancelled,
        by_provider = ?report.summary.by_provider,
        "geocoding run complete"
    );
    PipelineOutput {
        coordinates,
        summary: report.summary,
    }
}
