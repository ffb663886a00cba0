use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

use crate::cache::ResultCache;
use crate::config::AppConfig;
use crate::errors::GeocodeError;
use crate::providers::{GeocodeProvider, ProviderName};
use crate::query::{BoundingBox, Coordinates, GeocodeQuery};
use crate::throttle::{AdmissionGate, CancelSignal, PacingGate, ProviderGate};

#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    pub bounds: BoundingBox,
    /// Attempts per provider when it reports a transient service error.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub call_timeout: Duration,
}

impl ChainSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bounds: config.bounds,
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            call_timeout: config.request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// Primary, then secondary when configured.
    Full,
    /// Secondary only; used to re-process known-hard queries.
    SecondaryOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Cache,
    Provider,
    Exhausted,
    InvalidQuery,
    Unavailable,
    Cancelled,
    Aborted,
}

/// Outcome of resolving one query, with enough detail for batch accounting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub coords: Option<Coordinates>,
    pub provider: Option<ProviderName>,
    pub source: ResolutionSource,
}

impl Resolution {
    pub fn failed(source: ResolutionSource) -> Self {
        Self {
            coords: None,
            provider: None,
            source,
        }
    }

    fn found(coords: Coordinates, provider: Option<ProviderName>, source: ResolutionSource) -> Self {
        Self {
            coords: Some(coords),
            provider,
            source,
        }
    }
}

struct Backend {
    provider: Arc<dyn GeocodeProvider>,
    gate: ProviderGate,
}

enum Attempt {
    Found(Coordinates),
    /// The provider answered, with nothing usable.
    Missed,
    /// The provider never gave an answer (timeout, service or unexpected error).
    Errored,
    Cancelled,
}

/// Ordered fallback over the configured providers, fronted by the cache.
pub struct ProviderChain {
    primary: Backend,
    secondary: Option<Backend>,
    cache: Arc<ResultCache>,
    settings: ChainSettings,
    jitter_rng: Mutex<StdRng>,
}

impl ProviderChain {
    pub fn new(
        primary: Arc<dyn GeocodeProvider>,
        pacing: Arc<PacingGate>,
        secondary: Option<(Arc<dyn GeocodeProvider>, Arc<AdmissionGate>)>,
        cache: Arc<ResultCache>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            primary: Backend {
                provider: primary,
                gate: ProviderGate::Paced(pacing),
            },
            secondary: secondary.map(|(provider, admission)| Backend {
                provider,
                gate: ProviderGate::Admission(admission),
            }),
            cache,
            settings,
            jitter_rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub async fn resolve(&self, query: &GeocodeQuery) -> Option<Coordinates> {
        self.resolve_detailed(query, ChainMode::Full, None)
            .await
            .coords
    }

    pub async fn resolve_detailed(
        &self,
        query: &GeocodeQuery,
        mode: ChainMode,
        cancel: Option<&CancelSignal>,
    ) -> Resolution {
        if let Err(err) = query.validate() {
            debug!(%err, address = query.raw_address(), city = query.city(), "skipping query");
            return Resolution::failed(ResolutionSource::InvalidQuery);
        }

        let mut mode = mode;
        if let Some(entry) = self.cache.get(query.key()) {
            match entry.coords {
                Some(coords) if self.settings.bounds.contains(&coords) => {
                    return Resolution::found(coords, entry.provider, ResolutionSource::Cache);
                }
                Some(coords) => {
                    warn!(query = %query, %coords, "cached coordinates outside the bounding box; resolving again");
                }
                None if entry.is_conclusive_failure() => {
                    return Resolution::failed(ResolutionSource::Cache);
                }
                None if entry.primary_answered() => {
                    if !self.has_secondary() {
                        return Resolution::failed(ResolutionSource::Cache);
                    }
                    debug!(query = %query, "cached failure never reached the secondary provider");
                    mode = ChainMode::SecondaryOnly;
                }
                None => {
                    debug!(query = %query, "cached failure has no provider answer; resolving again");
                }
            }
        }

        let backends = match self.backends(mode) {
            Ok(backends) => backends,
            Err(err) => {
                debug!(%err, query = %query, "nothing to try");
                return Resolution::failed(ResolutionSource::Unavailable);
            }
        };

        let mut answered = Vec::new();
        let full = query.full();
        for backend in &backends {
            let provider = backend.provider.name();
            match self.attempt(backend, &full.text, cancel).await {
                Attempt::Found(coords) => {
                    self.cache.put(&full.key, Some(coords), Some(provider));
                    return Resolution::found(coords, Some(provider), ResolutionSource::Provider);
                }
                Attempt::Missed => answered.push(provider),
                Attempt::Errored => {}
                Attempt::Cancelled => return Resolution::failed(ResolutionSource::Cancelled),
            }
        }

        if let Some(simple) = query.simplified() {
            let cached = self.cache.get(&simple.key).and_then(|hit| {
                let coords = hit
                    .coords
                    .filter(|coords| self.settings.bounds.contains(coords))?;
                Some((coords, hit.provider))
            });
            if let Some((coords, provider)) = cached {
                debug!(query = %query, simplified = %simple.text, "simplified query already cached");
                self.cache.put(&full.key, Some(coords), provider);
                return Resolution::found(coords, provider, ResolutionSource::Cache);
            }

            for backend in &backends {
                let provider = backend.provider.name();
                match self.attempt(backend, &simple.text, cancel).await {
                    Attempt::Found(coords) => {
                        debug!(query = %query, simplified = %simple.text, %provider, "resolved via simplified query");
                        self.cache.put(&full.key, Some(coords), Some(provider));
                        self.cache.put(&simple.key, Some(coords), Some(provider));
                        return Resolution::found(coords, Some(provider), ResolutionSource::Provider);
                    }
                    Attempt::Missed if !answered.contains(&provider) => answered.push(provider),
                    Attempt::Missed | Attempt::Errored => {}
                    Attempt::Cancelled => return Resolution::failed(ResolutionSource::Cancelled),
                }
            }
        }

        debug!(query = %query, ?answered, "all providers exhausted");
        self.cache.record_failure(&full.key, &answered);
        Resolution::failed(ResolutionSource::Exhausted)
    }

    fn backends(&self, mode: ChainMode) -> Result<Vec<&Backend>, GeocodeError> {
        match (mode, &self.secondary) {
            (ChainMode::Full, Some(secondary)) => Ok(vec![&self.primary, secondary]),
            (ChainMode::Full, None) => Ok(vec![&self.primary]),
            (ChainMode::SecondaryOnly, Some(secondary)) => Ok(vec![secondary]),
            (ChainMode::SecondaryOnly, None) => Err(GeocodeError::ProviderUnavailable),
        }
    }

    async fn attempt(&self, backend: &Backend, text: &str, cancel: Option<&CancelSignal>) -> Attempt {
        let provider = backend.provider.name();
        let mut attempt = 0;
        loop {
            attempt += 1;
            if is_cancelled(cancel) {
                return Attempt::Cancelled;
            }
            let Some(pass) = backend.gate.enter(cancel).await else {
                return Attempt::Cancelled;
            };
            let outcome = match timeout(self.settings.call_timeout, backend.provider.geocode(text)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(GeocodeError::ProviderTimeout { provider }),
            };
            drop(pass);

            match outcome.and_then(|found| self.validate(provider, found)) {
                Ok(Some(coords)) => return Attempt::Found(coords),
                Ok(None) => {
                    debug!(%provider, query = text, "no result");
                    return Attempt::Missed;
                }
                Err(err @ GeocodeError::ValidationFailure { .. }) => {
                    warn!(%err, query = text, "discarding implausible result");
                    return Attempt::Missed;
                }
                Err(err) if err.is_retryable() && attempt < self.settings.max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(%err, attempt, query = text, "geocoding failed; retrying after {:?}", delay);
                    if !sleep_unless_cancelled(delay, cancel).await {
                        return Attempt::Cancelled;
                    }
                }
                Err(err @ GeocodeError::Unexpected { .. }) => {
                    error!(%err, query = text, "provider attempt aborted");
                    return Attempt::Errored;
                }
                Err(err) => {
                    warn!(%err, query = text, "provider gave no answer");
                    return Attempt::Errored;
                }
            }
        }
    }

    fn validate(
        &self,
        provider: ProviderName,
        found: Option<Coordinates>,
    ) -> Result<Option<Coordinates>, GeocodeError> {
        match found {
            Some(coords) if !self.settings.bounds.contains(&coords) => {
                Err(GeocodeError::ValidationFailure { provider, coords })
            }
            other => Ok(other),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.settings.backoff_base.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(6);
        let base = Duration::from_millis(base_ms * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..=base_ms))
        };
        base + jitter
    }
}

fn is_cancelled(cancel: Option<&CancelSignal>) -> bool {
    cancel.is_some_and(CancelSignal::is_cancelled)
}

/// Returns `false` if cancelled before `delay` elapsed.
async fn sleep_unless_cancelled(delay: Duration, cancel: Option<&CancelSignal>) -> bool {
    match cancel {
        Some(signal) => tokio::select! {
            _ = sleep(delay) => true,
            _ = signal.cancelled() => false,
        },
        None => {
            sleep(delay).await;
            true
        }
    }
}
