use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::AppConfig;
use crate::errors::{AppResult, GeocodeError};
use crate::google::GoogleGeocoder;
use crate::nominatim::NominatimGeocoder;
use crate::query::Coordinates;

/// Which backend produced a cached answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    #[serde(alias = "nominatim")]
    Primary,
    #[serde(alias = "google")]
    Secondary,
    /// Entries written before provenance was recorded.
    Legacy,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Primary => "primary",
            ProviderName::Secondary => "secondary",
            ProviderName::Legacy => "legacy",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A geocoding backend.
///
/// `Ok(None)` means the provider answered but found nothing; errors are
/// classified so the chain can decide whether to retry or move on.
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    fn name(&self) -> ProviderName;

    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

/// The free, strictly paced backend.
pub fn primary_provider(config: &AppConfig) -> AppResult<Arc<dyn GeocodeProvider>> {
    let provider = NominatimGeocoder::new(
        &config.nominatim_base_url,
        &config.nominatim_user_agent,
        &config.country_code,
        config.request_timeout(),
    )?;
    Ok(Arc::new(provider))
}

/// The paid backend, present only when enabled and a key is configured.
pub fn secondary_provider(config: &AppConfig) -> AppResult<Option<Arc<dyn GeocodeProvider>>> {
    let Some(api_key) = config.google_maps_api_key.clone() else {
        info!("no Google Maps API key configured; running primary-only");
        return Ok(None);
    };
    if !config.google_enabled {
        info!("Google geocoding disabled by configuration; running primary-only");
        return Ok(None);
    }
    let provider = GoogleGeocoder::new(
        &config.google_geocoding_url,
        api_key,
        &config.country_code,
        config.request_timeout(),
    )?;
    Ok(Some(Arc::new(provider)))
}

#[cfg(test)]
pub(crate) mod stub {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::query::cache_key;

    #[derive(Debug, Clone, Copy)]
    pub(crate) enum StubAnswer {
        Hit(Coordinates),
        Miss,
        Unexpected,
        Panic,
    }

    /// Zero-latency provider answering from a fixed table keyed by query text.
    pub(crate) struct StubProvider {
        name: ProviderName,
        default: StubAnswer,
        answers: HashMap<String, StubAnswer>,
        transient_failures: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    impl StubProvider {
        pub(crate) fn new(name: ProviderName, default: StubAnswer) -> Self {
            Self {
                name,
                default,
                answers: HashMap::new(),
                transient_failures: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn answer(mut self, text: &str, answer: StubAnswer) -> Self {
            self.answers.insert(cache_key(text), answer);
            self
        }

        /// Fails the first `count` calls with a retryable service error.
        pub(crate) fn failing_first(self, count: usize) -> Self {
            self.transient_failures.store(count, Ordering::SeqCst);
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl GeocodeProvider for StubProvider {
        fn name(&self) -> ProviderName {
            self.name
        }

        async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.lock().push(query.to_string());
            let transient = self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if transient {
                return Err(GeocodeError::service(self.name, "503 Service Unavailable"));
            }
            let answer = self
                .answers
                .get(&cache_key(query))
                .copied()
                .unwrap_or(self.default);
            match answer {
                StubAnswer::Hit(coords) => Ok(Some(coords)),
                StubAnswer::Miss => Ok(None),
                StubAnswer::Unexpected => {
                    Err(GeocodeError::unexpected(self.name, "malformed response"))
                }
                StubAnswer::Panic => panic!("stub provider blew up on {query}"),
            }
        }
    }
}
