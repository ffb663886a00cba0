use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::{debug, warn};

use crate::query::BoundingBox;

/// Nominatim's usage policy allows at most one request per second.
pub const MIN_PRIMARY_INTERVAL_MS: u64 = 1_000;

const DEFAULT_CACHE_FILE: &str = "cache/geocoding_cache.json";
const DEFAULT_NOMINATIM_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_GOOGLE_GEOCODING_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub cache_file: PathBuf,
    pub nominatim_base_url: String,
    pub nominatim_user_agent: String,
    pub primary_interval_ms: u64,
    pub primary_concurrency: usize,
    pub google_maps_api_key: Option<SecretString>,
    pub google_geocoding_url: String,
    pub google_enabled: bool,
    pub secondary_concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub country: String,
    pub country_code: String,
    pub bounds: BoundingBox,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub cache_file: String,
    pub nominatim_base_url: String,
    pub primary_interval_ms: u64,
    pub primary_concurrency: usize,
    pub secondary_enabled: bool,
    pub secondary_concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub country: String,
    pub bounds: BoundingBox,
    pub has_google_maps_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            cache_file: env::var("GEOCODING_CACHE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CACHE_FILE)),
            nominatim_base_url: env::var("NOMINATIM_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_BASE_URL.to_string()),
            nominatim_user_agent: env::var("NOMINATIM_USER_AGENT")
                .unwrap_or_else(|_| "CarnaMapa/1.0".to_string()),
            primary_interval_ms: parse_num::<u64>("NOMINATIM_INTERVAL_MS", MIN_PRIMARY_INTERVAL_MS)
                .max(MIN_PRIMARY_INTERVAL_MS),
            primary_concurrency: parse_num::<usize>("GEOCODING_NOMINATIM_CONCURRENCY", 1).max(1),
            google_maps_api_key: env::var("GOOGLE_MAPS_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            google_geocoding_url: env::var("GOOGLE_GEOCODING_URL")
                .unwrap_or_else(|_| DEFAULT_GOOGLE_GEOCODING_URL.to_string()),
            google_enabled: parse_bool("GEOCODING_GOOGLE_ENABLED", true),
            secondary_concurrency: parse_num::<usize>("GEOCODING_GOOGLE_CONCURRENCY", 10).max(1),
            request_timeout_secs: parse_num::<u64>("GEOCODING_REQUEST_TIMEOUT_SECS", 10).max(1),
            max_attempts: parse_num::<u32>("GEOCODING_MAX_ATTEMPTS", 3).max(1),
            backoff_base_ms: parse_num::<u64>("GEOCODING_BACKOFF_BASE_MS", 500),
            country: env::var("GEOCODING_COUNTRY").unwrap_or_else(|_| "Brazil".to_string()),
            country_code: env::var("GEOCODING_COUNTRY_CODE").unwrap_or_else(|_| "br".to_string()),
            bounds: parse_bounds("GEOCODING_BOUNDS"),
        }
    }

    /// Secondary calls happen only when enabled and a key is present.
    pub fn secondary_enabled(&self) -> bool {
        self.google_enabled && self.google_maps_api_key.is_some()
    }

    pub fn primary_interval(&self) -> Duration {
        Duration::from_millis(self.primary_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Worker count: the larger of the two provider concurrency limits.
    pub fn worker_count(&self) -> usize {
        self.primary_concurrency.max(self.secondary_concurrency).max(1)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            cache_file: self.cache_file.to_string_lossy().to_string(),
            nominatim_base_url: self.nominatim_base_url.clone(),
            primary_interval_ms: self.primary_interval_ms,
            primary_concurrency: self.primary_concurrency,
            secondary_enabled: self.secondary_enabled(),
            secondary_concurrency: self.secondary_concurrency,
            request_timeout_secs: self.request_timeout_secs,
            max_attempts: self.max_attempts,
            country: self.country.clone(),
            bounds: self.bounds,
            has_google_maps_key: self.google_maps_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    let Ok(value) = env::var(key) else {
        return default;
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(key, value = %value, "unrecognized boolean; using the default");
            default
        }
    }
}

fn parse_num<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %value, "invalid number; using the default");
            default
        }),
        Err(_) => default,
    }
}

fn parse_bounds(key: &str) -> BoundingBox {
    match env::var(key) {
        Ok(value) => BoundingBox::parse(&value).unwrap_or_else(|| {
            warn!(value = %value, "invalid bounding box; using the default");
            BoundingBox::default()
        }),
        Err(_) => BoundingBox::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_public_profile_without_secrets() {
        env::set_var("GOOGLE_MAPS_API_KEY", "secret");
        env::set_var("GEOCODING_GOOGLE_CONCURRENCY", "4");
        env::set_var("NOMINATIM_INTERVAL_MS", "250");
        env::set_var("GEOCODING_BOUNDS", "-50,-30,-40,-20");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert!(public.has_google_maps_key);
        assert!(public.secondary_enabled);
        assert_eq!(public.secondary_concurrency, 4);
        assert_eq!(config.worker_count(), 4);
        assert_eq!(public.primary_interval_ms, MIN_PRIMARY_INTERVAL_MS);
        assert_eq!(public.bounds.min_lon, -50.0);
        let serialized = serde_json::to_string(&public).unwrap();
        assert!(!serialized.contains("secret"));
    }

    #[test]
    fn booleans_accept_common_spellings_and_fall_back_on_garbage() {
        env::set_var("CARNAMAPA_TEST_FLAG_OFF", "false");
        env::set_var("CARNAMAPA_TEST_FLAG_ZERO", "0");
        env::set_var("CARNAMAPA_TEST_FLAG_YES", " Yes ");
        env::set_var("CARNAMAPA_TEST_FLAG_GARBAGE", "maybe");

        assert!(!parse_bool("CARNAMAPA_TEST_FLAG_OFF", true));
        assert!(!parse_bool("CARNAMAPA_TEST_FLAG_ZERO", true));
        assert!(parse_bool("CARNAMAPA_TEST_FLAG_YES", false));
        assert!(parse_bool("CARNAMAPA_TEST_FLAG_GARBAGE", true));
        assert!(!parse_bool("CARNAMAPA_TEST_FLAG_GARBAGE", false));
        assert!(parse_bool("CARNAMAPA_TEST_FLAG_UNSET", true));
    }

    #[test]
    fn numbers_fall_back_to_the_default_when_unparseable() {
        env::set_var("CARNAMAPA_TEST_ATTEMPTS", " 5 ");
        env::set_var("CARNAMAPA_TEST_TIMEOUT", "ten");

        assert_eq!(parse_num::<u32>("CARNAMAPA_TEST_ATTEMPTS", 3), 5);
        assert_eq!(parse_num::<u64>("CARNAMAPA_TEST_TIMEOUT", 10), 10);
        assert_eq!(parse_num::<usize>("CARNAMAPA_TEST_UNSET_NUMBER", 7), 7);
    }
}
