use std::io;

use thiserror::Error;

use crate::providers::ProviderName;
use crate::query::Coordinates;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
}

/// Failure of a single geocoding attempt. Never escapes a query's resolution.
#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("{provider} timed out")]
    ProviderTimeout { provider: ProviderName },
    #[error("{provider} service error: {message}")]
    ProviderService {
        provider: ProviderName,
        message: String,
    },
    #[error("secondary provider is not configured")]
    ProviderUnavailable,
    #[error("{provider} returned coordinates outside the bounding box: {coords}")]
    ValidationFailure {
        provider: ProviderName,
        coords: Coordinates,
    },
    #[error("cache i/o failed: {0}")]
    CacheIo(String),
    #[error("address or city is empty")]
    InvalidQuery,
    #[error("{provider} failed unexpectedly: {message}")]
    Unexpected {
        provider: ProviderName,
        message: String,
    },
}

impl GeocodeError {
    pub fn service(provider: ProviderName, message: impl Into<String>) -> Self {
        Self::ProviderService {
            provider,
            message: message.into(),
        }
    }

    pub fn unexpected(provider: ProviderName, message: impl Into<String>) -> Self {
        Self::Unexpected {
            provider,
            message: message.into(),
        }
    }

    /// Classifies a transport error raised while talking to `provider`.
    pub fn from_http(provider: ProviderName, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::ProviderTimeout { provider };
        }
        if err.is_connect() || err.is_request() {
            return Self::service(provider, err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() || status.as_u16() == 429 => {
                Self::service(provider, format!("http status {status}"))
            }
            _ => Self::unexpected(provider, err.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderService { .. })
    }
}
