use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{trace, warn};

use crate::errors::{AppError, AppResult, GeocodeError};
use crate::providers::{GeocodeProvider, ProviderName};
use crate::query::Coordinates;

/// Google Maps Geocoding API.
pub struct GoogleGeocoder {
    http: Client,
    endpoint: Url,
    api_key: SecretString,
    region: String,
}

#[derive(Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Deserialize)]
struct Geometry {
    location: Location,
}

#[derive(Deserialize)]
struct Location {
    lat: f64,
    lng: f64,
}

impl GoogleGeocoder {
    pub fn new(
        endpoint: &str,
        api_key: SecretString,
        region: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("carnamapa-geocoder/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        let endpoint = Url::parse(endpoint)
            .map_err(|err| AppError::Config(format!("invalid Google geocoding url: {err}")))?;
        Ok(Self {
            http,
            endpoint,
            api_key,
            region: region.trim().to_ascii_lowercase(),
        })
    }
}

#[async_trait]
impl GeocodeProvider for GoogleGeocoder {
    fn name(&self) -> ProviderName {
        ProviderName::Secondary
    }

    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let provider = self.name();
        let mut url = self.endpoint.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("address", query)
                .append_pair("key", self.api_key.expose_secret());
            if !self.region.is_empty() {
                pairs.append_pair("region", &self.region);
            }
        }

        // The request url carries the API key; keep it out of error messages.
        let response: GeocodeResponse = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| GeocodeError::from_http(provider, err.without_url()))?
            .json()
            .await
            .map_err(|err| GeocodeError::from_http(provider, err.without_url()))?;

        let detail = response.error_message.unwrap_or_default();
        match response.status.as_str() {
            "OK" => {
                let location = response
                    .results
                    .into_iter()
                    .next()
                    .map(|result| result.geometry.location);
                if location.is_none() {
                    warn!(query, "google answered OK without results");
                }
                Ok(location.map(|loc| Coordinates::new(loc.lng, loc.lat)))
            }
            "ZERO_RESULTS" => {
                trace!(query, "google returned zero results");
                Ok(None)
            }
            "OVER_QUERY_LIMIT" | "UNKNOWN_ERROR" => Err(GeocodeError::service(
                provider,
                format!("{}: {detail}", response.status),
            )),
            other => Err(GeocodeError::unexpected(
                provider,
                format!("{other}: {detail}"),
            )),
        }
    }
}
