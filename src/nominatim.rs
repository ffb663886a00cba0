use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::trace;

use crate::errors::{AppError, AppResult, GeocodeError};
use crate::providers::{GeocodeProvider, ProviderName};
use crate::query::Coordinates;

/// OpenStreetMap Nominatim search API.
pub struct NominatimGeocoder {
    http: Client,
    search_url: Url,
    country_code: String,
}

#[derive(Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(
        base_url: &str,
        user_agent: &str,
        country_code: &str,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        let search_url = Url::parse(&format!("{}/search", base_url.trim_end_matches('/')))
            .map_err(|err| AppError::Config(format!("invalid Nominatim base url: {err}")))?;
        Ok(Self {
            http,
            search_url,
            country_code: country_code.trim().to_ascii_lowercase(),
        })
    }
}

#[async_trait]
impl GeocodeProvider for NominatimGeocoder {
    fn name(&self) -> ProviderName {
        ProviderName::Primary
    }

    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let provider = self.name();
        let mut url = self.search_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", query)
                .append_pair("format", "json")
                .append_pair("limit", "1");
            if !self.country_code.is_empty() {
                pairs.append_pair("countrycodes", &self.country_code);
            }
        }

        let hits: Vec<SearchHit> = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| GeocodeError::from_http(provider, err))?
            .json()
            .await
            .map_err(|err| GeocodeError::from_http(provider, err))?;

        let Some(hit) = hits.into_iter().next() else {
            trace!(query, "nominatim returned no candidates");
            return Ok(None);
        };
        let latitude = hit
            .lat
            .parse::<f64>()
            .map_err(|err| GeocodeError::unexpected(provider, format!("invalid lat: {err}")))?;
        let longitude = hit
            .lon
            .parse::<f64>()
            .map_err(|err| GeocodeError::unexpected(provider, format!("invalid lon: {err}")))?;
        Ok(Some(Coordinates::new(longitude, latitude)))
    }
}
