use std::path::PathBuf;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::json;
use tempfile::tempdir;

use carnamapa_geocoder::{AppConfig, BoundingBox, Coordinates, GeocodePipeline, ProviderName};

const SE_QUERY: &str = "Praça da Sé, São Paulo, Brazil";
const RECIFE_QUERY: &str = "Rua Inexistente, 999, Recife, Brazil";

fn config(cache_file: PathBuf, nominatim: &Server, google: &Server, google_enabled: bool) -> AppConfig {
    AppConfig {
        cache_file,
        nominatim_base_url: nominatim.url_str(""),
        nominatim_user_agent: "CarnaMapa-test/1.0".to_string(),
        primary_interval_ms: 10,
        primary_concurrency: 1,
        google_maps_api_key: Some(SecretString::from("test-key".to_string())),
        google_geocoding_url: google.url_str("/maps/api/geocode/json"),
        google_enabled,
        secondary_concurrency: 2,
        request_timeout_secs: 5,
        max_attempts: 2,
        backoff_base_ms: 5,
        country: "Brazil".to_string(),
        country_code: "br".to_string(),
        bounds: BoundingBox::BRAZIL,
    }
}

fn expect_nominatim(server: &Server, query: &'static str, body: serde_json::Value) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", query)))),
        ])
        .times(1)
        .respond_with(json_encoded(body)),
    );
}

fn expect_google(server: &Server, address: &'static str, body: serde_json::Value) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/maps/api/geocode/json"),
            request::query(url_decoded(contains(("address", address)))),
        ])
        .times(1)
        .respond_with(json_encoded(body)),
    );
}

fn pairs() -> Vec<(String, String)> {
    vec![
        (
            "Praça da Sé (próximo ao metrô), 01001-000".to_string(),
            "São Paulo".to_string(),
        ),
        ("Rua Inexistente, 999".to_string(), "Recife".to_string()),
        ("".to_string(), "Olinda".to_string()),
    ]
}

#[tokio::test]
async fn geocodes_with_fallback_and_serves_repeat_runs_from_cache() {
    let nominatim = Server::run();
    let google = Server::run();
    expect_nominatim(
        &nominatim,
        SE_QUERY,
        json!([{ "lat": "-23.5503", "lon": "-46.6339" }]),
    );
    expect_nominatim(&nominatim, RECIFE_QUERY, json!([]));
    expect_google(
        &google,
        RECIFE_QUERY,
        json!({
            "status": "OK",
            "results": [{ "geometry": { "location": { "lat": -8.0476, "lng": -34.877 } } }]
        }),
    );

    let dir = tempdir().unwrap();
    let cache_file = dir.path().join("cache").join("geocoding_cache.json");
    let config = config(cache_file.clone(), &nominatim, &google, true);

    let pipeline = GeocodePipeline::from_config(&config).unwrap();
    let output = pipeline.geocode(pairs(), None, None).await;

    assert_eq!(output.coordinates.len(), 3);
    assert_eq!(
        output.get("Praça da Sé (próximo ao metrô), 01001-000", "São Paulo"),
        Some(Coordinates::new(-46.6339, -23.5503))
    );
    assert_eq!(
        output.get("Rua Inexistente, 999", "Recife"),
        Some(Coordinates::new(-34.877, -8.0476))
    );
    assert_eq!(output.get("", "Olinda"), None);
    assert_eq!(output.summary.succeeded, 2);
    assert_eq!(output.summary.by_provider.get(&ProviderName::Secondary), Some(&1));

    let stored: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&cache_file).unwrap()).unwrap();
    let recife = &stored[RECIFE_QUERY.to_lowercase()];
    assert_eq!(recife["provider"], "secondary");
    assert_eq!(recife["coords"], json!([-34.877, -8.0476]));
    assert!(recife["timestamp"].is_string());

    // A fresh pipeline over the same file answers without any provider call.
    let again = GeocodePipeline::from_config(&config).unwrap();
    let output = again.geocode(pairs(), None, None).await;
    assert_eq!(output.summary.cache_hits, 2);
    assert_eq!(output.summary.succeeded, 2);
    assert_eq!(again.cache_stats().total, 2);
}

#[tokio::test]
async fn retry_failed_pays_only_for_known_failures() {
    let nominatim = Server::run();
    let google = Server::run();
    expect_nominatim(
        &nominatim,
        SE_QUERY,
        json!([{ "lat": "-23.5503", "lon": "-46.6339" }]),
    );
    expect_nominatim(&nominatim, RECIFE_QUERY, json!([]));
    expect_nominatim(&nominatim, "Rua Inexistente, Recife, Brazil", json!([]));

    let dir = tempdir().unwrap();
    let cache_file = dir.path().join("geocoding_cache.json");

    let primary_only = GeocodePipeline::from_config(&config(cache_file.clone(), &nominatim, &google, false))
        .unwrap();
    let first = primary_only.geocode(pairs(), None, None).await;
    assert_eq!(first.get("Rua Inexistente, 999", "Recife"), None);
    assert_eq!(first.summary.failed, 2);

    expect_google(
        &google,
        RECIFE_QUERY,
        json!({
            "status": "OK",
            "results": [{ "geometry": { "location": { "lat": -8.0476, "lng": -34.877 } } }]
        }),
    );
    let with_secondary =
        GeocodePipeline::from_config(&config(cache_file, &nominatim, &google, true)).unwrap();
    let retried = with_secondary.retry_failed(pairs(), None, None).await;

    assert_eq!(
        retried.get("Rua Inexistente, 999", "Recife"),
        Some(Coordinates::new(-34.877, -8.0476))
    );
    assert_eq!(
        retried.get("Praça da Sé (próximo ao metrô), 01001-000", "São Paulo"),
        Some(Coordinates::new(-46.6339, -23.5503))
    );
    assert_eq!(retried.summary.by_provider.get(&ProviderName::Secondary), Some(&1));
}
