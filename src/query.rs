use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::errors::GeocodeError;
use crate::normalizer::{extract_landmark, normalize, normalize_address};

/// A point in WGS84, persisted as a `[longitude, latitude]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct Coordinates {
    pub longitude: f64,
    pub latitude: f64,
}

impl Coordinates {
    pub const fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }
}

impl From<(f64, f64)> for Coordinates {
    fn from((longitude, latitude): (f64, f64)) -> Self {
        Self::new(longitude, latitude)
    }
}

impl From<Coordinates> for (f64, f64) {
    fn from(value: Coordinates) -> Self {
        (value.longitude, value.latitude)
    }
}

impl fmt::Display for Coordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.longitude, self.latitude)
    }
}

/// Geographic sanity check applied to every provider answer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub const BRAZIL: BoundingBox = BoundingBox {
        min_lon: -73.98,
        min_lat: -33.75,
        max_lon: -32.39,
        max_lat: 5.27,
    };

    /// Parses `min_lon,min_lat,max_lon,max_lat`.
    pub fn parse(value: &str) -> Option<Self> {
        let parts = value
            .split(',')
            .map(|part| part.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let [min_lon, min_lat, max_lon, max_lat] = parts.as_slice() else {
            return None;
        };
        if min_lon > max_lon || min_lat > max_lat {
            return None;
        }
        Some(Self {
            min_lon: *min_lon,
            min_lat: *min_lat,
            max_lon: *max_lon,
            max_lat: *max_lat,
        })
    }

    pub fn contains(&self, coords: &Coordinates) -> bool {
        (self.min_lon..=self.max_lon).contains(&coords.longitude)
            && (self.min_lat..=self.max_lat).contains(&coords.latitude)
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self::BRAZIL
    }
}

/// Text sent to a provider together with the cache key derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryText {
    pub text: String,
    pub key: String,
}

impl QueryText {
    fn new(text: String) -> Self {
        let key = cache_key(&text);
        Self { text, key }
    }
}

/// Lower-cased, trimmed form of a full query string.
pub fn cache_key(text: &str) -> String {
    text.trim().to_lowercase()
}

/// One `(address, city)` pair handed over by the crawler.
///
/// Two queries are equal when they normalize to the same cache key, whatever
/// their raw text.
#[derive(Debug, Clone)]
pub struct GeocodeQuery {
    raw_address: String,
    city: String,
    full: QueryText,
    simplified: Option<QueryText>,
}

impl GeocodeQuery {
    pub fn new(address: impl Into<String>, city: impl Into<String>, country: &str) -> Self {
        let raw_address = address.into();
        let city = city.into().trim().to_string();
        let full = QueryText::new(with_country(&normalize(&raw_address, &city), country));
        let simplified = simplified_text(&raw_address, &city)
            .map(|text| QueryText::new(with_country(&text, country)))
            .filter(|simple| simple.key != full.key);
        Self {
            raw_address,
            city,
            full,
            simplified,
        }
    }

    pub fn raw_address(&self) -> &str {
        &self.raw_address
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn full(&self) -> &QueryText {
        &self.full
    }

    pub fn key(&self) -> &str {
        &self.full.key
    }

    pub fn simplified(&self) -> Option<&QueryText> {
        self.simplified.as_ref()
    }

    /// Empty address or city: resolved to failure without touching a provider.
    pub fn is_invalid(&self) -> bool {
        normalize_address(&self.city).is_empty() || normalize_address(&self.raw_address).is_empty()
    }

    pub fn validate(&self) -> Result<(), GeocodeError> {
        if self.is_invalid() {
            Err(GeocodeError::InvalidQuery)
        } else {
            Ok(())
        }
    }
}

impl PartialEq for GeocodeQuery {
    fn eq(&self, other: &Self) -> bool {
        self.full.key == other.full.key
    }
}

impl Eq for GeocodeQuery {}

impl Hash for GeocodeQuery {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.full.key.hash(state);
    }
}

impl fmt::Display for GeocodeQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full.text)
    }
}

fn with_country(text: &str, country: &str) -> String {
    let country = country.trim();
    if country.is_empty() {
        text.to_string()
    } else {
        format!("{text}, {country}")
    }
}

/// Landmark + city when a landmark is present, otherwise the last
/// digit-free address segment + city.
fn simplified_text(raw_address: &str, city: &str) -> Option<String> {
    let city = normalize_address(city);
    if city.is_empty() {
        return None;
    }
    if let Some(landmark) = extract_landmark(raw_address) {
        return Some(format!("{landmark}, {city}"));
    }
    let cleaned = normalize_address(raw_address);
    cleaned
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .filter(|segment| !segment.eq_ignore_ascii_case(&city))
        .filter(|segment| !segment.chars().any(|c| c.is_ascii_digit()))
        .last()
        .map(|segment| format!("{segment}, {city}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_queries_share_a_normalized_key() {
        let a = GeocodeQuery::new("Rua Augusta, 1500 (Zona Sul)", "São Paulo", "Brazil");
        let b = GeocodeQuery::new("Rua Augusta,  1500, 01305-100", "São Paulo", "Brazil");
        assert_eq!(a, b);
        assert_eq!(a.key(), "rua augusta, 1500, são paulo, brazil");
        assert_ne!(a.raw_address(), b.raw_address());
    }

    #[test]
    fn simplified_query_prefers_landmark() {
        let query = GeocodeQuery::new("Praça da Sé, 100, Centro", "São Paulo", "Brazil");
        let simple = query.simplified().expect("landmark query");
        assert_eq!(simple.text, "Praça da Sé, São Paulo, Brazil");
    }

    #[test]
    fn simplified_query_falls_back_to_last_digit_free_segment() {
        let query = GeocodeQuery::new("Rua dos Pinheiros, 250, Pinheiros", "São Paulo", "Brazil");
        let simple = query.simplified().expect("segment query");
        assert_eq!(simple.text, "Pinheiros, São Paulo, Brazil");
    }

    #[test]
    fn decorated_city_names_are_cleaned_everywhere() {
        let query = GeocodeQuery::new("Rua dos Pinheiros, 250, Pinheiros", "São Paulo (SP)", "Brazil");
        assert_eq!(query.full().text, "Rua dos Pinheiros, 250, Pinheiros, São Paulo, Brazil");
        assert_eq!(query.simplified().unwrap().text, "Pinheiros, São Paulo, Brazil");
        assert!(query.validate().is_ok());
    }

    #[test]
    fn blank_parts_fail_validation() {
        let no_city = GeocodeQuery::new("Rua Augusta, 10", "(SP)", "Brazil");
        assert!(matches!(no_city.validate(), Err(GeocodeError::InvalidQuery)));
        let no_address = GeocodeQuery::new("  ", "Recife", "Brazil");
        assert!(no_address.is_invalid());
    }

    #[test]
    fn simplified_query_is_skipped_when_identical_to_full() {
        let query = GeocodeQuery::new("Pinheiros", "São Paulo", "Brazil");
        assert!(query.simplified().is_none());
    }

    #[test]
    fn flags_invalid_queries() {
        assert!(GeocodeQuery::new("", "Recife", "Brazil").is_invalid());
        assert!(GeocodeQuery::new("Rua da Aurora", "  ", "Brazil").is_invalid());
        assert!(GeocodeQuery::new("(sem endereço) 50030-000", "Recife", "Brazil").is_invalid());
        assert!(!GeocodeQuery::new("Rua da Aurora", "Recife", "Brazil").is_invalid());
    }

    #[test]
    fn bounding_box_rejects_outside_points() {
        let bounds = BoundingBox::BRAZIL;
        assert!(bounds.contains(&Coordinates::new(-46.63, -23.55)));
        assert!(!bounds.contains(&Coordinates::new(2.35, 48.85)));
        assert!(!bounds.contains(&Coordinates::new(f64::NAN, -23.55)));
    }

    #[test]
    fn parses_bounding_box() {
        let parsed = BoundingBox::parse("-10, -5, 10, 5").unwrap();
        assert_eq!(parsed.max_lat, 5.0);
        assert!(BoundingBox::parse("1,2,3").is_none());
        assert!(BoundingBox::parse("10,0,-10,5").is_none());
    }

    #[test]
    fn coordinates_serialize_as_pair() {
        let json = serde_json::to_string(&Coordinates::new(-46.6, -23.5)).unwrap();
        assert_eq!(json, "[-46.6,-23.5]");
    }
}
