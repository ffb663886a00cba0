use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult, GeocodeError};
use crate::providers::ProviderName;
use crate::query::{cache_key, Coordinates};

/// Canonical in-memory form of a cached resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub coords: Option<Coordinates>,
    pub provider: Option<ProviderName>,
    pub timestamp: Option<String>,
    /// Providers already attempted for this key.
    pub tried: Vec<ProviderName>,
}

impl CacheEntry {
    pub fn is_success(&self) -> bool {
        self.coords.is_some()
    }

    /// A failure is settled once the secondary provider has answered for it.
    pub fn is_conclusive_failure(&self) -> bool {
        !self.is_success() && self.tried.contains(&ProviderName::Secondary)
    }

    /// Whether the primary provider already answered this key. Legacy entries
    /// predate provenance and were always produced by the primary.
    pub fn primary_answered(&self) -> bool {
        self.tried.contains(&ProviderName::Primary) || self.provider == Some(ProviderName::Legacy)
    }
}

/// Shape written to disk. Legacy values are read but never written.
#[derive(Debug, Serialize, Deserialize)]
struct StructuredEntry {
    coords: Option<Coordinates>,
    provider: Option<ProviderName>,
    timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tried: Vec<ProviderName>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredValue {
    Pair(Coordinates),
    Structured(StructuredEntry),
}

/// Every value shape a cache file may contain.
enum StoredShape {
    FailureLegacy,
    FailureStructured(StructuredEntry),
    SuccessLegacy(Coordinates),
    SuccessStructured(StructuredEntry),
}

impl StoredShape {
    fn decode(value: Value) -> Result<Self, serde_json::Error> {
        Ok(match serde_json::from_value::<Option<StoredValue>>(value)? {
            None => StoredShape::FailureLegacy,
            Some(StoredValue::Pair(coords)) => StoredShape::SuccessLegacy(coords),
            Some(StoredValue::Structured(entry)) if entry.coords.is_some() => {
                StoredShape::SuccessStructured(entry)
            }
            Some(StoredValue::Structured(entry)) => StoredShape::FailureStructured(entry),
        })
    }

    fn into_entry(self) -> CacheEntry {
        match self {
            StoredShape::FailureLegacy => CacheEntry {
                coords: None,
                provider: Some(ProviderName::Legacy),
                timestamp: None,
                tried: Vec::new(),
            },
            StoredShape::SuccessLegacy(coords) => CacheEntry {
                coords: Some(coords),
                provider: Some(ProviderName::Legacy),
                timestamp: None,
                tried: Vec::new(),
            },
            StoredShape::FailureStructured(entry) | StoredShape::SuccessStructured(entry) => {
                let tried = if entry.tried.is_empty() {
                    entry.provider.into_iter().collect()
                } else {
                    entry.tried
                };
                CacheEntry {
                    coords: entry.coords,
                    provider: entry.provider,
                    timestamp: entry.timestamp,
                    tried,
                }
            }
        }
    }
}

impl From<&CacheEntry> for StructuredEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            coords: entry.coords,
            provider: entry.provider,
            timestamp: entry.timestamp.clone(),
            tried: entry.tried.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub by_provider: BTreeMap<ProviderName, usize>,
    pub hit_rate: f64,
}

/// Durable query → result store.
///
/// Every write is persisted before `put` returns; persistence failures are
/// logged and the in-memory state stays authoritative for the run.
pub struct ResultCache {
    path: Option<PathBuf>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    /// Loads `path`, starting empty when it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        info!(path = %path.display(), entries = entries.len(), "geocoding cache loaded");
        Self {
            path: Some(path),
            entries: Mutex::new(entries),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().get(&cache_key(key)).cloned()
    }

    /// Stores a resolution stamped with the current time.
    pub fn put(&self, key: &str, coords: Option<Coordinates>, provider: Option<ProviderName>) {
        self.write(key, coords, provider, provider.as_slice());
    }

    /// Stores a terminal failure, remembering which providers answered.
    pub fn record_failure(&self, key: &str, tried: &[ProviderName]) {
        self.write(key, None, None, tried);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let mut stats = CacheStats {
            total: entries.len(),
            ..CacheStats::default()
        };
        for entry in entries.values() {
            if entry.is_success() {
                stats.successful += 1;
                if let Some(provider) = entry.provider {
                    *stats.by_provider.entry(provider).or_default() += 1;
                }
            } else {
                stats.failed += 1;
            }
        }
        if stats.total > 0 {
            stats.hit_rate = stats.successful as f64 / stats.total as f64;
        }
        stats
    }

    fn write(
        &self,
        key: &str,
        coords: Option<Coordinates>,
        provider: Option<ProviderName>,
        attempted: &[ProviderName],
    ) {
        let key = cache_key(key);
        let mut entries = self.entries.lock();
        let mut tried = entries
            .get(&key)
            .map(|previous| previous.tried.clone())
            .unwrap_or_default();
        for name in attempted {
            if !tried.contains(name) {
                tried.push(*name);
            }
        }
        tried.sort();
        entries.insert(
            key,
            CacheEntry {
                coords,
                provider,
                timestamp: Some(Utc::now().to_rfc3339()),
                tried,
            },
        );

        if let Err(err) = self.persist_locked(&entries) {
            warn!(%err, "failed to persist geocoding cache; continuing in memory");
        }
    }

    fn persist_locked(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), GeocodeError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let ordered: BTreeMap<&String, StructuredEntry> = entries
            .iter()
            .map(|(key, entry)| (key, StructuredEntry::from(entry)))
            .collect();
        let encoded = serde_json::to_vec_pretty(&ordered)
            .map_err(|err| GeocodeError::CacheIo(err.to_string()))?;
        write_atomically(path, &encoded).map_err(|err| GeocodeError::CacheIo(err.to_string()))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)
}

fn load_entries(path: &Path) -> HashMap<String, CacheEntry> {
    match read_entries(path) {
        Ok(entries) => entries,
        Err(AppError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no geocoding cache yet; starting cold");
            HashMap::new()
        }
        Err(err) => {
            warn!(%err, path = %path.display(), "unreadable geocoding cache; starting cold");
            HashMap::new()
        }
    }
}

fn read_entries(path: &Path) -> AppResult<HashMap<String, CacheEntry>> {
    let contents = fs::read_to_string(path)?;
    let raw: serde_json::Map<String, Value> = serde_json::from_str(&contents)?;

    Ok(raw
        .into_iter()
        .filter_map(|(key, value)| match StoredShape::decode(value) {
            Ok(shape) => Some((cache_key(&key), shape.into_entry())),
            Err(err) => {
                warn!(?err, key = %key, "skipping unreadable cache entry");
                None
            }
        })
        .collect())
}
