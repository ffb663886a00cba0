pub mod cache;
pub mod chain;
pub mod config;
pub mod errors;
pub mod google;
pub mod nominatim;
pub mod normalizer;
pub mod pipeline;
pub mod pool;
pub mod providers;
pub mod query;
pub mod throttle;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cache::{CacheEntry, CacheStats, ResultCache};
pub use crate::chain::{ChainMode, ChainSettings, ProviderChain, Resolution, ResolutionSource};
pub use crate::config::{AppConfig, PublicAppConfig};
pub use crate::errors::{AppError, AppResult, GeocodeError};
pub use crate::normalizer::{extract_landmark, normalize};
pub use crate::pipeline::{GeocodePipeline, PipelineOutput};
pub use crate::pool::{BatchReport, BatchSummary, PoolProgress, ProgressObserver, ThrottlePool};
pub use crate::providers::{GeocodeProvider, ProviderName};
pub use crate::query::{BoundingBox, Coordinates, GeocodeQuery};
pub use crate::throttle::{AdmissionGate, CancelSignal, PacingGate};

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,carnamapa_geocoder=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
