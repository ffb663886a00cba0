//! Geocode a batch of `(address, city)` pairs exported by the crawler.
//!
//! Reads a JSON array of `{address, city}` objects and writes the same
//! records back with a `coordinates` field (`[lon, lat]` or `null`).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

use carnamapa_geocoder::{init_tracing, AppConfig, CancelSignal, Coordinates, GeocodePipeline};

#[derive(Parser, Debug)]
#[command(name = "carnamapa-geocode", version)]
struct Args {
    /// Input JSON file (reads stdin when omitted)
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Output JSON file (writes stdout when omitted)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Re-process failed entries with the secondary provider only
    #[arg(long, default_value_t = false)]
    retry_failed: bool,

    /// Print run and cache statistics to stderr
    #[arg(long, default_value_t = false)]
    summary: bool,

    /// Override the cache file location
    #[arg(long)]
    cache_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct InputRecord {
    address: String,
    city: String,
}

#[derive(Debug, Serialize)]
struct OutputRecord<'a> {
    address: &'a str,
    city: &'a str,
    coordinates: Option<Coordinates>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = AppConfig::from_env();
    if let Some(path) = args.cache_file {
        config.cache_file = path;
    }
    info!(config = %serde_json::to_string(&config.public_profile())?, "geocoder configured");

    let records = read_input(args.input.as_deref()).await?;
    let pairs = records
        .iter()
        .map(|record| (record.address.clone(), record.city.clone()))
        .collect();

    let pipeline = GeocodePipeline::from_config(&config).context("building geocoding pipeline")?;

    let cancel = Arc::new(CancelSignal::new());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; letting in-flight calls finish");
                cancel.cancel();
            }
        });
    }

    let output = if args.retry_failed {
        pipeline.retry_failed(pairs, None, Some(cancel)).await
    } else {
        pipeline.geocode(pairs, None, Some(cancel)).await
    };

    let rows: Vec<OutputRecord<'_>> = records
        .iter()
        .map(|record| OutputRecord {
            address: &record.address,
            city: &record.city,
            coordinates: output.get(&record.address, &record.city),
        })
        .collect();
    write_output(args.output.as_deref(), &rows).await?;

    if args.summary {
        let summary = json!({
            "run": output.summary,
            "cache": pipeline.cache_stats(),
        });
        eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

async fn read_input(path: Option<&Path>) -> Result<Vec<InputRecord>> {
    let raw = match path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buffer)
                .await
                .context("reading stdin")?;
            buffer
        }
    };
    serde_json::from_str(&raw).context("parsing input records")
}

async fn write_output(path: Option<&Path>, rows: &[OutputRecord<'_>]) -> Result<()> {
    let encoded = serde_json::to_vec_pretty(rows)?;
    match path {
        Some(path) => {
            fs::write(path, &encoded).with_context(|| format!("writing {}", path.display()))?
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&encoded).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
