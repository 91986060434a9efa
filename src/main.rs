//! # URL Ingest
//!
//! An event-triggered pipeline that fetches a batch of URLs, normalizes each
//! response body, and saves it as a new generation of an object keyed by the
//! URL's host and path.
//!
//! ## Features
//!
//! - Accepts raw whitespace-separated payloads, Pub/Sub push envelopes and
//!   CloudEvents wrapping a Pub/Sub message
//! - Sequential, fail-soft processing: one bad URL never stops the batch
//! - Pluggable body transforms (pretty JSON, indented XML, HTML text, verbatim)
//! - Filesystem, in-memory and (with the `s3` feature) S3 object stores
//!
//! ## Usage
//!
//! ```sh
//! BUCKET_NAME=fetched url_ingest https://api.example.com/users/x
//! url_ingest -b fetched -e event.json
//! echo "https://a.example/x https://b.example/y" | url_ingest -b fetched
//! ```
//!
//! ## Architecture
//!
//! 1. **Decode**: unwrap the inbound event into URL tokens
//! 2. **Key**: derive `host/path` for each URL
//! 3. **Fetch**: GET and transform the body
//! 4. **Write**: stream the bytes into the store under a per-write budget
//! 5. **Report**: print the outcome as JSON; exit non-zero if anything failed

use clap::Parser;
use std::error::Error;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod event;
mod fetcher;
mod key;
mod models;
mod observer;
mod orchestrator;
mod store;
mod transform;
mod utils;
mod writer;

#[cfg(test)]
mod test_support;

use cli::Cli;
use config::{Config, StoreKind};
use fetcher::Fetcher;
use observer::TracingObserver;
use orchestrator::{BatchError, Orchestrator};
use store::{FsStore, MemoryStore, ObjectStore};
use utils::ensure_writable_dir;
use writer::ObjectWriter;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("url_ingest starting up");

    let args = Cli::parse();
    let config = Config::from_cli(&args).await?;
    debug!(
        store = ?config.store,
        transform = %config.transform,
        store_root = %config.store_root.display(),
        "Resolved configuration"
    );

    let raw = read_event(&args).await?;

    let result = match config.store {
        StoreKind::Fs => {
            if let Err(e) = ensure_writable_dir(&config.store_root).await {
                error!(
                    path = %config.store_root.display(),
                    error = %e,
                    "Store root is not writable (fix perms or choose a different path)"
                );
                return Err(e);
            }
            run_invocation(&config, FsStore::new(config.store_root.clone()), &raw).await?
        }
        StoreKind::Memory => run_invocation(&config, MemoryStore::new(), &raw).await?,
        #[cfg(feature = "s3")]
        StoreKind::S3 => run_invocation(&config, store::S3Store::from_env().await, &raw).await?,
        #[cfg(not(feature = "s3"))]
        StoreKind::S3 => {
            error!("S3 backend requested but this binary was built without the `s3` feature");
            return Err("s3 store backend is not available in this build".into());
        }
    };

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    result.map_err(exit_error)
}

/// Reduce a batch error to its message.
///
/// The outcome is already on stdout, so the error `main` returns carries only
/// the summary line.
fn exit_error(e: BatchError) -> Box<dyn Error> {
    error!(error = %e, "Invocation failed");
    Box::<dyn Error>::from(e.to_string())
}

/// Build the pipeline for one store backend, run the event, print the outcome.
///
/// The outer `Result` carries setup failures; the inner one is the verdict.
async fn run_invocation<S: ObjectStore>(
    config: &Config,
    store: S,
    raw: &[u8],
) -> Result<Result<(), BatchError>, Box<dyn Error>> {
    let fetcher = Fetcher::new(&config.fetch, config.transform.build())?;
    debug!(transform = fetcher.transform_name(), "Fetcher ready");
    let writer = ObjectWriter::new(store, config.write_timeout);
    let orchestrator = Orchestrator::new(config, fetcher, writer, TracingObserver);

    match orchestrator.handle(raw).await {
        Ok(report) => {
            info!(
                bucket = %report.bucket,
                succeeded = report.succeeded(),
                failed = report.failed(),
                keys = ?report.outcome.succeeded_keys(),
                "All URLs stored"
            );
            println!("{}", serde_json::to_string_pretty(&report.outcome)?);
            Ok(Ok(()))
        }
        Err(BatchError::Failures { failed, outcome }) => {
            warn!(
                stored = ?outcome.succeeded_keys(),
                failed_keys = ?outcome.failed_keys(),
                "Some URLs were not stored"
            );
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(Err(BatchError::Failures { failed, outcome }))
        }
        Err(e) => Ok(Err(e)),
    }
}

/// Event bytes from `--event-file`, positional arguments, or stdin.
async fn read_event(args: &Cli) -> Result<Vec<u8>, Box<dyn Error>> {
    match &args.event_file {
        Some(path) if path == Path::new("-") => read_stdin().await,
        Some(path) => Ok(tokio::fs::read(path).await?),
        None if !args.payload.is_empty() => Ok(args.payload.join(" ").into_bytes()),
        None => read_stdin().await,
    }
}

async fn read_stdin() -> Result<Vec<u8>, Box<dyn Error>> {
    let mut buf = Vec::new();
    tokio::io::stdin().read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchOutcome, ItemFailure, Stage};

    #[test]
    fn test_exit_error_carries_only_summary() {
        let mut outcome = BatchOutcome::default();
        outcome.record_failure(ItemFailure {
            url: "https://example.com/missing".to_string(),
            key: None,
            stage: Stage::Fetch,
            cause: "HTTP 404".to_string(),
        });
        let err = exit_error(BatchError::Failures { failed: 1, outcome });
        assert_eq!(err.to_string(), "1 of 1 URLs failed");
        assert_eq!(format!("{err:?}"), "\"1 of 1 URLs failed\"");
    }
}
