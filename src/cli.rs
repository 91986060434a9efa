//! Command-line interface definitions for url_ingest.
//!
//! Every option can also be supplied through an environment variable or the
//! YAML file named by `--config`; flags win over the file.

use crate::config::StoreKind;
use crate::transform::TransformKind;
use clap::Parser;
use std::path::PathBuf;

/// Fetch every URL named in an inbound event and store its normalized body
/// under `host + path` in a versioned object store.
///
/// The event is read from `--event-file`, from the positional `PAYLOAD`
/// arguments, or from stdin when neither is given. It may be a Pub/Sub push
/// envelope, a structured CloudEvent, or plain text.
///
/// # Examples
///
/// ```sh
/// # Single URL into the local filesystem store
/// url_ingest --bucket fetched https://api.github.com/users/github
///
/// # Pub/Sub push body from a file, XML-aware transform
/// url_ingest --bucket fetched --transform auto --event-file push.json
///
/// # Newline separated list on stdin
/// printf 'https://a.example/x\nhttps://b.example/y\n' | url_ingest --bucket fetched
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// URLs to fetch (joined with spaces into the event payload)
    #[arg(value_name = "PAYLOAD")]
    pub payload: Vec<String>,

    /// Read the raw event body from this file (`-` for stdin)
    #[arg(short, long, conflicts_with = "payload")]
    pub event_file: Option<PathBuf>,

    /// Optional path to a YAML config file
    #[arg(short, long, env = "URL_INGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Destination bucket
    #[arg(short, long, env = "BUCKET_NAME")]
    pub bucket: Option<String>,

    /// Object store backend
    #[arg(long, env = "STORE_BACKEND", value_enum)]
    pub store: Option<StoreKind>,

    /// Root directory of the filesystem store
    #[arg(long, env = "STORE_ROOT")]
    pub store_root: Option<PathBuf>,

    /// How fetched bodies are normalized before storing
    #[arg(short, long, env = "CONTENT_TRANSFORM", value_enum)]
    pub transform: Option<TransformKind>,

    /// Timeout for one HTTP fetch, in seconds
    #[arg(long)]
    pub fetch_timeout_secs: Option<u64>,

    /// Connect timeout for one HTTP fetch, in seconds
    #[arg(long)]
    pub connect_timeout_secs: Option<u64>,

    /// Budget for one object write, in seconds
    #[arg(long)]
    pub write_timeout_secs: Option<u64>,

    /// Pause between two URLs of a batch, in milliseconds
    #[arg(long)]
    pub item_delay_ms: Option<u64>,

    /// Budget for the whole batch, in seconds
    #[arg(long, env = "INVOCATION_TIMEOUT_SECS")]
    pub invocation_timeout_secs: Option<u64>,

    /// Largest response body accepted, in bytes
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// User-Agent header sent with every fetch
    #[arg(long)]
    pub user_agent: Option<String>,
}
