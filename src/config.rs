//! Runtime configuration.
//!
//! A single [`Config`] is built at process entry and passed by reference to
//! every component. Values are layered: built-in defaults, then an optional
//! YAML file, then command-line flags and their environment variables.
//!
//! ```yaml
//! bucket: fetched-objects
//! store: fs
//! store_root: /var/lib/url_ingest
//! transform: auto
//! fetch_timeout_secs: 20
//! write_timeout_secs: 50
//! item_delay_ms: 1000
//! invocation_timeout_secs: 540
//! ```

use crate::cli::Cli;
use crate::transform::TransformKind;
use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Budget for one object write (open + copy + close).
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(50);
/// Pause between two URLs of one batch.
pub const DEFAULT_ITEM_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;
pub const DEFAULT_STORE_ROOT: &str = "./objects";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("destination bucket is not configured (set BUCKET_NAME or --bucket)")]
    MissingBucket,
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Object store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Versioned directory tree under `store_root`.
    #[default]
    Fs,
    /// Process-local store, discarded on exit.
    Memory,
    /// S3 bucket with versioning enabled (requires the `s3` feature).
    S3,
}

/// Settings for the HTTP fetch stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Whole-request budget, connect through last body byte.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Bodies larger than this are rejected.
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Destination bucket; resolved per invocation, see [`Config::resolve_bucket`].
    pub bucket: Option<String>,
    pub store: StoreKind,
    pub store_root: PathBuf,
    pub transform: TransformKind,
    pub fetch: FetchConfig,
    pub write_timeout: Duration,
    pub item_delay: Duration,
    /// Wall-clock budget for a whole batch. `None` means unbounded.
    pub invocation_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: None,
            store: StoreKind::default(),
            store_root: PathBuf::from(DEFAULT_STORE_ROOT),
            transform: TransformKind::default(),
            fetch: FetchConfig::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            item_delay: DEFAULT_ITEM_DELAY,
            invocation_timeout: None,
        }
    }
}

/// On-disk shape of the YAML config file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    bucket: Option<String>,
    store: Option<StoreKind>,
    store_root: Option<PathBuf>,
    transform: Option<TransformKind>,
    fetch_timeout_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    write_timeout_secs: Option<u64>,
    item_delay_ms: Option<u64>,
    invocation_timeout_secs: Option<u64>,
    max_body_bytes: Option<usize>,
    user_agent: Option<String>,
}

impl Config {
    /// Build the process configuration from parsed CLI arguments.
    ///
    /// Reads the YAML file named by `--config` first, then applies every flag
    /// that was given.
    #[instrument(level = "info", skip_all)]
    pub async fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path).await?,
            None => Self::default(),
        };
        config.apply_cli(cli);
        config.validate()?;
        debug!(?config, "Resolved configuration");
        Ok(config)
    }

    /// Defaults overlaid with the YAML file at `path`.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let file: FileConfig =
            serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        info!(path = %path.display(), "Loaded configuration file");

        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(bucket) = file.bucket {
            self.bucket = Some(bucket);
        }
        if let Some(store) = file.store {
            self.store = store;
        }
        if let Some(root) = file.store_root {
            self.store_root = root;
        }
        if let Some(transform) = file.transform {
            self.transform = transform;
        }
        if let Some(secs) = file.fetch_timeout_secs {
            self.fetch.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.fetch.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.write_timeout_secs {
            self.write_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = file.item_delay_ms {
            self.item_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = file.invocation_timeout_secs {
            self.invocation_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(max) = file.max_body_bytes {
            self.fetch.max_body_bytes = max;
        }
        if let Some(ua) = file.user_agent {
            self.fetch.user_agent = ua;
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bucket) = &cli.bucket {
            self.bucket = Some(bucket.clone());
        }
        if let Some(store) = cli.store {
            self.store = store;
        }
        if let Some(root) = &cli.store_root {
            self.store_root = root.clone();
        }
        if let Some(transform) = cli.transform {
            self.transform = transform;
        }
        if let Some(secs) = cli.fetch_timeout_secs {
            self.fetch.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.connect_timeout_secs {
            self.fetch.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.write_timeout_secs {
            self.write_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = cli.item_delay_ms {
            self.item_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = cli.invocation_timeout_secs {
            self.invocation_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(max) = cli.max_body_bytes {
            self.fetch.max_body_bytes = max;
        }
        if let Some(ua) = &cli.user_agent {
            self.fetch.user_agent = ua.clone();
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Invalid("write timeout must be positive".into()));
        }
        if self.fetch.timeout.is_zero() || self.fetch.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("fetch timeouts must be positive".into()));
        }
        if self.fetch.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("max body size must be positive".into()));
        }
        if self.invocation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Invalid("invocation timeout must be positive".into()));
        }
        Ok(())
    }

    /// The destination bucket for this invocation.
    ///
    /// There is no default bucket: an absent or blank value is a
    /// configuration error for the invocation.
    pub fn resolve_bucket(&self) -> Result<&str, ConfigError> {
        self.bucket
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or(ConfigError::MissingBucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.write_timeout, Duration::from_secs(50));
        assert_eq!(config.item_delay, Duration::from_secs(1));
        assert_eq!(config.transform, TransformKind::Json);
        assert_eq!(config.store, StoreKind::Fs);
        assert!(config.invocation_timeout.is_none());
    }

    #[test]
    fn test_resolve_bucket() {
        let mut config = Config::default();
        assert!(matches!(config.resolve_bucket(), Err(ConfigError::MissingBucket)));

        config.bucket = Some("   ".to_string());
        assert!(matches!(config.resolve_bucket(), Err(ConfigError::MissingBucket)));

        config.bucket = Some(" fetched ".to_string());
        assert_eq!(config.resolve_bucket().unwrap(), "fetched");
    }

    #[tokio::test]
    async fn test_yaml_then_cli_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "bucket: from-file\nstore: memory\ntransform: auto\nitem_delay_ms: 250\nwrite_timeout_secs: 10"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from([
            "url_ingest",
            "--config",
            path.as_str(),
            "--bucket",
            "from-cli",
            "--item-delay-ms",
            "0",
        ]);
        let config = Config::from_cli(&cli).await.unwrap();

        assert_eq!(config.bucket.as_deref(), Some("from-cli"));
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.transform, TransformKind::Auto);
        assert_eq!(config.item_delay, Duration::ZERO);
        assert_eq!(config.write_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_unknown_yaml_field_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bucket: b\nretries: 3").unwrap();
        let err = Config::load(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_missing_config_file() {
        let err = Config::load(Path::new("/nonexistent/url_ingest.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[tokio::test]
    async fn test_zero_write_timeout_rejected() {
        let cli = Cli::parse_from(["url_ingest", "--write-timeout-secs", "0"]);
        assert!(matches!(
            Config::from_cli(&cli).await,
            Err(ConfigError::Invalid(_))
        ));
    }
}
