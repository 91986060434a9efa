//! HTTP content fetching.
//!
//! One GET per URL, no retry. A response is accepted only with status
//! `200 OK`; its body is read up to a size cap and handed to the configured
//! [`ContentTransform`]. The response is dropped on every exit path, which
//! releases its connection.

use crate::config::FetchConfig;
use crate::transform::{ContentTransform, FormatError};
use crate::utils::truncate_for_log;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, redirect};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const MAX_REDIRECTS: usize = 10;

/// Fetch stage failure for one URL.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("transport error for {url} (timed out: {timed_out}): {source}")]
    Transport {
        url: String,
        timed_out: bool,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("body of {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },
    #[error("cannot normalize body of {url} as {transform}: {source}")]
    Format {
        url: String,
        transform: &'static str,
        #[source]
        source: FormatError,
    },
}

impl FetchError {
    fn transport(url: &str, source: reqwest::Error) -> Self {
        FetchError::Transport {
            url: url.to_string(),
            timed_out: source.is_timeout(),
            source,
        }
    }
}

/// HTTP client plus the content policy applied to every body.
pub struct Fetcher {
    client: Client,
    transform: Box<dyn ContentTransform>,
    max_body_bytes: usize,
}

impl fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("transform", &self.transform.name())
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl Fetcher {
    pub fn new(
        config: &FetchConfig,
        transform: Box<dyn ContentTransform>,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.as_str())
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self {
            client,
            transform,
            max_body_bytes: config.max_body_bytes,
        })
    }

    pub fn transform_name(&self) -> &'static str {
        self.transform.name()
    }

    /// Fetch `url` and return the transformed body.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Transport`] if the request cannot be sent or the body
    ///   cannot be read (including timeouts)
    /// - [`FetchError::HttpStatus`] for any status other than `200 OK`
    /// - [`FetchError::BodyTooLarge`] if the body exceeds the configured cap
    /// - [`FetchError::Format`] if the transform rejects the body
    #[instrument(level = "info", skip_all, fields(%url))]
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let t0 = Instant::now();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            warn!(status = status.as_u16(), "Non-200 response; not storing");
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_bytes as u64)
        {
            return Err(FetchError::BodyTooLarge {
                url: url.to_string(),
                limit: self.max_body_bytes,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| FetchError::transport(url, e))?;
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(FetchError::BodyTooLarge {
                    url: url.to_string(),
                    limit: self.max_body_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }
        debug!(bytes = body.len(), content_type = ?content_type, "Read response body");

        let content = self
            .transform
            .apply(&body, content_type.as_deref())
            .map_err(|source| {
                warn!(
                    transform = self.transform.name(),
                    error = %source,
                    body_preview = %truncate_for_log(&String::from_utf8_lossy(&body), 200),
                    "Body rejected by content transform"
                );
                FetchError::Format {
                    url: url.to_string(),
                    transform: self.transform.name(),
                    source,
                }
            })?;

        info!(
            bytes_in = body.len(),
            bytes_out = content.len(),
            transform = self.transform.name(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "Fetched"
        );
        Ok(content)
    }
}
