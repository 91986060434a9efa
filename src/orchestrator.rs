//! Batch orchestration: one inbound event, many URLs, one verdict.
//!
//! URLs are handled strictly in payload order, one at a time, with a fixed
//! pause between items. A URL that fails at any stage is recorded and the
//! batch moves on; the invocation as a whole succeeds only when every URL was
//! stored. Nothing is retried here. Redelivery of the whole event is left to
//! the event transport.

use crate::config::{Config, ConfigError};
use crate::event::{InboundEvent, ParseError};
use crate::fetcher::Fetcher;
use crate::key::derive_key;
use crate::models::{BatchOutcome, ItemFailure, ItemSuccess, Stage};
use crate::observer::BatchObserver;
use crate::store::ObjectStore;
use crate::writer::ObjectWriter;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, instrument, warn};

/// Invocation-level failure. Only this reaches the caller.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("event payload contains no URLs")]
    EmptyBatch,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{failed} of {} URLs failed", .outcome.total())]
    Failures { failed: usize, outcome: BatchOutcome },
}

/// Successful invocation: every URL was stored.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub bucket: String,
    pub outcome: BatchOutcome,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcome.success_count()
    }

    pub fn failed(&self) -> usize {
        self.outcome.failure_count()
    }
}

pub struct Orchestrator<'a, S, O> {
    config: &'a Config,
    fetcher: Fetcher,
    writer: ObjectWriter<S>,
    observer: O,
}

impl<'a, S: ObjectStore, O: BatchObserver> Orchestrator<'a, S, O> {
    pub fn new(config: &'a Config, fetcher: Fetcher, writer: ObjectWriter<S>, observer: O) -> Self {
        Self {
            config,
            fetcher,
            writer,
            observer,
        }
    }

    /// Decode a raw message body and run it.
    pub async fn handle(&self, raw: &[u8]) -> Result<BatchReport, BatchError> {
        let event = InboundEvent::from_bytes(raw)?;
        self.run(&event).await
    }

    /// Run one invocation.
    ///
    /// # Errors
    ///
    /// - [`BatchError::EmptyBatch`] when the payload has no URL tokens; no
    ///   network or storage call is made
    /// - [`BatchError::Config`] when no bucket is configured
    /// - [`BatchError::Failures`] when at least one URL was not stored; the
    ///   outcome lists the stored and the failed items
    #[instrument(level = "info", skip_all, fields(message_id = ?event.message_id))]
    pub async fn run(&self, event: &InboundEvent) -> Result<BatchReport, BatchError> {
        let urls = event.url_tokens();
        if urls.is_empty() {
            warn!("Event payload contains no URLs");
            return Err(BatchError::EmptyBatch);
        }
        let bucket = self.config.resolve_bucket()?;

        let t0 = Instant::now();
        let deadline = self.config.invocation_timeout.map(|budget| t0 + budget);
        self.observer.batch_started(event, bucket, urls.len());

        let mut outcome = BatchOutcome::default();
        for (index, url) in urls.iter().copied().enumerate() {
            if index > 0 {
                self.pause(deadline).await;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.abandon(&urls[index..], index, &mut outcome);
                break;
            }

            let result = match deadline {
                Some(d) => match timeout_at(d, self.process(bucket, url)).await {
                    Ok(result) => result,
                    Err(_) => Err(failure(
                        url,
                        Stage::Deadline,
                        "invocation deadline exceeded while the item was in flight",
                    )),
                },
                None => self.process(bucket, url).await,
            };

            match result {
                Ok(item) => {
                    self.observer.item_succeeded(index, &item);
                    outcome.record_success(item);
                }
                Err(item) => {
                    self.observer.item_failed(index, &item);
                    outcome.record_failure(item);
                }
            }
        }

        self.observer.batch_finished(&outcome, t0.elapsed());
        if outcome.failed.is_empty() {
            Ok(BatchReport {
                bucket: bucket.to_string(),
                outcome,
            })
        } else {
            Err(BatchError::Failures {
                failed: outcome.failure_count(),
                outcome,
            })
        }
    }

    /// Derive key, fetch, write.
    async fn process(&self, bucket: &str, url: &str) -> Result<ItemSuccess, ItemFailure> {
        let key = derive_key(url).map_err(|e| ItemFailure {
            url: url.to_string(),
            key: None,
            stage: Stage::Key,
            cause: e.to_string(),
        })?;
        debug!(%url, %key, "Derived key");

        let content = self.fetcher.fetch(url).await.map_err(|e| ItemFailure {
            url: url.to_string(),
            key: Some(key.clone()),
            stage: Stage::Fetch,
            cause: e.to_string(),
        })?;

        let generation = self
            .writer
            .write(bucket, &key, Some(&content))
            .await
            .map_err(|e| ItemFailure {
                url: url.to_string(),
                key: Some(key.clone()),
                stage: Stage::Write,
                cause: e.to_string(),
            })?;

        Ok(ItemSuccess {
            url: url.to_string(),
            key,
            generation,
            bytes: content.len(),
        })
    }

    /// Inter-item delay, cut short by the invocation deadline.
    async fn pause(&self, deadline: Option<Instant>) {
        let delay: Duration = self.config.item_delay;
        if delay.is_zero() {
            return;
        }
        let wake = Instant::now() + delay;
        sleep_until(deadline.map_or(wake, |d| wake.min(d))).await;
    }

    fn abandon(&self, remaining: &[&str], first_index: usize, outcome: &mut BatchOutcome) {
        warn!(
            remaining = remaining.len(),
            "Invocation deadline passed; abandoning remaining URLs"
        );
        for (offset, url) in remaining.iter().copied().enumerate() {
            let item = failure(
                url,
                Stage::Abandoned,
                "invocation deadline exceeded before the item was attempted",
            );
            self.observer.item_failed(first_index + offset, &item);
            outcome.record_failure(item);
        }
    }
}

fn failure(url: &str, stage: Stage, cause: &str) -> ItemFailure {
    ItemFailure {
        url: url.to_string(),
        key: derive_key(url).ok(),
        stage,
        cause: cause.to_string(),
    }
}
