//! Batch observability capability.
//!
//! The orchestrator reports progress through a [`BatchObserver`] handed to it
//! at construction. [`TracingObserver`] turns those callbacks into `tracing`
//! events; tests plug in recorders.

use crate::event::InboundEvent;
use crate::models::{BatchOutcome, ItemFailure, ItemSuccess};
use std::time::Duration;
use tracing::{info, warn};

pub trait BatchObserver {
    fn batch_started(&self, _event: &InboundEvent, _bucket: &str, _urls: usize) {}

    fn item_succeeded(&self, index: usize, item: &ItemSuccess);

    fn item_failed(&self, index: usize, item: &ItemFailure);

    fn batch_finished(&self, outcome: &BatchOutcome, elapsed: Duration);
}

impl<T: BatchObserver + ?Sized> BatchObserver for &T {
    fn batch_started(&self, event: &InboundEvent, bucket: &str, urls: usize) {
        (**self).batch_started(event, bucket, urls)
    }

    fn item_succeeded(&self, index: usize, item: &ItemSuccess) {
        (**self).item_succeeded(index, item)
    }

    fn item_failed(&self, index: usize, item: &ItemFailure) {
        (**self).item_failed(index, item)
    }

    fn batch_finished(&self, outcome: &BatchOutcome, elapsed: Duration) {
        (**self).batch_finished(outcome, elapsed)
    }
}

/// Logs batch progress as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl BatchObserver for TracingObserver {
    fn batch_started(&self, event: &InboundEvent, bucket: &str, urls: usize) {
        info!(
            %bucket,
            urls,
            message_id = event.message_id.as_deref(),
            attributes = ?event.attributes,
            "Batch started"
        );
    }

    fn item_succeeded(&self, index: usize, item: &ItemSuccess) {
        info!(
            index,
            url = %item.url,
            key = %item.key,
            generation = %item.generation,
            bytes = item.bytes,
            "Stored"
        );
    }

    fn item_failed(&self, index: usize, item: &ItemFailure) {
        warn!(
            index,
            url = %item.url,
            key = item.key.as_ref().map(|k| k.as_str()),
            stage = %item.stage,
            cause = %item.cause,
            "Item failed"
        );
    }

    fn batch_finished(&self, outcome: &BatchOutcome, elapsed: Duration) {
        let succeeded = outcome.success_count();
        let failed = outcome.failure_count();
        if failed == 0 {
            info!(succeeded, failed, elapsed_ms = elapsed.as_millis() as u64, "Batch complete");
        } else {
            warn!(
                succeeded,
                failed,
                failed_urls = ?outcome.failed_urls(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Batch complete with failures"
            );
        }
    }
}
