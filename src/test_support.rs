//! Shared test fixtures: a local HTTP server, recording observer and
//! misbehaving stores.

use crate::event::InboundEvent;
use crate::models::{BatchOutcome, Generation, ItemFailure, ItemSuccess, StorageKey};
use crate::observer::BatchObserver;
use crate::store::memory::MemoryStream;
use crate::store::{MemoryStore, ObjectStore, ObjectStream, StoreError};
use axum::Router;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::routing::get;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PAGE_HTML: &str = "<html><head><title>Front page</title><script>track()</script></head>\
<body><p>Hello</p></body></html>";

/// In-process HTTP server bound to an ephemeral port.
pub struct FixtureServer {
    base: String,
    hits: Arc<AtomicUsize>,
}

impl FixtureServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Requests received so far, including unknown paths.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Routes:
///
/// | Path | Response |
/// |------|----------|
/// | `/users/x` | 200 JSON object |
/// | `/users/x/followers` | 200 JSON array |
/// | `/a` | 200 JSON object |
/// | `/page` | 200 HTML |
/// | `/plain` | 200 text |
/// | `/empty` | 200 empty body |
/// | `/large` | 200, 1 KiB text |
/// | `/created` | 201 JSON |
/// | `/error` | 500 |
/// | `/slow` | 200 JSON after 2 s |
/// | anything else | 404 |
pub async fn spawn_fixture_server() -> FixtureServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    let app = Router::new()
        .route(
            "/users/x",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"login":"x","id":1}"#,
                )
            }),
        )
        .route(
            "/users/x/followers",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"[{"login":"y"},{"login":"z"}]"#,
                )
            }),
        )
        .route(
            "/a",
            get(|| async { ([(header::CONTENT_TYPE, "application/json")], r#"{"a":1}"#) }),
        )
        .route(
            "/page",
            get(|| async { ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], PAGE_HTML) }),
        )
        .route("/plain", get(|| async { "plain text body" }))
        .route("/empty", get(|| async { "" }))
        .route("/large", get(|| async { "x".repeat(1024) }))
        .route("/created", get(|| async { (StatusCode::CREATED, "{}") }))
        .route(
            "/error",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "{}") }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "{}"
            }),
        )
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                next.run(req).await
            }
        }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FixtureServer {
        base: format!("http://{addr}"),
        hits,
    }
}

/// Observer that keeps a compact log of callbacks.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
    attributes: Mutex<BTreeMap<String, String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// Attributes of the last event seen by `batch_started`.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        self.attributes.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl BatchObserver for RecordingObserver {
    fn batch_started(&self, event: &InboundEvent, _bucket: &str, urls: usize) {
        *self.attributes.lock().unwrap() = event.attributes.clone();
        self.push(format!("started {urls}"));
    }

    fn item_succeeded(&self, index: usize, _item: &ItemSuccess) {
        self.push(format!("ok {index}"));
    }

    fn item_failed(&self, index: usize, item: &ItemFailure) {
        self.push(format!("fail {index} {}", item.stage));
    }

    fn batch_finished(&self, outcome: &BatchOutcome, _elapsed: Duration) {
        self.push(format!(
            "finished {}/{}",
            outcome.success_count(),
            outcome.failure_count()
        ));
    }
}

/// Store whose streams accept the open and then never finish a write.
#[derive(Debug, Clone, Default)]
pub struct StallingStore {
    inner: MemoryStore,
}

impl StallingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

pub struct StallingStream(MemoryStream);

impl ObjectStore for StallingStore {
    type Stream = StallingStream;

    async fn open(&self, bucket: &str, key: &StorageKey) -> Result<StallingStream, StoreError> {
        Ok(StallingStream(self.inner.open(bucket, key).await?))
    }

    async fn generations(&self, bucket: &str, key: &StorageKey) -> Result<Vec<Generation>, StoreError> {
        self.inner.generations(bucket, key).await
    }

    async fn read(
        &self,
        bucket: &str,
        key: &StorageKey,
        generation: &Generation,
    ) -> Result<Vec<u8>, StoreError> {
        self.inner.read(bucket, key, generation).await
    }
}

impl ObjectStream for StallingStream {
    async fn write_all(&mut self, _buf: &[u8]) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn close(self) -> Result<Generation, StoreError> {
        self.0.close().await
    }

    async fn abort(self) {
        self.0.abort().await
    }
}

/// Store whose copy step fails for selected keys.
#[derive(Debug, Clone, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: Arc<HashSet<String>>,
    aborted: Arc<AtomicUsize>,
}

impl FailingStore {
    pub fn failing_on<'k>(keys: impl IntoIterator<Item = &'k str>) -> Self {
        Self {
            failing: Arc::new(keys.into_iter().map(str::to_owned).collect()),
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn aborted(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

pub struct FailingStream {
    stream: MemoryStream,
    fail: bool,
    aborted: Arc<AtomicUsize>,
}

impl ObjectStore for FailingStore {
    type Stream = FailingStream;

    async fn open(&self, bucket: &str, key: &StorageKey) -> Result<FailingStream, StoreError> {
        Ok(FailingStream {
            stream: self.inner.open(bucket, key).await?,
            fail: self.failing.contains(key.as_str()),
            aborted: Arc::clone(&self.aborted),
        })
    }

    async fn generations(&self, bucket: &str, key: &StorageKey) -> Result<Vec<Generation>, StoreError> {
        self.inner.generations(bucket, key).await
    }

    async fn read(
        &self,
        bucket: &str,
        key: &StorageKey,
        generation: &Generation,
    ) -> Result<Vec<u8>, StoreError> {
        self.inner.read(bucket, key, generation).await
    }
}

impl ObjectStream for FailingStream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Backend("injected copy failure".to_string()));
        }
        self.stream.write_all(buf).await
    }

    async fn close(self) -> Result<Generation, StoreError> {
        self.stream.close().await
    }

    async fn abort(self) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        self.stream.abort().await
    }
}
