//! Endpoint HTTP fetch + short-lived session cache for GAFM.

use std::collections::HashMap;
use std::fmt;
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use gafm_core::ComposedResult;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "gafm-storage";

pub const DEFAULT_ENDPOINT_URL: &str =
    "https://ferrazpiai-n8n-editor.uyk8ty.easypanel.host/webhook/report-otimizacao-contas-googleads";

/// The dashboard holds exactly one dataset, so the cache has one fixed key.
pub const CACHE_KEY: &str = "gads_dashboard_cache";
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status}: {status_text}")]
    HttpStatus { status: u16, status_text: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("response body is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

impl FetchError {
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::HttpStatus { .. } | FetchError::Transport(_))
    }
}

/// Anything that can produce the raw report payload.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn fetch_json(&self) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Single-endpoint GET client. Failures are returned as-is; the next scheduled
/// or manual refresh is the only retry.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpFetcher {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self) -> Result<Value, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }

        let body = resp.bytes().await?;
        debug!(bytes = body.len(), "endpoint responded");
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn fetch_json(&self) -> Result<Value, FetchError> {
        let span = info_span!("endpoint_fetch", url = %self.url);
        self.request().instrument(span).await
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupted cache entry: {0}")]
    Corrupted(#[from] serde_json::Error),
}

/// String key-value storage scoped to one running session.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set(&self, key: &str, value: String) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), CacheError> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.remove(key);
        Ok(())
    }
}

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock for deterministic TTL checks.
#[cfg(any(test, feature = "test-util"))]
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

#[cfg(any(test, feature = "test-util"))]
impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub written_at_epoch_millis: i64,
    pub data: ComposedResult,
}

/// Holder for the single cached dashboard result.
///
/// Every store failure is logged and swallowed: a failed read is a miss and a
/// failed write or invalidate is a no-op.
pub struct SessionCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("key", &CACHE_KEY)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionCache {
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn read(&self) -> Option<ComposedResult> {
        match self.try_read() {
            Ok(hit) => hit,
            Err(err) => {
                warn!(error = %err, "session cache read failed; treating as miss");
                None
            }
        }
    }

    fn try_read(&self) -> Result<Option<ComposedResult>, CacheError> {
        let Some(raw) = self.store.get(CACHE_KEY)? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_str(&raw)?;
        let age_millis = self.clock.now_millis() - entry.written_at_epoch_millis;
        if age_millis < self.ttl.as_millis() as i64 {
            debug!(age_millis, "session cache hit");
            Ok(Some(entry.data))
        } else {
            debug!(age_millis, "session cache entry expired");
            Ok(None)
        }
    }

    pub fn write(&self, data: &ComposedResult) {
        let entry = CacheEntry {
            written_at_epoch_millis: self.clock.now_millis(),
            data: data.clone(),
        };
        let result = serde_json::to_string(&entry)
            .map_err(CacheError::from)
            .and_then(|raw| self.store.set(CACHE_KEY, raw));
        if let Err(err) = result {
            warn!(error = %err, "session cache write failed; continuing without cache");
        }
    }

    pub fn invalidate(&self) {
        if let Err(err) = self.store.remove(CACHE_KEY) {
            warn!(error = %err, "session cache invalidate failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use gafm_core::AccountRecord;
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;

    fn sample_result() -> ComposedResult {
        let fields = json!({"GT": "Ana Silva", "days_since_update": 4});
        let accounts = vec![AccountRecord::from_fields(
            fields.as_object().cloned().unwrap_or_default(),
        )];
        ComposedResult::from_accounts(accounts, Some("2024-03-01T10:00:00Z".into()))
    }

    fn cache_with_clock() -> (SessionCache, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let cache = SessionCache::new(store.clone(), clock.clone(), DEFAULT_CACHE_TTL);
        (cache, store, clock)
    }

    struct BrokenStore;

    impl CacheStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("quota exceeded".into()))
        }
        fn set(&self, _key: &str, _value: String) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("quota exceeded".into()))
        }
        fn remove(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("quota exceeded".into()))
        }
    }

    #[test]
    fn cache_entry_is_valid_until_ttl_elapses() {
        let (cache, _store, clock) = cache_with_clock();
        let data = sample_result();
        cache.write(&data);

        clock.set(T0 + 299_999);
        assert_eq!(cache.read(), Some(data));

        clock.set(T0 + 300_000);
        assert_eq!(cache.read(), None);

        clock.set(T0 + 300_001);
        assert_eq!(cache.read(), None);
    }

    #[test]
    fn cache_entry_layout_uses_epoch_millis() {
        let (cache, store, _clock) = cache_with_clock();
        cache.write(&sample_result());
        let raw = store.get(CACHE_KEY).unwrap().expect("entry written");
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["writtenAtEpochMillis"], json!(T0));
        assert_eq!(value["data"]["managers"][0]["name"], json!("Ana Silva"));
    }

    #[test]
    fn invalidate_removes_entry() {
        let (cache, _store, _clock) = cache_with_clock();
        cache.write(&sample_result());
        cache.invalidate();
        assert_eq!(cache.read(), None);
    }

    #[test]
    fn corrupted_entry_reads_as_miss() {
        let (cache, store, _clock) = cache_with_clock();
        store.set(CACHE_KEY, "{not json".into()).unwrap();
        assert_eq!(cache.read(), None);

        cache.write(&sample_result());
        assert!(cache.read().is_some());
    }

    #[test]
    fn broken_store_never_fails_callers() {
        let cache = SessionCache::new(
            Arc::new(BrokenStore),
            Arc::new(ManualClock::new(T0)),
            DEFAULT_CACHE_TTL,
        );
        cache.write(&sample_result());
        cache.invalidate();
        assert_eq!(cache.read(), None);
    }

    async fn spawn_endpoint(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/report")
    }

    #[tokio::test]
    async fn fetch_sends_accept_header_and_parses_json() {
        let app = Router::new().route(
            "/report",
            get(|headers: HeaderMap| async move {
                let accept = headers
                    .get(header::ACCEPT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({"data": [], "accept": accept}))
            }),
        );
        let url = spawn_endpoint(app).await;
        let fetcher = HttpFetcher::new(url, HttpClientConfig::default()).unwrap();

        let value = fetcher.fetch_json().await.expect("fetch");
        assert_eq!(value["accept"], json!("application/json"));
        assert_eq!(value["data"], json!([]));
    }

    #[tokio::test]
    async fn non_success_status_maps_to_http_status_error() {
        let app = Router::new().route(
            "/report",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down") }),
        );
        let url = spawn_endpoint(app).await;
        let fetcher = HttpFetcher::new(url, HttpClientConfig::default()).unwrap();

        let err = fetcher.fetch_json().await.unwrap_err();
        assert!(err.is_network());
        match err {
            FetchError::HttpStatus { status, status_text } => {
                assert_eq!(status, 503);
                assert_eq!(status_text, "Service Unavailable");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_body_maps_to_parse_error() {
        let app = Router::new().route("/report", get(|| async { "<html>oops</html>" }));
        let url = spawn_endpoint(app).await;
        let fetcher = HttpFetcher::new(url, HttpClientConfig::default()).unwrap();

        let err = fetcher.fetch_json().await.unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
        assert!(!err.is_network());
    }

    #[tokio::test]
    async fn refused_connection_maps_to_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher =
            HttpFetcher::new(format!("http://{addr}/report"), HttpClientConfig::default()).unwrap();
        let err = fetcher.fetch_json().await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)));
    }
}
