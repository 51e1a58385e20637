//! Dashboard pipeline orchestration and refresh lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use gafm_core::{format_timestamp, ComposedResult};
use gafm_envelope::normalize;
use gafm_storage::{
    FetchError, HttpClientConfig, HttpFetcher, JsonSource, SessionCache, DEFAULT_ENDPOINT_URL,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gafm-sync";

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub endpoint_url: String,
    pub http_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub refresh_interval_secs: u64,
    pub user_agent: String,
    pub web_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        Self {
            endpoint_url: lookup("GAFM_ENDPOINT_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ENDPOINT_URL.to_string()),
            http_timeout_secs: number("GAFM_HTTP_TIMEOUT_SECS", 20),
            cache_ttl_secs: number("GAFM_CACHE_TTL_SECS", 300),
            refresh_interval_secs: number("GAFM_REFRESH_INTERVAL_SECS", 300).max(1),
            user_agent: lookup("GAFM_USER_AGENT").unwrap_or_else(|| "gafm-monitor/0.1".to_string()),
            web_port: lookup("GAFM_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Normalizes a raw payload and aggregates it into the dashboard result.
pub fn compose(payload: &Value) -> ComposedResult {
    let normalized = normalize(payload);
    ComposedResult::from_accounts(normalized.accounts, normalized.updated_at)
}

pub struct DashboardPipeline {
    source: Arc<dyn JsonSource>,
    cache: SessionCache,
}

impl DashboardPipeline {
    pub fn new(source: Arc<dyn JsonSource>, cache: SessionCache) -> Self {
        Self { source, cache }
    }

    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.endpoint_url.clone(), config.http_client_config())?;
        debug!(
            url = fetcher.url(),
            ttl_secs = config.cache_ttl_secs,
            "dashboard pipeline configured"
        );
        Ok(Self::new(
            Arc::new(fetcher),
            SessionCache::in_memory(config.cache_ttl()),
        ))
    }

    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Cached result when fresh, otherwise one fetch followed by normalize and
    /// aggregate. Nothing is cached when the fetch fails.
    pub async fn fetch_and_compose(&self) -> Result<ComposedResult, FetchError> {
        if let Some(cached) = self.cache.read() {
            debug!("serving dashboard from session cache");
            return Ok(cached);
        }

        let payload = self.source.fetch_json().await?;
        let result = compose(&payload);
        self.cache.write(&result);
        Ok(result)
    }

    pub fn clear_cache(&self) {
        self.cache.invalidate();
    }

    pub async fn load(&self, force: bool) -> Result<ComposedResult, FetchError> {
        if force {
            self.clear_cache();
        }
        self.fetch_and_compose().await
    }
}

/// What a presentation consumer shows right now.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewSnapshot {
    pub result: Option<ComposedResult>,
    pub error: Option<String>,
    pub displayed_timestamp: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Last-writer-wins holder for the published dashboard state.
#[derive(Debug, Default)]
pub struct DashboardView {
    state: RwLock<ViewSnapshot>,
}

impl DashboardView {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> ViewSnapshot {
        self.state.read().await.clone()
    }

    async fn publish(&self, result: ComposedResult) {
        let displayed = match result.updated_at.as_deref() {
            Some(updated_at) => format_timestamp(Some(updated_at), &Local),
            None => Local::now().format("%d/%m/%Y %H:%M").to_string(),
        };
        let mut state = self.state.write().await;
        state.result = Some(result);
        state.error = None;
        state.displayed_timestamp = Some(displayed);
        state.loaded_at = Some(Utc::now());
    }

    /// Keeps the previously shown result; only the error changes.
    async fn publish_error(&self, message: String) {
        self.state.write().await.error = Some(message);
    }
}

/// Runs the pipeline and publishes each outcome into the shared view.
#[derive(Clone)]
pub struct Refresher {
    pipeline: Arc<DashboardPipeline>,
    view: Arc<DashboardView>,
}

impl Refresher {
    pub fn new(pipeline: Arc<DashboardPipeline>, view: Arc<DashboardView>) -> Self {
        Self { pipeline, view }
    }

    pub fn pipeline(&self) -> &DashboardPipeline {
        &self.pipeline
    }

    pub fn view(&self) -> &DashboardView {
        &self.view
    }

    /// Overlapping loads are not cancelled; whichever completes last is what
    /// the view shows.
    pub async fn load(&self, force: bool) -> Result<ComposedResult, FetchError> {
        match self.pipeline.load(force).await {
            Ok(result) => {
                info!(
                    accounts = result.accounts.len(),
                    managers = result.managers.len(),
                    updated_at = result.updated_at.as_deref().unwrap_or("-"),
                    force,
                    "dashboard refreshed"
                );
                self.view.publish(result.clone()).await;
                Ok(result)
            }
            Err(err) => {
                warn!(error = %err, force, "dashboard refresh failed");
                self.view.publish_error(err.to_string()).await;
                Err(err)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Owns the one auto-refresh job. `start` replaces any running job, so at most
/// one timer exists at a time.
pub struct RefreshController {
    refresher: Refresher,
    interval: Duration,
    scheduler: JobScheduler,
    job: Mutex<Option<Uuid>>,
}

impl RefreshController {
    pub async fn new(refresher: Refresher, interval: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        scheduler.start().await.context("starting scheduler")?;
        Ok(Self {
            refresher,
            interval,
            scheduler,
            job: Mutex::new(None),
        })
    }

    pub fn refresher(&self) -> &Refresher {
        &self.refresher
    }

    /// First load may come from cache; the timer starts regardless of its outcome.
    pub async fn init(&self) -> Result<()> {
        let _ = self.refresher.load(false).await;
        self.start().await
    }

    pub async fn refresh_now(&self) -> Result<ComposedResult, FetchError> {
        self.refresher.load(true).await
    }

    pub async fn start(&self) -> Result<()> {
        let mut job = self.job.lock().await;
        if let Some(previous) = job.take() {
            self.scheduler
                .remove(&previous)
                .await
                .context("removing previous refresh job")?;
        }

        let refresher = self.refresher.clone();
        let refresh_job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let refresher = refresher.clone();
            Box::pin(async move {
                let _ = refresher.load(true).await;
            })
        })
        .with_context(|| format!("creating refresh job every {:?}", self.interval))?;

        let id = self
            .scheduler
            .add(refresh_job)
            .await
            .context("adding refresh job")?;
        *job = Some(id);
        info!(interval_secs = self.interval.as_secs(), "auto refresh started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut job = self.job.lock().await;
        if let Some(id) = job.take() {
            self.scheduler
                .remove(&id)
                .await
                .context("removing refresh job")?;
            info!("auto refresh stopped");
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.job.lock().await.is_some()
    }

    /// Hidden pauses the timer. Visible forces a refresh, then restarts it.
    pub async fn set_visibility(&self, visibility: Visibility) -> Result<()> {
        match visibility {
            Visibility::Hidden => self.stop().await,
            Visibility::Visible => {
                let _ = self.refresher.load(true).await;
                self.start().await
            }
        }
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.stop().await?;
        self.scheduler
            .shutdown()
            .await
            .context("shutting down scheduler")
    }
}
