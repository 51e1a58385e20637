//! Axum JSON API exposing the composed dashboard to presentation consumers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use gafm_core::{ComposedResult, ManagerSummary, StatusPanels};
use gafm_sync::{MonitorConfig, Refresher};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "gafm-web";

#[derive(Clone)]
pub struct AppState {
    pub refresher: Refresher,
}

impl AppState {
    pub fn new(refresher: Refresher) -> Self {
        Self { refresher }
    }
}

#[derive(Debug, Serialize)]
struct PanelsResponse<'a> {
    #[serde(flatten)]
    panels: StatusPanels<'a>,
    counts: PanelCounts,
    managers: &'a [ManagerSummary],
    #[serde(rename = "updatedAt")]
    updated_at: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct PanelCounts {
    ok: usize,
    warning: usize,
    critical: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/panels", get(panels_handler))
        .route("/api/view", get(view_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(Arc::new(state))
}

pub async fn serve(config: &MonitorConfig, refresher: Refresher) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving dashboard api");
    axum::serve(listener, app(AppState::new(refresher))).await?;
    Ok(())
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.refresher.load(false).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => upstream_error(err),
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.refresher.load(true).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => upstream_error(err),
    }
}

async fn panels_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.refresher.load(false).await {
        Ok(result) => panels_response(&result),
        Err(err) => upstream_error(err),
    }
}

async fn view_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.refresher.view().snapshot().await).into_response()
}

fn panels_response(result: &ComposedResult) -> Response {
    let panels = result.panels();
    let (ok, warning, critical) = panels.counts();
    let body = PanelsResponse {
        panels,
        counts: PanelCounts {
            ok,
            warning,
            critical,
        },
        managers: &result.managers,
        updated_at: result.updated_at.as_deref(),
    };
    Json(body).into_response()
}

fn upstream_error(err: impl std::fmt::Display) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
