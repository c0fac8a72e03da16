use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ChannelConfig;
use crate::controller::{Actuator, ActuatorController, WriteError};
use crate::crop;
use crate::dashboard::DashboardView;
use crate::poller::{self, ChannelHealth, ChannelState, TelemetryView};
use crate::remote::RemoteStore;
use crate::state::SharedEvents;

const DEFAULT_HISTORY_RESULTS: u32 = 40;
const MAX_HISTORY_RESULTS: u32 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub telemetry: TelemetryView,
    pub controller: Arc<ActuatorController>,
    pub events: SharedEvents,
    pub remote: Arc<dyn RemoteStore>,
    pub channels: Arc<Vec<ChannelConfig>>,
    pub started_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/actuators", post(api_actuators))
        .route("/api/crop", get(api_crop))
        .route("/api/channels/{name}", get(api_channel))
        .route("/api/channels/{name}/history", get(api_history))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(
        DashboardView::build(
            &state.telemetry,
            &state.controller,
            &state.events,
            state.started_at,
        )
        .await,
    )
}

#[derive(Debug, Deserialize)]
struct ActuatorRequest {
    motor: Option<bool>,
    fertilizer: Option<bool>,
}

async fn api_actuators(
    State(state): State<AppState>,
    Json(req): Json<ActuatorRequest>,
) -> Result<Response, ApiError> {
    let ctl = &state.controller;
    let outcome = match (req.motor, req.fertilizer) {
        (Some(motor), Some(fertilizer)) => ctl.request_write(motor, fertilizer).await?,
        (Some(on), None) => ctl.set_actuator(Actuator::Motor, on).await?,
        (None, Some(on)) => ctl.set_actuator(Actuator::Fertilizer, on).await?,
        (None, None) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "specify motor and/or fertilizer",
            ))
        }
    };
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct NpkQuery {
    n: f64,
    p: f64,
    k: f64,
}

async fn api_crop(Query(q): Query<NpkQuery>) -> impl IntoResponse {
    let crop = crop::suggest(q.n, q.p, q.k);
    Json(json!({
        "id": crop.id(),
        "description": crop.description(),
    }))
}

#[derive(Serialize)]
struct ChannelDetail {
    channel: ChannelState,
    health: ChannelHealth,
}

async fn api_channel(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let (Some(channel), Some(health)) = (
        state.telemetry.channel(&name).await,
        state.telemetry.health(&name).await,
    ) else {
        return Err(unknown_channel(&name));
    };
    Ok(Json(ChannelDetail { channel, health }).into_response())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    results: Option<u32>,
}

async fn api_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let channel = state
        .channels
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| unknown_channel(&name))?;

    let results = q
        .results
        .unwrap_or(DEFAULT_HISTORY_RESULTS)
        .clamp(1, MAX_HISTORY_RESULTS);

    match poller::fetch_history(state.remote.as_ref(), channel, results).await {
        Ok(readings) => Ok(Json(readings).into_response()),
        Err(e) => {
            warn!(channel = %name, "history fetch failed: {e}");
            Err(ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

struct ApiError {
    status: StatusCode,
    message: String,
    remaining_secs: Option<u32>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            remaining_secs: None,
        }
    }
}

fn unknown_channel(name: &str) -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, format!("unknown channel '{name}'"))
}

impl From<WriteError> for ApiError {
    fn from(err: WriteError) -> Self {
        let status = match &err {
            WriteError::Busy => StatusCode::CONFLICT,
            WriteError::LockedOut { .. } => StatusCode::TOO_MANY_REQUESTS,
            WriteError::Rejected | WriteError::Transport(_) => StatusCode::BAD_GATEWAY,
        };
        let remaining_secs = match err {
            WriteError::LockedOut { remaining_secs } => Some(remaining_secs),
            _ => None,
        };
        Self {
            status,
            message: err.to_string(),
            remaining_secs,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.remaining_secs {
            Some(remaining) => json!({ "message": self.message, "remaining_secs": remaining }),
            None => json!({ "message": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    state: AppState,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "web api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("web server error")?;

    info!("web api stopped");
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
