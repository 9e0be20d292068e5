//! Health, status and control endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use laggard_escalation::ServiceStatus;

use crate::lifecycle::Signal;
use crate::state::AppState;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(code: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (
        code,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

// ── Health ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db_connected: bool,
    pub running: bool,
}

/// 200 while the store answers, 503 otherwise.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let db_connected = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "health check: store unreachable");
            false
        }
    };
    state.status.set_db_connected(db_connected).await;
    let running = state.status.snapshot().await.running;

    let (code, label) = if db_connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        code,
        Json(HealthResponse {
            status: label,
            db_connected,
            running,
        }),
    )
}

// ── Status ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: ServiceStatus,
    pub config: serde_json::Value,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.status.snapshot().await,
        config: state.config_summary.clone(),
    })
}

// ── Control ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ControlResponse {
    pub accepted: String,
}

/// `POST /control/{action}`: start, stop or reload the loops.
pub async fn control(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ControlResponse>), (StatusCode, Json<ErrorResponse>)> {
    let Some(expected) = state.control_token.as_deref() else {
        return Err(error(StatusCode::NOT_FOUND, "control endpoints are disabled"));
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(expected) {
        return Err(error(StatusCode::UNAUTHORIZED, "invalid or missing bearer token"));
    }

    let signal: Signal = action
        .parse()
        .map_err(|e: String| error(StatusCode::BAD_REQUEST, e))?;
    state
        .lifecycle
        .send(signal)
        .await
        .map_err(|e| error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    info!(action = %action, "control signal accepted");
    Ok((StatusCode::ACCEPTED, Json(ControlResponse { accepted: action })))
}
