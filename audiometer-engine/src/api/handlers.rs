//! HTTP request handlers

use crate::api::server::AppContext;
use crate::audio::ToneOutput;
use crate::error::Error;
use crate::session::SessionRequest;
use audiometer_common::config::FrequencyPreset;
use audiometer_common::db::{self, SessionSummary};
use audiometer_common::interpretation::{interpret, Interpretation};
use audiometer_common::{Ear, SessionReport, SessionStatus, ThresholdRecord};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    git_hash: String,
    build_timestamp: String,
    build_profile: String,
    session_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    devices: Vec<String>,
}

/// POST /test/start body; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRequest {
    pub subject: Option<String>,
    pub preset: Option<FrequencyPreset>,
    pub frequencies: Option<Vec<u32>>,
    pub ears: Option<Vec<Ear>>,
    pub start_level_db: Option<i32>,
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartResponse {
    pub session_id: Uuid,
    pub total_combinations: usize,
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    running: bool,
    session: Option<SessionReport>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    session_id: Uuid,
    status: SessionStatus,
    records: Vec<ThresholdRecord>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    subject: Option<String>,
}

type ApiError = (StatusCode, Json<StatusResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn api_error(code: StatusCode, message: impl Into<String>) -> ApiError {
    (
        code,
        Json(StatusResponse {
            status: format!("error: {}", message.into()),
        }),
    )
}

fn ok_status(status: &str) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: status.to_string(),
    })
}

// ============================================================================
// Health and Devices
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "audiometer".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("GIT_HASH").to_string(),
        build_timestamp: env!("BUILD_TIMESTAMP").to_string(),
        build_profile: env!("BUILD_PROFILE").to_string(),
        session_running: ctx.state.is_running(),
    })
}

/// GET /audio/devices - List available audio output devices
pub async fn list_audio_devices() -> ApiResult<DeviceListResponse> {
    match ToneOutput::list_devices() {
        Ok(devices) => {
            info!("Found {} audio devices", devices.len());
            Ok(Json(DeviceListResponse { devices }))
        }
        Err(e) => {
            error!("Failed to list audio devices: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

// ============================================================================
// Session Control
// ============================================================================

/// POST /test/start - Start a new session
///
/// 409 if a session is already running, 400 for an invalid configuration.
pub async fn start_test(
    State(ctx): State<AppContext>,
    Json(req): Json<StartRequest>,
) -> ApiResult<StartResponse> {
    let mut config = (*ctx.base_config).clone();
    if let Some(preset) = req.preset {
        config = config.with_preset(preset);
    }
    if let Some(frequencies) = req.frequencies {
        config.frequencies = frequencies;
    }
    if let Some(ears) = req.ears {
        config.ears = ears;
    }
    if let Some(level) = req.start_level_db {
        config.start_level_db = level;
    }
    let total_combinations = config.combination_count();

    let request = SessionRequest {
        config,
        subject: req.subject,
        prior_records: Vec::new(),
        seed: req.seed,
    };

    match ctx.runner.start(&ctx.state, request).await {
        Ok(session_id) => {
            info!("Started session {} via API", session_id);
            Ok(Json(StartResponse {
                session_id,
                total_combinations,
            }))
        }
        Err(Error::InvalidState(msg)) => Err(api_error(StatusCode::CONFLICT, msg)),
        Err(Error::Config(msg)) => {
            warn!("Rejected session configuration: {}", msg);
            Err(api_error(StatusCode::BAD_REQUEST, msg))
        }
        Err(e) => {
            error!("Failed to start session: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// POST /test/stop - Request cancellation of the running session
pub async fn stop_test(State(ctx): State<AppContext>) -> ApiResult<StatusResponse> {
    if ctx.state.cancel_session().await {
        Ok(ok_status("stopping"))
    } else {
        Err(api_error(StatusCode::CONFLICT, "no session is running"))
    }
}

/// GET /test/state - Current session snapshot
pub async fn get_state(State(ctx): State<AppContext>) -> Json<StateResponse> {
    Json(StateResponse {
        running: ctx.state.is_running(),
        session: ctx.state.snapshot().await,
    })
}

/// GET /test/results - Records of the current or last session
pub async fn get_results(State(ctx): State<AppContext>) -> ApiResult<ResultsResponse> {
    let report = ctx
        .state
        .snapshot()
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no session has been started"))?;

    Ok(Json(ResultsResponse {
        session_id: report.session_id,
        status: report.status,
        records: report.records,
    }))
}

/// GET /test/interpretation - Audiogram summary of the current or last session
pub async fn get_interpretation(State(ctx): State<AppContext>) -> ApiResult<Interpretation> {
    let report = ctx
        .state
        .snapshot()
        .await
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no session has been started"))?;
    Ok(Json(interpret(&report)))
}

// ============================================================================
// Response Button
// ============================================================================

/// POST /response/press
pub async fn press(State(ctx): State<AppContext>) -> Json<StatusResponse> {
    ctx.state.latch.notify_pressed();
    debug!("Response button pressed");
    ok_status("pressed")
}

/// POST /response/release
pub async fn release(State(ctx): State<AppContext>) -> Json<StatusResponse> {
    ctx.state.latch.notify_released();
    debug!("Response button released");
    ok_status("released")
}

// ============================================================================
// History
// ============================================================================

/// GET /history?subject= - Stored sessions, newest first
pub async fn list_history(
    State(ctx): State<AppContext>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<SessionSummary>> {
    let pool = ctx
        .runner
        .db_pool()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "history database disabled"))?;

    db::list_sessions(pool, query.subject.as_deref())
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to list sessions: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })
}

/// GET /history/:session_id - One stored session
pub async fn get_history_session(
    State(ctx): State<AppContext>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<SessionReport> {
    let pool = ctx
        .runner
        .db_pool()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "history database disabled"))?;

    match db::load_session(pool, session_id).await {
        Ok(report) => Ok(Json(report)),
        Err(audiometer_common::Error::NotFound(msg)) => {
            Err(api_error(StatusCode::NOT_FOUND, msg))
        }
        Err(e) => {
            error!("Failed to load session {}: {}", session_id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
