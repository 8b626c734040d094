//! Inbound control endpoint: the JSON surface the scheduler and operator
//! tooling drive. Thin translation layer over the lifecycle controller;
//! no business rules live here.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RqdError;
use crate::frame::request::FrameRequest;
use crate::machine::Machine;
use crate::report::FrameSummary;

pub fn router(machine: Arc<Machine>) -> Router {
    Router::new()
        .route("/frame/launch", post(launch_frame))
        .route("/frame/kill", post(kill_frame))
        .route("/frame/:id", get(frame_status))
        .route("/host", get(host_status))
        .route("/host/lock", post(lock))
        .route("/host/unlock", post(unlock))
        .route("/host/nimby", post(set_nimby))
        .route("/shutdown", post(shutdown))
        .route("/reboot", post(reboot))
        .with_state(machine)
}

/// Bind and serve until the token fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    machine: Arc<Machine>,
    token: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "Control endpoint listening");
    axum::serve(listener, router(machine))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

/// Axum glue: every refusal maps to a status code plus a JSON body.
struct ApiError(RqdError);

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl From<RqdError> for ApiError {
    fn from(e: RqdError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RqdError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RqdError::FrameNotFound(_) => StatusCode::NOT_FOUND,
            RqdError::DuplicateFrame(_)
            | RqdError::InsufficientCores { .. }
            | RqdError::UserLoggedIn => StatusCode::CONFLICT,
            RqdError::NimbyLocked | RqdError::ShutdownPending | RqdError::HostDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RqdError::NotRoot => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct LaunchedBody {
    frame_id: Uuid,
}

async fn launch_frame(
    State(machine): State<Arc<Machine>>,
    Json(request): Json<FrameRequest>,
) -> Result<Json<LaunchedBody>, ApiError> {
    let frame = machine.launch(request)?;
    Ok(Json(LaunchedBody {
        frame_id: frame.request.frame_id,
    }))
}

#[derive(Deserialize)]
struct KillBody {
    frame_id: Uuid,
    #[serde(default = "default_kill_reason")]
    reason: String,
}

fn default_kill_reason() -> String {
    "Killed by operator".to_string()
}

async fn kill_frame(
    State(machine): State<Arc<Machine>>,
    Json(body): Json<KillBody>,
) -> StatusCode {
    machine.kill_frame(&body.frame_id, &body.reason);
    StatusCode::ACCEPTED
}

#[derive(Serialize)]
struct FrameStatusBody {
    #[serde(flatten)]
    frame: FrameSummary,
    run_time_sec: u64,
    kill_requested: bool,
}

async fn frame_status(
    State(machine): State<Arc<Machine>>,
    Path(id): Path<Uuid>,
) -> Result<Json<FrameStatusBody>, ApiError> {
    let frame = machine
        .cache
        .get(&id)
        .ok_or(RqdError::FrameNotFound(id))?;
    Ok(Json(FrameStatusBody {
        frame: FrameSummary::from_frame(&frame),
        run_time_sec: frame.run_time_sec(),
        kill_requested: frame.kill_requested(),
    }))
}

async fn host_status(State(machine): State<Arc<Machine>>) -> impl IntoResponse {
    Json(machine.status_report())
}

#[derive(Deserialize)]
struct LockBody {
    /// Hundredths of a core; omitted means the whole host.
    cores: Option<u32>,
}

async fn lock(State(machine): State<Arc<Machine>>, Json(body): Json<LockBody>) -> StatusCode {
    match body.cores {
        Some(n) => machine.lock_cores(n),
        None => machine.lock_all(),
    }
    StatusCode::OK
}

async fn unlock(State(machine): State<Arc<Machine>>, Json(body): Json<LockBody>) -> StatusCode {
    match body.cores {
        Some(n) => machine.unlock_cores(n),
        None => machine.unlock_all(),
    }
    StatusCode::OK
}

#[derive(Deserialize)]
struct NimbyBody {
    enabled: bool,
}

async fn set_nimby(
    State(machine): State<Arc<Machine>>,
    Json(body): Json<NimbyBody>,
) -> StatusCode {
    machine.set_nimby(body.enabled);
    StatusCode::OK
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ShutdownBody {
    now: bool,
    restart: bool,
}

async fn shutdown(
    State(machine): State<Arc<Machine>>,
    Json(body): Json<ShutdownBody>,
) -> StatusCode {
    match (body.restart, body.now) {
        (false, false) => machine.shutdown_idle(),
        (false, true) => machine.shutdown_now(),
        (true, false) => machine.restart_idle(),
        (true, true) => machine.restart_now(),
    }
    StatusCode::ACCEPTED
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RebootBody {
    now: bool,
}

async fn reboot(
    State(machine): State<Arc<Machine>>,
    Json(body): Json<RebootBody>,
) -> Result<StatusCode, ApiError> {
    if body.now {
        machine.reboot_now()?;
    } else {
        machine.reboot_idle()?;
    }
    Ok(StatusCode::ACCEPTED)
}
