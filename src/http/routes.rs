use super::AppState;
use crate::error::SupervisorError;
use crate::policy::RestartPolicy;
use crate::supervisor::TriggerOutcome;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize)]
pub struct RootResponse {
    message: &'static str,
    process_id: Option<i32>,
    last_restart: String,
    next_restart: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: &'static str,
    process_id: Option<i32>,
    uptime_seconds: f64,
    last_restart: String,
    next_restart: Option<String>,
    restart_interval_hours: f64,
    restart_count: u64,
}

#[derive(Debug, Serialize)]
pub struct RestartResponse {
    message: &'static str,
    process_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureRequest {
    interval_hours: i64,
}

#[derive(Debug, Deserialize)]
pub struct ConfigureQuery {
    interval_hours: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ConfigureResponse {
    message: String,
    next_restart_in_seconds: i64,
}

pub async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let snapshot = state.supervisor.snapshot();
    Json(RootResponse {
        message: "Server running with scheduled restarts",
        process_id: snapshot.target.map(|target| target.pid),
        last_restart: state.render(snapshot.state.last_restart_at),
        next_restart: snapshot.state.next_restart_at.map(|at| state.render(at)),
    })
}

pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.supervisor.snapshot();
    let uptime = snapshot.state.uptime(snapshot.now);
    Json(StatusResponse {
        status: "running",
        process_id: snapshot.target.map(|target| target.pid),
        uptime_seconds: uptime.num_milliseconds() as f64 / 1000.0,
        last_restart: state.render(snapshot.state.last_restart_at),
        next_restart: snapshot.state.next_restart_at.map(|at| state.render(at)),
        restart_interval_hours: snapshot.policy.cadence_hours(),
        restart_count: snapshot.state.restart_count,
    })
}

pub async fn restart(State(state): State<AppState>) -> (StatusCode, Json<RestartResponse>) {
    let process_id = state.supervisor.snapshot().target.map(|target| target.pid);
    info!(?process_id, "Manual restart requested");
    let message = match state.supervisor.trigger_manual() {
        TriggerOutcome::Started => "Application restarting...",
        TriggerOutcome::AlreadyRestarting | TriggerOutcome::Stale => "Restart already in progress",
    };
    (
        StatusCode::ACCEPTED,
        Json(RestartResponse {
            message,
            process_id,
        }),
    )
}

/// `interval_hours` comes from the query string or, failing that, a JSON
/// body.
pub async fn configure(
    State(state): State<AppState>,
    query: Result<Query<ConfigureQuery>, QueryRejection>,
    body: Result<Json<ConfigureRequest>, JsonRejection>,
) -> Result<Json<ConfigureResponse>, ApiError> {
    let interval_hours = match (query, body) {
        (Ok(Query(ConfigureQuery { interval_hours: Some(hours) })), _) => hours,
        (Err(rejection), _) => {
            debug!(%rejection, "Unreadable configure query");
            return Err(ApiError::BadRequest);
        }
        (Ok(_), Ok(Json(request))) => request.interval_hours,
        (Ok(_), Err(rejection)) => {
            debug!(%rejection, "Unreadable configure body");
            return Err(ApiError::BadRequest);
        }
    };

    let policy = RestartPolicy::interval_hours(interval_hours)?;
    let fire_at = state.supervisor.reconfigure(policy)?;
    let now = state.supervisor.clock().now();
    Ok(Json(ConfigureResponse {
        message: format!("Restart interval configured to {interval_hours} hours"),
        next_restart_in_seconds: (fire_at - now).num_seconds(),
    }))
}

pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "message": "Not found" })))
}

/// Only invalid input is explained to the caller.
pub enum ApiError {
    /// The request could not be read at all.
    BadRequest,
    Supervisor(SupervisorError),
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        Self::Supervisor(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Expected an integer interval_hours" })),
            )
                .into_response(),
            ApiError::Supervisor(err @ SupervisorError::InvalidPolicy(_)) => {
                warn!(%err, "Rejected reconfiguration");
                (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() })))
                    .into_response()
            }
            ApiError::Supervisor(err) => {
                error!(%err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "Internal error" })),
                )
                    .into_response()
            }
        }
    }
}
