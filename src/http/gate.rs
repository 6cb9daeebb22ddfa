use super::AppState;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

/// Rejects every request while a restart is in progress.
pub async fn restart_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.supervisor.in_progress() {
        return next.run(request).await;
    }
    debug!(
        path = %request.uri().path(),
        phase = ?state.supervisor.phase(),
        "Rejecting request during restart"
    );
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::RETRY_AFTER, state.retry_after.as_secs().to_string())],
        Json(json!({
            "message": "Server unavailable due to scheduled restart. Please try again later."
        })),
    )
        .into_response()
}
