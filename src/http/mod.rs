//! HTTP surface of the supervisor: status, manual restart, reconfiguration.
//!
//! Every route, including unknown paths, sits behind [`gate::restart_gate`]
//! and answers 503 while a restart is in progress.

mod gate;
mod routes;

use crate::supervisor::Supervisor;
use axum::routing::{get, post};
use axum::{middleware, Router};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    /// Zone timestamps are rendered in.
    pub timezone: Tz,
    /// Sent as `Retry-After` with every 503.
    pub retry_after: Duration,
}

impl AppState {
    /// RFC 3339 with an explicit offset.
    fn render(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.timezone).to_rfc3339()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/status", get(routes::status))
        .route("/admin/restart", post(routes::restart))
        .route("/admin/configure", post(routes::configure))
        .fallback(routes::not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gate::restart_gate,
        ))
        .with_state(state)
}

#[instrument(skip(state, shutdown))]
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("HTTP server failed")?;
    info!("HTTP server stopped");
    Ok(())
}
