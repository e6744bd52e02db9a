use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use eyre::Result;

use crate::status::StatusBoard;

pub async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn index() -> &'static str {
    "forge manager"
}

async fn readiness(State(board): State<Arc<StatusBoard>>) -> StatusCode {
    if board.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn liveness(State(board): State<Arc<StatusBoard>>) -> StatusCode {
    if board.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status(State(board): State<Arc<StatusBoard>>) -> Response {
    match board.latest() {
        Some(report) => Json(report).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "no tick completed yet").into_response(),
    }
}

/// Probe and status routes. `/metrics` is added separately by
/// `metrics::setup_metrics_routes`, which installs a global recorder.
pub fn app(board: Arc<StatusBoard>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(readiness))
        .route("/_liveness", get(liveness))
        .route("/status", get(status))
        .with_state(board)
}
