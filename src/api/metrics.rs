//! GET /metrics
//!
//! The queue depth gauge is refreshed from the store on every scrape so it
//! stays right even when another process drained the queue.

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::AppState;
use crate::metrics::{self, QUEUE_DEPTH};

pub fn metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(scrape))
}

async fn scrape(State(state): State<AppState>) -> Response {
    match state.queue.depth().await {
        Ok(depth) => QUEUE_DEPTH.set(depth),
        Err(error) => tracing::warn!(%error, "Queue depth unavailable for scrape"),
    }

    match metrics::render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(error) => {
            tracing::error!(%error, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
