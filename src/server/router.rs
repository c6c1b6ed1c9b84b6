use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{get, post},
};

use super::access;
use super::admin::admin_router;
use crate::authz::Gate;

pub struct AppState {
    pub gate: Arc<Gate>,
}

impl AppState {
    pub fn new(gate: Arc<Gate>) -> Self {
        Self { gate }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/check", post(access::check))
        .route("/api/v1/accessible", post(access::accessible))
        .route(
            "/api/v1/resolve/{principal_id}/{entity_type}/{instance_id}",
            get(access::resolve),
        )
        .nest("/api/v1/admin", admin_router())
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
