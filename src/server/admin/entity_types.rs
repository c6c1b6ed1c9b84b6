use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::server::AppState;
use crate::server::response::ApiResponse;

pub async fn list_entity_types(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let types: Vec<_> = state.gate.registry().types().into_iter().cloned().collect();
    Json(ApiResponse::success(types))
}

pub async fn cache_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ApiResponse::success(state.gate.cache().stats()))
}

pub async fn clear_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.gate.cache().clear();
    tracing::info!("Permission cache cleared");
    StatusCode::NO_CONTENT
}
