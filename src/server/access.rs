use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};

use crate::server::AppState;
use crate::server::dto::{AccessibleRequest, CheckRequest, CheckResponse, ResolveResponse};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};

pub async fn check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> impl IntoResponse {
    let required = req.permission.parse()?;

    let allowed = state
        .gate
        .check_within(
            &req.principal_id,
            &req.entity_type,
            &req.instance_id,
            required,
            state.gate.timeout(),
        )
        .await
        .api_err("Failed to check permission")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(CheckResponse { allowed })))
}

pub async fn accessible(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AccessibleRequest>,
) -> impl IntoResponse {
    let required = req.permission.parse()?;

    let accessible = state
        .gate
        .accessible_ids_within(
            &req.principal_id,
            &req.entity_type,
            required,
            state.gate.timeout(),
        )
        .await
        .api_err("Failed to list accessible ids")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(accessible)))
}

pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Path((principal_id, entity_type, instance_id)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let gate = Arc::clone(&state.gate);
    let decision = tokio::task::spawn_blocking(move || {
        gate.resolve(&principal_id, &entity_type, &instance_id)
    })
    .await
    .map_err(|_| ApiError::internal("Resolution aborted"))?
    .api_err("Failed to resolve permission")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(ResolveResponse::from(decision))))
}
