use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::server::AppState;
use crate::server::dto::{LinkRequest, UnlinkEntityResponse};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::types::EntityRef;

pub async fn create_link(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LinkRequest>,
) -> impl IntoResponse {
    let (parent, child) = req.endpoints();

    let link = state
        .gate
        .link(&parent, &child, req.ownership_flag)
        .api_err("Failed to link entities")?;

    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(link))))
}

pub async fn delete_link(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LinkRequest>,
) -> impl IntoResponse {
    let (parent, child) = req.endpoints();

    let removed = state
        .gate
        .unlink(&parent, &child)
        .api_err("Failed to unlink entities")?;

    if !removed {
        return Err(ApiError::not_found("Link not found"));
    }

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

/// Drops every link touching one entity, for when the entity is destroyed.
pub async fn delete_entity_links(
    State(state): State<Arc<AppState>>,
    Path((entity_type, instance_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let removed = state
        .gate
        .unlink_entity(&EntityRef::new(entity_type, instance_id))
        .api_err("Failed to unlink entity")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(UnlinkEntityResponse { removed })))
}
