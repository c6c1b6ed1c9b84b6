use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::server::AppState;
use crate::server::dto::{CreateRoleRequest, PaginationParams, SetRoleActiveRequest};
use crate::server::response::{
    ApiError, ApiResponse, DEFAULT_PAGE_SIZE, PaginatedResponse, StoreOptionExt, StoreResultExt,
    paginate,
};

pub async fn create_role(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateRoleRequest>,
) -> impl IntoResponse {
    let role = state
        .gate
        .create_role(&req.name, req.id.as_deref())
        .api_err("Role already exists")?;

    Ok::<_, ApiError>((StatusCode::CREATED, Json(ApiResponse::success(role))))
}

pub async fn list_roles(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaginationParams>,
) -> impl IntoResponse {
    let cursor = params.cursor.as_deref().unwrap_or("");

    let roles = state
        .gate
        .store()
        .list_roles(cursor, DEFAULT_PAGE_SIZE + 1)
        .api_err("Failed to list roles")?;

    let (roles, next_cursor, has_more) =
        paginate(roles, DEFAULT_PAGE_SIZE as usize, |r| r.id.clone());

    Ok::<_, ApiError>(Json(PaginatedResponse::new(roles, next_cursor, has_more)))
}

pub async fn get_role(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let role = state
        .gate
        .store()
        .get_role(&id)
        .api_err("Failed to get role")?
        .or_not_found("Role not found")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(role)))
}

pub async fn delete_role(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let removed = state
        .gate
        .delete_role(&id)
        .api_err("Failed to delete role")?;

    if !removed {
        return Err(ApiError::not_found("Role not found"));
    }

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn set_role_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SetRoleActiveRequest>,
) -> impl IntoResponse {
    let role = state
        .gate
        .set_role_active(&id, req.active)
        .api_err("Role not found")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(role)))
}

pub async fn list_members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let members = state.gate.members(&id).api_err("Role not found")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(members)))
}

pub async fn add_member(
    State(state): State<Arc<AppState>>,
    Path((id, principal_id)): Path<(String, String)>,
) -> impl IntoResponse {
    state
        .gate
        .add_member(&id, &principal_id)
        .api_err("Role not found")?;

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn remove_member(
    State(state): State<Arc<AppState>>,
    Path((id, principal_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let removed = state
        .gate
        .remove_member(&id, &principal_id)
        .api_err("Failed to remove member")?;

    if !removed {
        return Err(ApiError::not_found("Membership not found"));
    }

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}
