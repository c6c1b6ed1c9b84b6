use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::server::AppState;
use crate::server::dto::{GrantRequest, ListGrantsParams, RevokeRequest};
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};
use crate::types::{Subject, SubjectKind};

pub async fn create_grant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GrantRequest>,
) -> impl IntoResponse {
    let grant = req.into_grant()?;
    let grant = state.gate.grant(grant).api_err("Failed to save grant")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(grant)))
}

pub async fn delete_grant(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RevokeRequest>,
) -> impl IntoResponse {
    let (subject, target) = req.subject_and_target()?;

    let removed = state
        .gate
        .revoke(&subject, &target)
        .api_err("Failed to revoke grant")?;

    if !removed {
        return Err(ApiError::not_found("Grant not found"));
    }

    Ok::<_, ApiError>(StatusCode::NO_CONTENT)
}

pub async fn list_grants(
    State(state): State<Arc<AppState>>,
    Path((subject_kind, subject_id)): Path<(String, String)>,
    Query(params): Query<ListGrantsParams>,
) -> impl IntoResponse {
    let kind = SubjectKind::parse(&subject_kind)
        .ok_or_else(|| ApiError::bad_request(format!("Invalid subject kind: {subject_kind}")))?;
    let subject = Subject {
        kind,
        id: subject_id,
    };

    let grants = state
        .gate
        .list_grants(&subject, params.entity_type.as_deref())
        .api_err("Failed to list grants")?;

    Ok::<_, ApiError>(Json(ApiResponse::success(grants)))
}
