mod entity_types;
mod grants;
mod links;
mod roles;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

use crate::server::AppState;

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        // Grant routes
        .route("/grants", post(grants::create_grant))
        .route("/grants", delete(grants::delete_grant))
        .route(
            "/grants/{subject_kind}/{subject_id}",
            get(grants::list_grants),
        )
        // Role routes
        .route("/roles", post(roles::create_role))
        .route("/roles", get(roles::list_roles))
        .route("/roles/{id}", get(roles::get_role))
        .route("/roles/{id}", delete(roles::delete_role))
        .route("/roles/{id}/active", put(roles::set_role_active))
        .route("/roles/{id}/members", get(roles::list_members))
        .route("/roles/{id}/members/{principal_id}", put(roles::add_member))
        .route(
            "/roles/{id}/members/{principal_id}",
            delete(roles::remove_member),
        )
        // Relationship graph routes
        .route("/links", post(links::create_link))
        .route("/links", delete(links::delete_link))
        .route(
            "/links/{entity_type}/{instance_id}",
            delete(links::delete_entity_links),
        )
        // Registry and cache
        .route("/entity-types", get(entity_types::list_entity_types))
        .route("/cache", get(entity_types::cache_stats))
        .route("/cache", delete(entity_types::clear_cache))
}
