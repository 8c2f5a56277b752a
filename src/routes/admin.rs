use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Admin Router Module
///
/// Every route here is wrapped by `admin_middleware` in `create_router`,
/// which authenticates the caller and rejects non-admin roles with 403.
/// Paths are shared with the authenticated module; axum merges the method
/// routers per path.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // --- User Administration ---
        .route("/users", get(handlers::list_users).post(handlers::create_user))
        .route("/users/{id}", delete(handlers::delete_user))
        .route("/users/{id}/reset-password", put(handlers::reset_password))
        // --- Roles ---
        // Create links permissions in one transaction; update replaces the whole set.
        .route("/roles", post(handlers::create_role))
        .route(
            "/roles/{id}",
            put(handlers::update_role).delete(handlers::delete_role),
        )
        // --- Modules ---
        .route("/modules", post(handlers::create_module))
        .route(
            "/modules/{id}",
            put(handlers::update_module).delete(handlers::delete_module),
        )
}
