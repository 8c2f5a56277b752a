use crate::{AppState, handlers};
use axum::{Router, routing::get};

/// Authenticated Router Module
///
/// Read access to roles, permissions and modules for any signed-in user, and
/// the user endpoints governed by the self-or-admin rule (checked in the
/// handlers against the resolved `AuthUser`).
pub fn authenticated_routes() -> Router<AppState> {
    Router::<AppState>::new()
        // GET/PUT /users/{id}
        .route(
            "/users/{id}",
            get(handlers::get_user).put(handlers::update_user),
        )
        // --- Access Control Catalogue ---
        .route("/roles", get(handlers::list_roles))
        .route("/roles/{id}", get(handlers::get_role))
        .route("/permissions", get(handlers::list_permissions))
        .route("/permissions/{id}", get(handlers::get_permission))
        .route("/modules", get(handlers::list_modules))
        .route("/modules/{id}", get(handlers::get_module))
}
