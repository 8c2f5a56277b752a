use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Public Router Module
///
/// Endpoints reachable without a session.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Liveness probe for load balancers; never touches the database.
        .route("/health", get(|| async { "ok" }))
        // POST /auth/login
        // Username-or-email and password in, access/refresh token pair out.
        .route("/auth/login", post(handlers::login))
        // POST /auth/refresh
        // Single-use rotation of a stored refresh token.
        .route("/auth/refresh", post(handlers::refresh))
}
