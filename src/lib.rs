use std::any::Any;

use axum::{
    Router,
    extract::{FromRef, Request},
    http::HeaderName,
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any as AnyOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pagination;
pub mod query;
pub mod repository;
pub mod response;
pub mod tx;

// Routing segregation (Public, Authenticated, Admin).
pub mod routes;
use auth::AuthUser;
use routes::{admin, authenticated, public};

// --- Public Re-exports ---

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use repository::{PostgresRepository, RepositoryState};

/// Prefix every API route is nested under.
pub const API_PREFIX: &str = "/api/v1";

/// ApiDoc
///
/// OpenAPI document assembled from the `#[utoipa::path]` handlers and the
/// `ToSchema` models. Served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::login, handlers::refresh,
        handlers::list_users, handlers::get_user, handlers::create_user, handlers::update_user,
        handlers::reset_password, handlers::delete_user,
        handlers::list_roles, handlers::get_role, handlers::create_role, handlers::update_role,
        handlers::delete_role,
        handlers::list_permissions, handlers::get_permission,
        handlers::list_modules, handlers::get_module, handlers::create_module,
        handlers::update_module, handlers::delete_module
    ),
    components(
        schemas(
            models::LoginInput, models::RefreshInput, models::TokenPair,
            models::UserList, models::UserDetail, models::CreateUserInput,
            models::UpdateUserInput, models::ResetPasswordInput,
            models::RoleList, models::RoleDetail, models::RoleInput,
            models::PermissionList, models::PermissionDetail,
            models::ModuleList, models::ModuleDetail, models::ModuleInput,
            error::FieldError, pagination::PaginationMeta, response::Meta,
        )
    ),
    tags(
        (name = "rbac-portal", description = "User, role and permission management API")
    )
)]
pub struct ApiDoc;

/// AppState
///
/// The single shared container handed to every request: the persistence
/// layer and the immutable configuration.
#[derive(Clone)]
pub struct AppState {
    pub repo: RepositoryState,
    pub config: AppConfig,
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// auth_middleware
///
/// Requires a resolvable `AuthUser`; the extractor's rejection (401 envelope)
/// short-circuits the request before the handler runs.
async fn auth_middleware(_auth_user: AuthUser, request: Request, next: Next) -> Response {
    next.run(request).await
}

/// admin_middleware
///
/// Authentication plus the admin-role check for the admin route module.
async fn admin_middleware(
    auth_user: AuthUser,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    auth_user.require_admin()?;
    Ok(next.run(request).await)
}

/// Converts a handler panic into the standard 500 envelope.
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic payload");
    tracing::error!(location = "router.catch_panic", error = %detail, "handler panicked");
    AppError::PanicRecovered.into_response()
}

/// create_router
///
/// Assembles the routing tree under [`API_PREFIX`], applies the access-level
/// layers per route module, then the observability stack around everything.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(AnyOrigin)
        .allow_origin(AnyOrigin)
        .allow_headers(AnyOrigin);

    let x_request_id = HeaderName::from_static("x-request-id");

    let api = Router::new()
        .merge(public::public_routes())
        .merge(
            authenticated::authenticated_routes().route_layer(middleware::from_fn_with_state(
                state.clone(),
                auth_middleware,
            )),
        )
        .merge(
            admin::admin_routes().route_layer(middleware::from_fn_with_state(
                state.clone(),
                admin_middleware,
            )),
        );

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest(API_PREFIX, api)
        .fallback(|| async { AppError::NotFound("Route".to_string()) })
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id))
                .layer(CatchPanicLayer::custom(panic_response)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span for every request, carrying the `x-request-id` so all log lines of
/// one request correlate.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
