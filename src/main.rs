use std::sync::Arc;

use rbac_portal::{
    AppState, PostgresRepository, RepositoryState,
    config::{AppConfig, Env},
    create_router,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "rbac_portal=debug,tower_http=info,sqlx=warn";

/// Startup order: configuration, logging, database pool and migrations, then
/// the HTTP server with graceful shutdown.
#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let config = AppConfig::load();
    init_tracing(config.env);

    tracing::info!(env = ?config.env, port = config.port, "rbac-portal starting");

    let pool = connect_database(&config).await;
    let repo: RepositoryState = Arc::new(PostgresRepository::new(pool));

    let addr = format!("0.0.0.0:{}", config.port);
    let app = create_router(AppState { repo, config });

    let listener = TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("FATAL: cannot bind {}: {}", addr, e));
    tracing::info!(%addr, "listening; API docs served at /swagger-ui");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("FATAL: server error");
}

/// Pretty output for local work, JSON lines in production. `RUST_LOG`
/// overrides the default filter.
fn init_tracing(env: Env) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match env {
        Env::Local => registry.with(fmt::layer().pretty()).init(),
        Env::Production => registry.with(fmt::layer().json()).init(),
    }
}

async fn connect_database(config: &AppConfig) -> PgPool {
    // acquire_timeout bounds the wait on an exhausted pool.
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(config.db_acquire_timeout)
        .connect(&config.db_url)
        .await
        .expect("FATAL: Failed to connect to Postgres. Check DATABASE_URL.");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("FATAL: Failed to run database migrations.");
    tracing::info!("database migrations applied");

    pool
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received, draining connections");
}
