use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::routes::create_router;
use crate::state::AppState;
use storyloom_core::repository::{create_pool, PostgresDb, PostgresJobStore};
use storyloom_core::{Config, Error, Result};

/// Run the dispatch API until interrupted
pub async fn run(config: Config, host: &str, port: u16) -> Result<()> {
    let addr = SocketAddr::from((
        host.parse::<std::net::IpAddr>()
            .map_err(|e| Error::config(format!("Invalid host: {}", e)))?,
        port,
    ));

    let app_state = create_app_state(&config).await?;
    let app = create_router(app_state);

    info!("Storyloom dispatch API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    info!("Dispatch API stopped");
    Ok(())
}

/// Build process-scoped resources: one pool, one queue client
async fn create_app_state(config: &Config) -> Result<AppState> {
    let database_url = config
        .database
        .url
        .as_deref()
        .ok_or_else(|| Error::config("DATABASE_URL (or POSTGRES_URL) is required"))?;

    let pool = create_pool(database_url, config.database.pool_size).await?;
    run_migrations(&pool).await?;

    let store = Arc::new(PostgresJobStore::new(PostgresDb::new(pool)));
    let queue = storyloom_core::queue::connect(&config.queue).await?;

    Ok(AppState::new(store, queue))
}

async fn run_migrations(pool: &sqlx::Pool<sqlx::Postgres>) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| Error::config(format!("Migration failed: {}", e)))?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Could not listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}
