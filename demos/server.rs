//! Example server: reads `SyncConfig` from the environment, restores the entity model and
//! history from the project directory, and mounts the common and admin sync routes.

use architect_sync::{common_routes_with_ready, sync_routes, AppState, SyncConfig, Synchronizer};
use axum::Router;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("architect_sync=info".parse()?))
        .init();

    let config = SyncConfig::from_env()?;
    let sync = Synchronizer::open(&config).await?;
    let dialect = sync.dialect()?.clone();

    let diff = sync.diff().await?;
    if !diff.is_empty() {
        tracing::warn!(items = diff.len(), "model and database differ; see GET /sync/diff");
    }

    let state = AppState::new(sync, dialect);
    let app = Router::new()
        .merge(common_routes_with_ready(state.clone()))
        .nest("/api/v1", sync_routes(state));

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}
