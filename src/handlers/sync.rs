//! Sync handlers: report the diff, or apply it in one direction.

use crate::error::AppError;
use crate::extractors::SyncOptions;
use crate::response::{success_many, success_one_ok};
use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;

/// GET /sync/diff
pub async fn get_diff(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let sync = state.sync.lock().await;
    let diff = sync.diff().await?;
    Ok(success_one_ok(diff))
}

/// POST /sync/entities: the model takes the database's shape.
pub async fn post_sync_entities(
    State(state): State<AppState>,
    SyncOptions(opts): SyncOptions,
) -> Result<impl IntoResponse, AppError> {
    let mut sync = state.sync.lock().await;
    let diff = sync.diff().await?;
    let executed = sync.entities_from_database_with(&diff, opts.record).await?;
    Ok(success_many(executed))
}

/// POST /sync/database: the database takes the model's shape.
pub async fn post_sync_database(
    State(state): State<AppState>,
    SyncOptions(opts): SyncOptions,
) -> Result<impl IntoResponse, AppError> {
    let mut sync = state.sync.lock().await;
    let diff = sync.diff().await?;
    let executed = sync.database_from_entities_with(&diff, opts.record).await?;
    Ok(success_many(executed))
}
