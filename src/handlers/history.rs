//! History handlers: inspect the log, undo and redo.

use crate::error::AppError;
use crate::extractors::SyncOptions;
use crate::response::success_one_ok;
use crate::state::AppState;
use axum::extract::State;
use axum::response::IntoResponse;

/// GET /history
pub async fn get_history(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let sync = state.sync.lock().await;
    Ok(success_one_ok(sync.history().document()))
}

/// POST /history/undo. `data` is the executed action, or null when there was nothing to undo.
pub async fn post_undo(
    State(state): State<AppState>,
    SyncOptions(opts): SyncOptions,
) -> Result<impl IntoResponse, AppError> {
    let mut sync = state.sync.lock().await;
    let action = sync.undo(opts).await?;
    Ok(success_one_ok(action))
}

/// POST /history/redo
pub async fn post_redo(
    State(state): State<AppState>,
    SyncOptions(opts): SyncOptions,
) -> Result<impl IntoResponse, AppError> {
    let mut sync = state.sync.lock().await;
    let action = sync.redo(opts).await?;
    Ok(success_one_ok(action))
}
