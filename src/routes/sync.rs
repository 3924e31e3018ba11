//! Admin routes: schema diff, sync in either direction, history.

use crate::handlers::{get_diff, get_history, post_redo, post_sync_database, post_sync_entities, post_undo};
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;

/// Bodies are not read by these routes; anything larger than this is rejected.
const BODY_LIMIT: usize = 64 * 1024;

pub fn sync_routes(state: AppState) -> Router {
    Router::new()
        .route("/sync/diff", get(get_diff))
        .route("/sync/entities", post(post_sync_entities))
        .route("/sync/database", post(post_sync_database))
        .route("/history", get(get_history))
        .route("/history/undo", post(post_undo))
        .route("/history/redo", post(post_redo))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .with_state(state)
}
