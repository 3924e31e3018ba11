//! Liveness, readiness and build information.

use crate::state::AppState;
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    status: &'static str,
    dialect: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoBody {
    name: &'static str,
    version: &'static str,
    dialect: &'static str,
    entities: usize,
    undo_depth: usize,
    redo_depth: usize,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// 503 while the database does not answer.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyBody>) {
    let dialect = state.dialect.kind().name();
    match state.dialect.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ReadyBody {
                status: "ok",
                dialect,
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, dialect, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadyBody {
                    status: "degraded",
                    dialect,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn info(State(state): State<AppState>) -> Json<InfoBody> {
    let sync = state.sync.lock().await;
    Json(InfoBody {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        dialect: state.dialect.kind().name(),
        entities: sync.entities().entities().values().filter(|e| !e.is_junction()).count(),
        undo_depth: sync.history().undo_stack().len(),
        redo_depth: sync.history().redo_stack().len(),
    })
}

/// GET /health and GET /version; needs no state.
pub fn common_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
}

/// [`common_routes`] plus GET /ready (database ping) and GET /info (model and log summary).
pub fn common_routes_with_ready(state: AppState) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/info", get(info))
        .with_state(state)
        .merge(common_routes())
}
