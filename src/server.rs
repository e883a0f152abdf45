//! Read-only HTTP API over the live dataset.
//!
//! Serves the documents the dashboard charts are built from. The handler
//! only ever reads the live collection, so a harvest promoting a new
//! dataset mid-request yields either the old set or the new one.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/BGG/game_info` | Live documents as a JSON array (projected, capped) |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "internal", "message": "..." } }
//! ```
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the dashboard can be
//! hosted separately.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::store::{DocumentStore, SqliteStore};

/// Fields the dashboard reads; everything else stays server-side.
pub const PROJECTION: &[&str] = &[
    "mechanics",
    "categories",
    "publishers",
    "minplayers",
    "designers",
    "stats",
    "minplaytime",
    "maxplaytime",
    "id",
    "yearpublished",
    "maxplayers",
    "name",
];

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn DocumentStore>,
    collection: String,
    result_limit: i64,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, collection: String, result_limit: i64) -> Self {
        Self {
            store,
            collection,
            result_limit,
        }
    }
}

/// Builds the router; split out so tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/BGG/game_info", get(handle_game_info))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// `bgg serve`: binds `[server].bind` and serves until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let state = AppState::new(
        Arc::new(SqliteStore::new(pool)),
        config.store.live_collection.clone(),
        config.server.result_limit,
    );

    let bind_addr = config.server.bind.clone();
    info!(bind = %bind_addr, collection = %config.store.live_collection, "read API listening");
    println!("Read API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /BGG/game_info ============

async fn handle_game_info(State(state): State<AppState>) -> Result<Json<Vec<Value>>, AppError> {
    let docs = state
        .store
        .find(&state.collection, state.result_limit)
        .await
        .map_err(|e| {
            error!(error = %format!("{:#}", e), "failed to read live dataset");
            internal(format!("failed to read dataset: {}", e))
        })?;

    Ok(Json(docs.into_iter().map(project).collect()))
}

/// Keeps only [`PROJECTION`] fields of a stored document.
pub fn project(doc: Value) -> Value {
    match doc {
        Value::Object(mut fields) => {
            let projected: Map<String, Value> = PROJECTION
                .iter()
                .filter_map(|key| fields.remove(*key).map(|v| (key.to_string(), v)))
                .collect();
            Value::Object(projected)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn project_drops_unlisted_fields() {
        let doc = json!({
            "id": 13,
            "name": "Catan",
            "description": "long text",
            "thumbnail": "x.jpg",
            "stats": { "average": 7.1 }
        });
        assert_eq!(
            project(doc),
            json!({ "id": 13, "name": "Catan", "stats": { "average": 7.1 } })
        );
    }
}
