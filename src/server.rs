//! HTTP tool server.
//!
//! Exposes the [`ToolRegistry`] over JSON HTTP, plus an MCP Streamable HTTP
//! endpoint for MCP clients.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/tools/list` | List all registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call a tool by name |
//! | `GET`  | `/health` | Health check (version and circuit state) |
//! | `*`    | `/mcp` | MCP JSON-RPC over Streamable HTTP |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "missing required parameter: query" } }
//! ```
//!
//! | Error | Code | Status |
//! |-------|------|--------|
//! | validation | `bad_request` | 400 |
//! | note or tool missing | `not_found` | 404 |
//! | vault denied access | `forbidden` | 403 |
//! | request or vault timeout | `timeout` | 408 |
//! | cancelled | `cancelled` | 499 |
//! | circuit open | `backend_unavailable` | 503 |
//! | vault unreachable or bad status | `bad_gateway` | 502 |
//! | anything else | `tool_error` | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::circuit::CircuitState;
use crate::engine::Engine;
use crate::error::VaultError;
use crate::mcp::McpBridge;
use crate::traits::{ToolInfo, ToolRegistry};

/// Shared state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    tools: Arc<ToolRegistry>,
}

/// Build the router without binding. Used by [`run_server`] and tests.
pub fn router(engine: Arc<Engine>, tools: Arc<ToolRegistry>) -> Router {
    let bridge = McpBridge::new(engine.clone(), tools.clone());
    let mcp = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .with_state(AppState { engine, tools })
        .nest_service("/mcp", mcp)
        .layer(cors)
}

/// Serve on `[server].bind` until the engine shuts down.
pub async fn run_server(engine: Arc<Engine>, tools: Arc<ToolRegistry>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    for t in tools.tools() {
        tracing::info!(tool = t.name(), read_only = t.read_only(), "tool registered");
    }

    let sweeper = engine.spawn_sweeper();
    let app = router(engine.clone(), tools);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "tool server listening");

    let shutdown_engine = engine.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            shutdown_engine.shutdown();
        })
        .await?;

    sweeper.abort();
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

/// A [`VaultError`] rendered as an HTTP error envelope.
pub struct AppError(VaultError);

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        AppError(err)
    }
}

/// Status code and envelope code for an error.
pub fn classify(err: &VaultError) -> (StatusCode, &'static str) {
    match err {
        VaultError::Validation(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        VaultError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        VaultError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
        VaultError::Timeout { .. } => (StatusCode::REQUEST_TIMEOUT, "timeout"),
        VaultError::Cancelled => (
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            "cancelled",
        ),
        VaultError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable"),
        VaultError::Transport { .. } | VaultError::Status { .. } => {
            (StatusCode::BAD_GATEWAY, "bad_gateway")
        }
        VaultError::Decode { .. } | VaultError::BudgetExceeded { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "tool_error")
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self.0);
        let body = ErrorBody {
            error: ErrorDetail {
                code,
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    circuit: CircuitState,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        circuit: state.engine.breaker().state(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.tools.infos(),
    })
}

// ============ POST /tools/{name} ============

/// Validate and run a tool. The result is wrapped as `{ "result": ... }`.
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = state
        .tools
        .dispatch(&state.engine, &name, params)
        .await
        .map_err(|e| {
            tracing::debug!(tool = %name, error = %e, "tool call failed");
            AppError(e)
        })?;
    Ok(Json(serde_json::json!({ "result": result })))
}
