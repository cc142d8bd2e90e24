//! HTTP route definitions

use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{compression::CompressionLayer, cors, cors::CorsLayer, trace::TraceLayer};

use crate::app::AppState;
use crate::http::middleware::{require_auth, AuthenticatedSession};
use crate::util::time::{unix_millis, uptime_secs};
use crate::ws::handler::ws_handler;
use crate::ws::protocol::msg_type;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let allowed_methods = [Method::GET, Method::OPTIONS];
    let allowed_headers = [header::AUTHORIZATION, header::CONTENT_TYPE];

    // CORS configuration - "*" or multiple origins (comma-separated)
    let cors = if state.config.client_origin.trim() == "*" {
        CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let allowed_origins: Vec<header::HeaderValue> = state
            .config
            .client_origin
            .split(',')
            .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(allowed_origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
            .allow_credentials(true)
    };

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/battles/:battle_id/view", get(battle_view_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_battles: usize,
    active_sessions: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_battles: state.battles.active_battles(),
        active_sessions: state.battles.total_participants(),
    })
}

// ============================================================================
// Spectator view endpoint
// ============================================================================

#[derive(Deserialize)]
struct BattleViewQuery {
    /// Channel to sample, defaults to the battle channel
    channel: Option<String>,
    /// Render time in Unix milliseconds, defaults to now
    render_time: Option<f64>,
}

#[derive(Serialize)]
struct BattleViewResponse {
    battle_id: u32,
    channel: String,
    render_time: f64,
    /// Smoothed render-only state; never authoritative
    state: Option<Value>,
}

async fn battle_view_handler(
    State(state): State<AppState>,
    Extension(_session): Extension<AuthenticatedSession>,
    Path(battle_id): Path<u32>,
    Query(query): Query<BattleViewQuery>,
) -> Result<Json<BattleViewResponse>, AppError> {
    let handle = state
        .battles
        .get(battle_id)
        .ok_or_else(|| AppError::NotFound(format!("battle {} not active", battle_id)))?;

    let channel = query
        .channel
        .unwrap_or_else(|| msg_type::BATTLE_UPDATE.to_string());
    let render_time = query.render_time.unwrap_or_else(|| unix_millis() as f64);

    let view = handle.view_at(&channel, render_time);

    Ok(Json(BattleViewResponse {
        battle_id,
        channel,
        render_time,
        state: view.map(Value::Object),
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
