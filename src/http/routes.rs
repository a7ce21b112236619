//! HTTP route definitions

use std::time::Duration;

use axum::{
    extract::{Extension, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::info;
use uuid::Uuid;

use crate::app::AppState;
use crate::http::middleware::{require_auth, AuthenticatedUser};
use crate::matchmaking::QueueError;
use crate::store::{with_timeout, StoreError, Wallet};
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::GameMode;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/leaderboard", get(leaderboard_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/matchmaking/join", post(matchmaking_join_handler))
        .route("/matchmaking/cancel", post(matchmaking_cancel_handler))
        .route("/profile/nickname", post(nickname_handler))
        .route("/profile/wallet", get(wallet_handler))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
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
    active_matches: usize,
    active_players: usize,
    connected_sessions: usize,
    queue_size: usize,
    open_rooms: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_matches: state.match_registry.active_matches(),
        active_players: state.match_registry.total_players(),
        connected_sessions: state.sessions.connected_count(),
        queue_size: state.matchmaking.total_queued(),
        open_rooms: state.rooms.room_count(),
    })
}

// ============================================================================
// Matchmaking endpoints
// ============================================================================

#[derive(Deserialize)]
struct JoinMatchRequest {
    mode: GameMode,
}

#[derive(Serialize)]
struct JoinMatchResponse {
    status: &'static str,
    mode: GameMode,
    queue_size: usize,
    ws_url: String,
}

async fn matchmaking_join_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(req): Json<JoinMatchRequest>,
) -> Result<Json<JoinMatchResponse>, AppError> {
    let display_name = state
        .sessions
        .display_name(auth.user_id)
        .ok_or(AppError::from(QueueError::NotConnected))?;

    let queue_size = state
        .matchmaking
        .enqueue(auth.user_id, display_name, req.mode)
        .await?;

    let ws_url = format!(
        "{}/ws",
        state
            .config
            .public_base_url
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    );

    Ok(Json(JoinMatchResponse {
        status: "queued",
        mode: req.mode,
        queue_size,
        ws_url,
    }))
}

#[derive(Serialize)]
struct CancelResponse {
    removed: bool,
}

async fn matchmaking_cancel_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        removed: state.matchmaking.dequeue(auth.user_id),
    })
}

// ============================================================================
// Leaderboard
// ============================================================================

#[derive(Serialize)]
struct LeaderboardEntry {
    rank: usize,
    user_id: Uuid,
    nickname: Option<String>,
    ranked_points: i64,
}

/// Top profiles by ranked points. Only the first `leaderboard_scan_limit`
/// documents are read, so ranks are approximate beyond that window.
async fn leaderboard_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaderboardEntry>>, AppError> {
    let tuning = &state.config.tuning;
    let profiles = with_timeout(
        tuning.store_timeout,
        state.store.top_ranked(tuning.leaderboard_scan_limit),
    )
    .await?;

    Ok(Json(
        profiles
            .into_iter()
            .enumerate()
            .map(|(i, p)| LeaderboardEntry {
                rank: i + 1,
                user_id: p.id,
                nickname: p.nickname,
                ranked_points: p.ranked_points,
            })
            .collect(),
    ))
}

// ============================================================================
// Profile endpoints
// ============================================================================

#[derive(Deserialize)]
struct NicknameRequest {
    nickname: String,
}

#[derive(Serialize)]
struct NicknameResponse {
    nickname: String,
}

pub fn validate_nickname(raw: &str) -> Result<&str, AppError> {
    let nickname = raw.trim();
    let len = nickname.chars().count();
    if !(3..=16).contains(&len) {
        return Err(AppError::BadRequest(
            "Nickname must be 3 to 16 characters".to_string(),
        ));
    }
    if !nickname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(AppError::BadRequest(
            "Nickname may only contain letters, digits and underscores".to_string(),
        ));
    }
    Ok(nickname)
}

async fn nickname_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
    Json(req): Json<NicknameRequest>,
) -> Result<Json<NicknameResponse>, AppError> {
    let nickname = validate_nickname(&req.nickname)?;
    with_timeout(
        state.config.tuning.store_timeout,
        state.store.set_nickname(auth.user_id, nickname),
    )
    .await?;
    state.sessions.set_display_name(auth.user_id, nickname);

    info!(identity = %auth.user_id, nickname, "Nickname updated");
    Ok(Json(NicknameResponse {
        nickname: nickname.to_string(),
    }))
}

async fn wallet_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedUser>,
) -> Result<Json<Wallet>, AppError> {
    let wallet = with_timeout(
        state.config.tuning.store_timeout,
        state.store.wallet(auth.user_id),
    )
    .await?;
    Ok(Json(wallet))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Profile store unavailable")]
    Unavailable(#[from] StoreError),
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::AlreadyQueued(_) | QueueError::InMatch => AppError::Conflict(e.to_string()),
            QueueError::NotQueueable(_) | QueueError::NotConnected => {
                AppError::BadRequest(e.to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable(e) => {
                tracing::warn!(error = %e, "Profile store call failed");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        let message = match &self {
            AppError::BadRequest(msg) | AppError::Conflict(msg) => msg.clone(),
            AppError::Unavailable(_) => self.to_string(),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
