//! Request/response API
//!
//! Routes:
//! - `GET  /api/health`
//! - `GET  /api/matches`
//! - `POST /api/match/create`
//! - `POST /api/match/join`
//! - `GET  /api/match/{session_id}`

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Path, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::game::state::SessionSnapshot;
use crate::lobby::directory::{DirectoryError, SessionDirectory};
use crate::net::protocol::{
    decode, sanitize_display_name, ErrorKind, JoinRequest, MatchRequest, MatchResponse,
    SessionInfo, ValidationError, WireError,
};

const MAX_BODY_BYTES: usize = 16 * 1024;

/// Settings the API needs beyond the directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    /// Base URL clients use for the join handshake, e.g. `https://host:4433`
    pub public_join_url: String,
}

#[derive(Clone)]
struct ApiState {
    directory: Arc<SessionDirectory>,
    settings: Arc<ApiSettings>,
}

/// Failures surfaced as `{"error": {kind, message}}`
#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    /// The body could not be read at all (too large, bad encoding)
    Body(StatusCode, String),
    NotFound(String),
    Unavailable(DirectoryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Validation(e) => (StatusCode::BAD_REQUEST, WireError::from(&e)),
            ApiError::Body(status, message) => {
                (status, WireError::new(ErrorKind::ValidationError, message))
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, WireError::new(ErrorKind::NotFound, message))
            }
            ApiError::Unavailable(e) => (
                StatusCode::SERVICE_UNAVAILABLE,
                WireError::new(ErrorKind::Busy, e.to_string()),
            ),
        };
        (status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        ApiError::Validation(e)
    }
}

/// Match request body. An empty body means all defaults.
struct MatchBody(MatchRequest);

impl<S: Send + Sync> FromRequest<S> for MatchBody {
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::Body(e.status(), e.body_text()))?;

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(MatchBody(MatchRequest::default()));
        }
        Ok(MatchBody(decode(&body)?))
    }
}

/// Build the API router
pub fn router(directory: Arc<SessionDirectory>, settings: ApiSettings) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/matches", get(list_matches))
        .route("/api/match/create", post(create_match))
        .route("/api/match/join", post(join_match))
        .route("/api/match/{session_id}", get(match_detail))
        .fallback(no_such_route)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(ApiState {
            directory,
            settings: Arc::new(settings),
        })
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "sessions": state.directory.len(),
    }))
}

async fn list_matches(State(state): State<ApiState>) -> Json<Vec<SessionInfo>> {
    Json(state.directory.list())
}

async fn create_match(
    State(state): State<ApiState>,
    MatchBody(request): MatchBody,
) -> Result<(StatusCode, Json<MatchResponse>), ApiError> {
    let response = allocate(
        &state,
        request,
        false,
        "Session created. Connect to the join endpoint to play.",
    )?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn join_match(
    State(state): State<ApiState>,
    MatchBody(request): MatchBody,
) -> Result<Json<MatchResponse>, ApiError> {
    let response = allocate(
        &state,
        request,
        true,
        "Session found. Connect to the join endpoint to play.",
    )?;
    Ok(Json(response))
}

async fn match_detail(
    State(state): State<ApiState>,
    Path(raw): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    let id = Uuid::parse_str(&raw).map_err(|_| ValidationError::InvalidParameter {
        name: "session_id",
        value: raw.clone(),
    })?;
    state
        .directory
        .detail(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("session {} not found", id)))
}

async fn no_such_route() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}

/// Create or find a session and mint a participant id for the caller
fn allocate(
    state: &ApiState,
    request: MatchRequest,
    find_existing: bool,
    message: &str,
) -> Result<MatchResponse, ApiError> {
    let name = sanitize_display_name(&request.participant_name)?;

    let target = request.target.unwrap_or(0);
    let allocated = if find_existing {
        state.directory.find_or_create(target)
    } else {
        state.directory.create_new(target)
    };
    let handle = allocated.map_err(|e| {
        warn!("Session allocation failed: {}", e);
        ApiError::Unavailable(e)
    })?;

    let join = JoinRequest {
        session_id: handle.id(),
        participant_id: Uuid::new_v4(),
        name,
    };
    info!(
        session_id = %join.session_id,
        participant_id = %join.participant_id,
        "Allocated session for {}", join.name
    );

    Ok(MatchResponse {
        session_id: join.session_id,
        participant_id: join.participant_id,
        join_endpoint: format!(
            "{}{}",
            state.settings.public_join_url.trim_end_matches('/'),
            join.to_path()
        ),
        message: message.to_string(),
        created_at: Utc::now(),
    })
}

/// Start the API HTTP server
pub async fn start_api_server(
    directory: Arc<SessionDirectory>,
    settings: ApiSettings,
    port: u16,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("API server listening on http://{}/api", addr);
    axum::serve(listener, router(directory, settings)).await?;
    Ok(())
}
