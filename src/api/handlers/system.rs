use axum::{extract::State, http::StatusCode};

use crate::api::{handlers::workers::error_response, state::AppState};

/// GET /ping -- liveness probe
pub async fn ping() -> &'static str {
    "pong"
}

/// GET /ping_redis -- round trip to the remote store
pub async fn ping_remote(
    State(state): State<AppState>,
) -> std::result::Result<String, (StatusCode, String)> {
    state.supervisor.ping_remote().await.map_err(error_response)
}

/// GET /inspector_url
pub async fn inspector_url(State(state): State<AppState>) -> String {
    state.inspector_url.clone().unwrap_or_default()
}

/// GET / -- this supervisor's id
pub async fn identity(State(state): State<AppState>) -> String {
    state.supervisor.id().to_string()
}

/// OPTIONS on any path; CORS headers are added by the router layers
pub async fn preflight() -> StatusCode {
    StatusCode::OK
}
