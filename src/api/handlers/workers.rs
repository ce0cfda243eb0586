use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::collections::BTreeMap;
use tracing::{error, warn};

use crate::api::{
    body::{read_json, BodyError},
    state::AppState,
    types::{DeleteWorkerRequest, UpsertWorkerRequest},
};
use crate::error::HatcheryError;
use crate::supervisor::WorkerSummary;

/// Answer for a body that could not be read or parsed; the connection is dropped
fn malformed_body(err: BodyError) -> Response {
    warn!(error = %err, "rejecting request body");
    let (status, text) = match err {
        BodyError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large."),
        _ => (StatusCode::BAD_REQUEST, "Invalid JSON or no data."),
    };
    (status, [(header::CONNECTION, "close")], text).into_response()
}

/// Map a supervisor error onto the plain-text error contract
pub(crate) fn error_response(err: HatcheryError) -> (StatusCode, String) {
    if err.is_validation() {
        return (StatusCode::BAD_REQUEST, err.to_string());
    }
    error!(error = %err, "control-plane request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "500 Internal Server Error".to_string(),
    )
}

/// GET /workers
pub async fn list_workers(State(state): State<AppState>) -> Json<BTreeMap<String, WorkerSummary>> {
    Json(state.supervisor.list_workers().await)
}

/// POST /workers
pub async fn upsert_worker(State(state): State<AppState>, body: Body) -> Response {
    let payload = match read_json(body).await {
        Ok(payload) => payload,
        Err(e) => return malformed_body(e),
    };

    let request = match UpsertWorkerRequest::from_json(&payload) {
        Ok(request) => request,
        Err(e) => return error_response(e).into_response(),
    };

    match state.supervisor.upsert_worker(request.into_spec()).await {
        Ok(()) => "OK".into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// DELETE /workers
pub async fn delete_worker(State(state): State<AppState>, body: Body) -> Response {
    let payload = match read_json(body).await {
        Ok(payload) => payload,
        Err(e) => return malformed_body(e),
    };

    let request = match DeleteWorkerRequest::from_json(&payload) {
        Ok(request) => request,
        Err(e) => return error_response(e).into_response(),
    };

    match state.supervisor.delete_worker(&request.id).await {
        Ok(()) => "OK".into_response(),
        Err(e) => error_response(e).into_response(),
    }
}
