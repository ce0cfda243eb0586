//! Streamed JSON request bodies
//!
//! Bodies are consumed chunk by chunk and concatenated until the stream ends,
//! then parsed exactly once. Reassembly stops once the body outgrows
//! [`MAX_BODY_BYTES`].

use axum::body::Body;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;

/// Largest control-plane request body accepted
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("request body aborted: {0}")]
    Aborted(#[from] axum::Error),

    #[error("invalid JSON or no data: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Reassemble a streamed body and parse it as one JSON document
pub async fn read_json(body: Body) -> Result<Value, BodyError> {
    read_json_limited(body, MAX_BODY_BYTES).await
}

pub async fn read_json_limited(body: Body, limit: usize) -> Result<Value, BodyError> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buffer.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge { limit });
        }
        buffer.extend_from_slice(&chunk);
    }

    Ok(serde_json::from_slice(&buffer)?)
}
