//! Thumbnail serving.

use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use galleryd_common::Error;
use serde_json::json;

use super::{AppContext, AppError};

pub fn thumbnail_routes() -> Router<AppContext> {
    Router::new().route("/thumbnails/*filename", get(serve_thumbnail))
}

/// GET /api/thumbnails/*filename
///
/// JPEG bytes once ready; 202 while generation is still running after
/// `thumbnails.wait_ms`; 422 when generation failed.
async fn serve_thumbnail(
    State(ctx): State<AppContext>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let wait = Duration::from_millis(ctx.config.thumbnails.wait_ms);
    let artifact = match ctx.thumbnails.wait(&filename, wait).await {
        Ok(artifact) => artifact,
        Err(Error::Timeout(_)) => {
            return Ok((
                StatusCode::ACCEPTED,
                [(header::RETRY_AFTER, "1")],
                Json(json!({"filename": filename, "status": "pending"})),
            )
                .into_response())
        }
        Err(e) => return Err(e.into()),
    };

    let bytes = match tokio::fs::read(&artifact.path).await {
        Ok(bytes) => bytes,
        // evicted between the lookup and the read
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            ctx.thumbnails.schedule(&filename, &artifact.fingerprint);
            return Ok((
                StatusCode::ACCEPTED,
                [(header::RETRY_AFTER, "1")],
                Json(json!({"filename": filename, "status": "pending"})),
            )
                .into_response());
        }
        Err(e) => return Err(Error::from(e).into()),
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/jpeg".to_string()),
            (header::ETAG, format!("\"{}\"", artifact.fingerprint)),
            (header::CACHE_CONTROL, "private, max-age=3600".to_string()),
        ],
        Body::from(bytes),
    )
        .into_response())
}
