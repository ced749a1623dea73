//! Generation event ingestion endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use galleryd_common::Error;
use serde_json::json;

use super::auth::{verify_event_signature, SIGNATURE_HEADER};
use super::{AppContext, AppError};
use crate::ingest::GenerationEvent;

pub fn event_routes() -> Router<AppContext> {
    Router::new().route("/events", post(receive_event))
}

/// POST /api/events
///
/// The body is taken raw so the signature covers exactly what was sent.
async fn receive_event(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    if let Some(ref secret) = ctx.config.server.event_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_event_signature(secret, &body, signature) {
            tracing::warn!("Generation event signature verification failed");
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid signature", "code": "unauthorized"})),
            )
                .into_response());
        }
    }

    let event: GenerationEvent = serde_json::from_slice(&body)
        .map_err(|e| Error::invalid_payload(format!("malformed event: {e}")))?;
    let response = ctx.receiver.receive(event).await?;

    if response.saturated() {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            Json(response),
        )
            .into_response());
    }
    Ok(Json(response).into_response())
}
