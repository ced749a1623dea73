//! Maintenance endpoints: orphaned thumbnails and registrations whose file
//! is gone.

use axum::{body::Bytes, extract::State, routing::post, Json, Router};
use galleryd_common::{paths::absolute_path, Error, Result};
use serde::{Deserialize, Serialize};

use super::{AppContext, AppError};
use crate::ingest::IngestEvent;
use crate::thumbnails::CleanupReport;
use crate::watch::missing_records;

pub fn maintenance_routes() -> Router<AppContext> {
    Router::new()
        .route("/maintenance/thumbnails", post(cleanup_thumbnails))
        .route("/maintenance/registrations", post(cleanup_registrations))
}

#[derive(Debug, Default, Deserialize)]
pub struct CleanupRequest {
    #[serde(default)]
    pub dry_run: bool,
}

impl CleanupRequest {
    /// An empty body runs the cleanup for real.
    fn parse(body: &[u8]) -> Result<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
            .map_err(|e| Error::invalid_input(format!("invalid cleanup request: {e}")))
    }
}

/// POST /api/maintenance/thumbnails
async fn cleanup_thumbnails(
    State(ctx): State<AppContext>,
    body: Bytes,
) -> std::result::Result<Json<CleanupReport>, AppError> {
    let req = CleanupRequest::parse(&body)?;
    let live = ctx.store.live_fingerprints()?;
    let report = ctx.thumbnails.cleanup_orphans(&live, req.dry_run).await?;
    tracing::info!(
        orphaned = report.orphaned,
        removed = report.removed,
        dry_run = report.dry_run,
        "Thumbnail cleanup"
    );
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct RegistrationCleanup {
    /// Live records whose file is missing
    pub orphaned: Vec<String>,
    /// Removals handed to the coordinator
    pub queued: usize,
    pub dry_run: bool,
}

/// POST /api/maintenance/registrations
///
/// Missing files go through the coordinator as removals, so the usual grace
/// window applies before a record is tombstoned.
async fn cleanup_registrations(
    State(ctx): State<AppContext>,
    body: Bytes,
) -> std::result::Result<Json<RegistrationCleanup>, AppError> {
    let req = CleanupRequest::parse(&body)?;
    let orphaned = missing_records(&ctx.root, &ctx.store).await?;

    let mut queued = 0;
    if !req.dry_run {
        for filename in &orphaned {
            let path = absolute_path(&ctx.root, filename);
            ctx.queue.submit(IngestEvent::Removed { path }).await?;
            queued += 1;
        }
    }

    tracing::info!(
        orphaned = orphaned.len(),
        queued,
        dry_run = req.dry_run,
        "Registration cleanup"
    );
    Ok(Json(RegistrationCleanup {
        orphaned,
        queued,
        dry_run: req.dry_run,
    }))
}
