//! The single consumer of the ingest queue.
//!
//! Events are handled strictly one at a time in arrival order, so whichever
//! discovery of a file is dequeued first creates its record and every later
//! one folds in as a duplicate or an update. The removal grace sweep runs on
//! a tick inside the same loop and is serialized with events.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use galleryd_common::paths::{absolute_path, relative_filename};
use galleryd_common::{Error, HookFailure, Metadata, Result, ThumbnailStatus};
use galleryd_db::ImageRecord;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::fingerprint;
use super::queue::IngestReceiver;
use super::{Discovery, IngestEvent, IngestOutcome};
use crate::config::IngestConfig;
use crate::hooks::{HookInput, HookPipeline, PipelineOutput};
use crate::store::RegistrationStore;
use crate::thumbnails::ThumbnailCache;

/// Counts from one grace sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub restored: usize,
    pub tombstoned: usize,
    pub purged: usize,
}

pub struct IngestionCoordinator {
    root: PathBuf,
    store: Arc<RegistrationStore>,
    pipeline: HookPipeline,
    thumbnails: ThumbnailCache,
    removal_grace: chrono::Duration,
    tombstone_retention: chrono::Duration,
    sweep_interval: Duration,
}

impl IngestionCoordinator {
    pub fn new(
        config: &IngestConfig,
        root: PathBuf,
        store: Arc<RegistrationStore>,
        pipeline: HookPipeline,
        thumbnails: ThumbnailCache,
    ) -> Self {
        Self {
            root,
            store,
            pipeline,
            thumbnails,
            removal_grace: seconds(config.removal_grace_secs),
            tombstone_retention: seconds(config.tombstone_retention_secs),
            sweep_interval: Duration::from_millis(config.sweep_interval_ms.max(1)),
        }
    }

    /// Drain the queue until it closes or `cancel` fires.
    ///
    /// Only fatal errors (store corruption) end the loop with `Err`.
    pub async fn run(self, mut receiver: IngestReceiver, cancel: CancellationToken) -> Result<()> {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(root = %self.root.display(), "Ingestion coordinator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = receiver.rx.recv() => {
                    let Some(envelope) = envelope else { break };
                    match self.process(envelope.event).await {
                        Ok(outcome) => {
                            let _ = envelope.reply.send(outcome);
                        }
                        Err(e) => {
                            let _ = envelope.reply.send(IngestOutcome::Failed(e.to_string()));
                            tracing::error!("Ingestion stopped on fatal error: {}", e);
                            return Err(e);
                        }
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        if e.is_fatal() {
                            tracing::error!("Ingestion stopped on fatal error: {}", e);
                            return Err(e);
                        }
                        tracing::warn!("Removal sweep failed: {}", e);
                    }
                }
            }
        }

        tracing::info!("Ingestion coordinator stopped");
        Ok(())
    }

    /// Handle one event. Per-item problems become [`IngestOutcome::Failed`];
    /// only fatal errors are returned as `Err`.
    pub async fn process(&self, event: IngestEvent) -> Result<IngestOutcome> {
        let result = match &event {
            IngestEvent::Discovered(discovery) => self.discovered(discovery).await,
            IngestEvent::Removed { path } => self.removed(path).await,
        };
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_fatal() => Err(e),
            Err(Error::NotFound(msg)) => Ok(IngestOutcome::Failed(msg)),
            Err(e) => {
                tracing::warn!(event = ?event, "Ingestion failed: {}", e);
                Ok(IngestOutcome::Failed(e.to_string()))
            }
        }
    }

    async fn discovered(&self, discovery: &Discovery) -> Result<IngestOutcome> {
        let Some(filename) = relative_filename(&self.root, &discovery.path) else {
            return Ok(IngestOutcome::Failed("path outside watched root".to_string()));
        };
        let meta = fingerprint::stat_file(&discovery.path).await?;
        let fp = fingerprint::from_metadata(&meta, &filename);

        let existing = self.store.get(&filename)?;
        match existing {
            Some(record) if record.fingerprint == fp => {
                if record.is_pending_removal() {
                    self.store.clear_missing(&filename)?;
                }
                if record.job_id.is_none() {
                    if let Some(job_id) = &discovery.job_id {
                        self.store.attach_job(&filename, job_id)?;
                    }
                }
                tracing::debug!(filename = %filename, source = %discovery.source, "Duplicate discovery");
                Ok(IngestOutcome::Duplicate)
            }
            Some(record) => {
                let output = self.run_hooks(discovery, record.metadata.clone()).await;
                let old_fingerprint = record.fingerprint.clone();

                let mut updated = record;
                updated.fingerprint = fp.clone();
                updated.metadata = output.metadata;
                updated.hook_failures = failures_of(output.failures, output.skipped);
                updated.thumbnail_status = ThumbnailStatus::Pending;
                updated.thumbnail_path = None;
                updated.thumbnail_error = None;
                updated.missing_since = None;
                if updated.job_id.is_none() {
                    updated.job_id = discovery.job_id.clone();
                }
                updated.updated_at = Utc::now();

                self.store.upsert(&updated)?;
                self.thumbnails.evict(&old_fingerprint).await;
                self.thumbnails.schedule(&filename, &fp);
                tracing::info!(filename = %filename, fingerprint = %fp, "Image content changed");
                Ok(IngestOutcome::Updated)
            }
            None => {
                let output = self.run_hooks(discovery, Metadata::new()).await;

                let mut record = ImageRecord::new(&filename, discovery.source, fp.clone(), Utc::now());
                record.job_id = discovery.job_id.clone();
                record.metadata = output.metadata;
                record.hook_failures = failures_of(output.failures, output.skipped);

                self.store.upsert(&record)?;
                self.thumbnails.schedule(&filename, &fp);
                tracing::info!(
                    filename = %filename,
                    source = %discovery.source,
                    job_id = ?discovery.job_id,
                    "Registered image"
                );
                Ok(IngestOutcome::Created)
            }
        }
    }

    async fn run_hooks(&self, discovery: &Discovery, seed: Metadata) -> PipelineOutput {
        let input = HookInput::new(&discovery.path, discovery.hints.clone());
        self.pipeline.run(&input, seed).await
    }

    async fn removed(&self, path: &Path) -> Result<IngestOutcome> {
        let Some(filename) = relative_filename(&self.root, path) else {
            return Ok(IngestOutcome::Ignored);
        };
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(IngestOutcome::Ignored);
        }

        let now = Utc::now();
        if let Some(record) = self.store.get(&filename)? {
            if !record.is_pending_removal() {
                self.store.mark_missing(&filename, now)?;
                tracing::info!(filename = %filename, "Image missing, removal pending");
            }
            return Ok(IngestOutcome::PendingRemoval);
        }

        // a removed directory takes every record below it along
        let prefix = format!("{filename}/");
        let mut marked = 0;
        for child in self.store.live_filenames()? {
            if child.starts_with(&prefix) && self.store.mark_missing(&child, now)? {
                marked += 1;
            }
        }
        if marked > 0 {
            tracing::info!(directory = %filename, marked, "Directory removed, removals pending");
            return Ok(IngestOutcome::PendingRemoval);
        }
        Ok(IngestOutcome::Ignored)
    }

    /// Settle the grace window of every missing record as of `now`, then
    /// purge expired tombstones.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for (filename, missing_since) in self.store.pending_removals()? {
            let present = tokio::fs::metadata(absolute_path(&self.root, &filename))
                .await
                .is_ok_and(|meta| meta.is_file());
            if present {
                if self.store.clear_missing(&filename)? {
                    tracing::debug!(filename = %filename, "File reappeared");
                    report.restored += 1;
                }
                continue;
            }
            if now - missing_since < self.removal_grace {
                continue;
            }
            if let Some(record) = self.store.tombstone(&filename)? {
                self.thumbnails.evict(&record.fingerprint).await;
                tracing::info!(filename = %filename, "Image removed");
                report.tombstoned += 1;
            }
        }

        report.purged = self.store.purge_tombstones(now - self.tombstone_retention)?;
        if report.purged > 0 {
            tracing::debug!(purged = report.purged, "Purged old tombstones");
        }
        Ok(report)
    }
}

const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 3600;

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

fn failures_of(mut failures: Vec<HookFailure>, skipped: Vec<String>) -> Vec<HookFailure> {
    failures.extend(skipped.into_iter().map(|hook| HookFailure {
        hook,
        error: "skipped: hook budget exhausted".to_string(),
    }));
    failures
}
