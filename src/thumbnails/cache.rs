//! Lazy, content-addressed thumbnail derivation.
//!
//! Jobs are keyed by `(filename, fingerprint)`. A second request for a pair
//! that is already being generated attaches to the running job instead of
//! starting another one. Completion is written back through the store with
//! the job's fingerprint as a guard; if the record moved on in the meantime
//! the fresh artifact is thrown away.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use galleryd_common::paths::absolute_path;
use galleryd_common::{Error, Fingerprint, Result, ThumbnailStatus};
use galleryd_db::ThumbnailUpdate;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};

use super::storage::{StorageStats, ThumbnailStorage};
use crate::store::RegistrationStore;

/// A generated artifact bound to the fingerprint it was made from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThumbnailArtifact {
    pub fingerprint: Fingerprint,
    pub size: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum JobState {
    Running,
    Ready(PathBuf),
    Failed(String),
    /// The record's fingerprint changed while the job ran
    Superseded,
}

type JobKey = (String, Fingerprint);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub artifacts: u64,
    pub bytes: u64,
    pub in_flight: usize,
    pub workers: usize,
    /// Artifacts encoded since startup
    pub generated: u64,
}

/// Result of an orphan sweep over the artifact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub orphaned: usize,
    pub removed: usize,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct ThumbnailCache {
    storage: Arc<ThumbnailStorage>,
    store: Arc<RegistrationStore>,
    root: PathBuf,
    workers: usize,
    permits: Arc<Semaphore>,
    inflight: Arc<DashMap<JobKey, watch::Receiver<JobState>>>,
    generated: Arc<AtomicU64>,
}

impl ThumbnailCache {
    pub fn new(
        storage: ThumbnailStorage,
        store: Arc<RegistrationStore>,
        root: PathBuf,
        workers: usize,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            storage: Arc::new(storage),
            store,
            root,
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            inflight: Arc::new(DashMap::new()),
            generated: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn storage(&self) -> &ThumbnailStorage {
        &self.storage
    }

    /// Current thumbnail status of `filename`, scheduling generation unless a
    /// valid artifact for its current fingerprint already exists.
    pub async fn ensure(&self, filename: &str) -> Result<ThumbnailStatus> {
        let record = self.store.require(filename)?;
        if record.thumbnail_status == ThumbnailStatus::Ready
            && is_file(&self.storage.artifact_path(&record.fingerprint)).await
        {
            return Ok(ThumbnailStatus::Ready);
        }
        self.schedule(&record.filename, &record.fingerprint);
        Ok(ThumbnailStatus::Pending)
    }

    /// Start a job for this pair, or attach to the one already running.
    pub fn schedule(&self, filename: &str, fingerprint: &Fingerprint) {
        self.job(filename, fingerprint);
    }

    fn job(&self, filename: &str, fingerprint: &Fingerprint) -> watch::Receiver<JobState> {
        let key = (filename.to_string(), fingerprint.clone());
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(JobState::Running);
                slot.insert(rx.clone());
                let cache = self.clone();
                tokio::spawn(async move { cache.run(key, tx).await });
                rx
            }
        }
    }

    async fn run(self, key: JobKey, tx: watch::Sender<JobState>) {
        let (filename, fingerprint) = &key;
        let state = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => match self.current_artifact(filename, fingerprint).await {
                Some(path) => JobState::Ready(path),
                None => self.generate(filename, fingerprint).await,
            },
            Err(_) => JobState::Failed("thumbnail workers shut down".to_string()),
        };
        // the slot stays taken until the result is out, so a late request
        // attaches to this job instead of starting another
        let _ = tx.send(state);
        self.inflight.remove(&key);
    }

    /// The artifact of a record that is already marked ready for this
    /// fingerprint.
    async fn current_artifact(&self, filename: &str, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let record = self.store.get(filename).ok().flatten()?;
        if record.fingerprint != *fingerprint || record.thumbnail_status != ThumbnailStatus::Ready {
            return None;
        }
        let path = self.storage.artifact_path(fingerprint);
        is_file(&path).await.then_some(path)
    }

    async fn generate(&self, filename: &str, fingerprint: &Fingerprint) -> JobState {
        let source = absolute_path(&self.root, filename);
        let storage = self.storage.clone();
        let fp = fingerprint.clone();
        let generated = tokio::task::spawn_blocking(move || storage.generate(&source, &fp))
            .await
            .unwrap_or_else(|e| Err(Error::internal(format!("thumbnail task panicked: {e}"))));

        match generated {
            Ok(path) => {
                self.generated.fetch_add(1, Ordering::Relaxed);
                let update = ThumbnailUpdate::Ready {
                    path: path.to_string_lossy().into_owned(),
                };
                match self.store.mark_thumbnail(filename, fingerprint, update) {
                    Ok(true) => {
                        tracing::debug!(filename, fingerprint = %fingerprint, "Thumbnail ready");
                        JobState::Ready(path)
                    }
                    Ok(false) => {
                        tracing::debug!(filename, fingerprint = %fingerprint, "Thumbnail superseded, discarding");
                        self.evict(fingerprint).await;
                        JobState::Superseded
                    }
                    Err(e) => {
                        tracing::error!(filename, "Failed to record thumbnail: {}", e);
                        JobState::Failed(e.to_string())
                    }
                }
            }
            Err(e) => {
                let message = match e {
                    Error::ThumbnailFailed(msg) => msg,
                    other => other.to_string(),
                };
                tracing::warn!(filename, fingerprint = %fingerprint, "Thumbnail generation failed: {}", message);
                let update = ThumbnailUpdate::Failed {
                    error: message.clone(),
                };
                if let Err(e) = self.store.mark_thumbnail(filename, fingerprint, update) {
                    tracing::error!(filename, "Failed to record thumbnail failure: {}", e);
                }
                JobState::Failed(message)
            }
        }
    }

    /// Wait up to `timeout` for a servable artifact of `filename`.
    ///
    /// Ready records return at once. Anything else is (re)scheduled and
    /// awaited; a job still running at the deadline is [`Error::Timeout`].
    pub async fn wait(&self, filename: &str, timeout: Duration) -> Result<ThumbnailArtifact> {
        let record = self.store.require(filename)?;
        let artifact = ThumbnailArtifact {
            fingerprint: record.fingerprint.clone(),
            size: self.storage.size(),
            path: self.storage.artifact_path(&record.fingerprint),
        };
        if record.thumbnail_status == ThumbnailStatus::Ready && is_file(&artifact.path).await {
            return Ok(artifact);
        }

        let mut rx = self.job(&record.filename, &record.fingerprint);
        let finished = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s != JobState::Running)
                .await
                .map(|state| (*state).clone())
        })
        .await;

        match finished {
            Err(_) => Err(Error::timeout(format!("thumbnail for {filename} still pending"))),
            Ok(Err(_)) => Err(Error::internal("thumbnail job vanished")),
            Ok(Ok(JobState::Ready(path))) => Ok(ThumbnailArtifact { path, ..artifact }),
            Ok(Ok(JobState::Failed(msg))) => Err(Error::thumbnail(msg)),
            Ok(Ok(JobState::Superseded | JobState::Running)) => Err(Error::timeout(format!(
                "{filename} changed while its thumbnail was generated"
            ))),
        }
    }

    /// Delete the artifacts of a fingerprint that no record points at anymore.
    pub async fn evict(&self, fingerprint: &Fingerprint) {
        let storage = self.storage.clone();
        let fp = fingerprint.clone();
        let removed = tokio::task::spawn_blocking(move || storage.remove(&fp))
            .await
            .unwrap_or_else(|e| Err(Error::internal(format!("evict task panicked: {e}"))));
        match removed {
            Ok(0) => {}
            Ok(n) => tracing::debug!(fingerprint = %fingerprint, removed = n, "Evicted thumbnails"),
            Err(e) => tracing::warn!(fingerprint = %fingerprint, "Failed to evict thumbnails: {}", e),
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let storage = self.storage.clone();
        let StorageStats { artifacts, bytes } = tokio::task::spawn_blocking(move || storage.stats())
            .await
            .unwrap_or_default();
        CacheStats {
            artifacts,
            bytes,
            in_flight: self.inflight.len(),
            workers: self.workers,
            generated: self.generated.load(Ordering::Relaxed),
        }
    }

    /// Remove artifacts not referenced by any live record. With `dry_run`
    /// they are only counted.
    pub async fn cleanup_orphans(&self, live: &[Fingerprint], dry_run: bool) -> Result<CleanupReport> {
        let live: HashSet<Fingerprint> = live.iter().cloned().collect();
        let storage = self.storage.clone();
        let report = tokio::task::spawn_blocking(move || -> Result<CleanupReport> {
            if dry_run {
                let orphaned = storage.orphans(&live).len();
                return Ok(CleanupReport { orphaned, removed: 0, dry_run });
            }
            let removed = storage.cleanup_orphans(&live)?;
            Ok(CleanupReport { orphaned: removed, removed, dry_run })
        })
        .await
        .map_err(|e| Error::internal(format!("cleanup task panicked: {e}")))??;
        if report.removed > 0 {
            tracing::info!(removed = report.removed, "Removed orphaned thumbnails");
        }
        Ok(report)
    }

    /// Requeue every record still waiting for a thumbnail.
    pub fn reschedule_pending(&self) -> Result<usize> {
        let pending = self.store.pending_thumbnails()?;
        for (filename, fingerprint) in &pending {
            self.schedule(filename, fingerprint);
        }
        Ok(pending.len())
    }
}

async fn is_file(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}
