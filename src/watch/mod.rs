//! Directory watching and the startup scan.

pub mod settle;

pub use settle::{RetryDecision, SettleTracker};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use galleryd_common::paths::{has_extension, relative_filename};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::WatchConfig;
use crate::ingest::{Discovery, IngestEvent, IngestQueue};
use crate::store::RegistrationStore;

/// A filesystem change reduced to what ingestion cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawChange {
    Changed(PathBuf),
    Removed(PathBuf),
}

/// Reduce a notify event to changes. Renames become a removal of the old
/// path plus a change of the new one.
pub fn classify(event: &Event) -> Vec<RawChange> {
    match &event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(RawChange::Changed).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(RawChange::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event.paths.iter().cloned().map(RawChange::Removed).collect(),
            RenameMode::To => event.paths.iter().cloned().map(RawChange::Changed).collect(),
            RenameMode::Both if event.paths.len() == 2 => vec![
                RawChange::Removed(event.paths[0].clone()),
                RawChange::Changed(event.paths[1].clone()),
            ],
            _ => event
                .paths
                .iter()
                .map(|path| {
                    if path.exists() {
                        RawChange::Changed(path.clone())
                    } else {
                        RawChange::Removed(path.clone())
                    }
                })
                .collect(),
        },
        // directory metadata changes carry no new files
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|path| !path.is_dir())
            .cloned()
            .map(RawChange::Changed)
            .collect(),
        _ => Vec::new(),
    }
}

/// Readiness of a settled file.
#[derive(Debug, PartialEq, Eq)]
enum Readiness {
    Ready,
    /// Still being written or temporarily unreadable
    NotYet(String),
    Gone,
}

async fn readiness(path: &Path) -> Readiness {
    match tokio::fs::metadata(path).await {
        Ok(meta) if !meta.is_file() => Readiness::Gone,
        Ok(meta) if meta.len() == 0 => Readiness::NotYet("file is empty".to_string()),
        Ok(_) => Readiness::Ready,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Readiness::Gone,
        Err(e) => Readiness::NotYet(e.to_string()),
    }
}

/// Watches the root recursively and feeds settled image files to the queue.
pub struct DirectoryWatcher {
    root: PathBuf,
    extensions: Vec<String>,
    settle: Duration,
    retry_base: Duration,
    max_retries: u32,
    queue: IngestQueue,
}

impl DirectoryWatcher {
    pub fn new(root: PathBuf, config: &WatchConfig, queue: IngestQueue) -> Self {
        Self {
            root,
            extensions: config.image_extensions(),
            settle: Duration::from_millis(config.settle_ms),
            retry_base: Duration::from_millis(config.retry_base_ms.max(1)),
            max_retries: config.max_retries,
            queue,
        }
    }

    /// Start watching. A missing or unwatchable root is an error; the
    /// returned task runs until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        if !self.root.is_dir() {
            anyhow::bail!("Watch root is not a directory: {}", self.root.display());
        }

        let (raw_tx, raw_rx) = mpsc::channel::<RawChange>(1024);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in classify(&event) {
                        if raw_tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!("Watch error: {}", e),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch root: {}", self.root.display()))?;
        tracing::info!(root = %self.root.display(), "Watching directory");

        Ok(tokio::spawn(async move {
            // the watcher stops when dropped at the end of the loop
            let _watcher = watcher;
            self.run(raw_rx, cancel).await;
            tracing::info!("File watcher stopped");
        }))
    }

    async fn run(self, mut raw_rx: mpsc::Receiver<RawChange>, cancel: CancellationToken) {
        let mut tracker = SettleTracker::new(self.settle, self.retry_base, self.max_retries);
        let tick = (self.settle / 4).clamp(Duration::from_millis(25), Duration::from_millis(250));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = raw_rx.recv() => {
                    let Some(change) = change else { break };
                    if !self.on_change(&mut tracker, change).await {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if !self.flush_settled(&mut tracker).await {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `false` once the queue is closed.
    async fn on_change(&self, tracker: &mut SettleTracker, change: RawChange) -> bool {
        match change {
            RawChange::Changed(path) => {
                if self.is_image(&path) {
                    tracing::trace!(path = %path.display(), "File changed");
                    tracker.file_changed(path, Instant::now());
                } else if path.is_dir() {
                    // a directory moved in brings its files without per-file events
                    let now = Instant::now();
                    for file in image_files(&path, &self.extensions) {
                        tracker.file_changed(file, now);
                    }
                }
                true
            }
            RawChange::Removed(path) => {
                tracker.forget(&path);
                tracker.forget_under(&path);
                if relative_filename(&self.root, &path).is_none() {
                    return true;
                }
                tracing::debug!(path = %path.display(), "Path removed");
                self.submit(IngestEvent::Removed { path }).await
            }
        }
    }

    async fn flush_settled(&self, tracker: &mut SettleTracker) -> bool {
        let now = Instant::now();
        for path in tracker.due(now) {
            match readiness(&path).await {
                Readiness::Ready => {
                    tracker.settled(&path);
                    tracing::debug!(path = %path.display(), "File settled");
                    if !self.submit(IngestEvent::Discovered(Discovery::watched(path))).await {
                        return false;
                    }
                }
                Readiness::Gone => {
                    tracker.settled(&path);
                }
                Readiness::NotYet(reason) => match tracker.retry(&path, now) {
                    RetryDecision::Retry { attempt, delay } => {
                        tracing::debug!(
                            path = %path.display(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "File not ready ({}), retrying",
                            reason
                        );
                    }
                    RetryDecision::GiveUp => {
                        tracing::warn!(
                            path = %path.display(),
                            "Giving up on file after {} retries: {}",
                            self.max_retries,
                            reason
                        );
                    }
                },
            }
        }
        true
    }

    async fn submit(&self, event: IngestEvent) -> bool {
        match self.queue.submit(event).await {
            Ok(_ticket) => true,
            Err(e) => {
                tracing::warn!("Watcher could not enqueue: {}", e);
                false
            }
        }
    }

    fn is_image(&self, path: &Path) -> bool {
        has_extension(path, &self.extensions)
    }
}

/// Image files under `dir`, in walk order.
pub fn image_files(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| has_extension(path, extensions))
        .collect()
}

/// What the startup scan enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub discovered: usize,
    pub missing: usize,
}

/// Reconcile the store with the tree: every image on disk is rediscovered
/// (unchanged ones fold in as duplicates) and every live record whose file
/// is gone enters the removal grace window.
pub async fn scan_existing(
    root: PathBuf,
    extensions: Vec<String>,
    store: Arc<RegistrationStore>,
    queue: IngestQueue,
) -> galleryd_common::Result<ScanReport> {
    let walk_root = root.clone();
    let files = tokio::task::spawn_blocking(move || image_files(&walk_root, &extensions))
        .await
        .map_err(|e| galleryd_common::Error::internal(format!("scan task failed: {e}")))?;

    let mut report = ScanReport::default();
    let mut on_disk = std::collections::HashSet::with_capacity(files.len());
    for path in files {
        if let Some(filename) = relative_filename(&root, &path) {
            on_disk.insert(filename);
        }
        queue.submit(IngestEvent::Discovered(Discovery::watched(path))).await?;
        report.discovered += 1;
    }

    for filename in store.live_filenames()? {
        if on_disk.contains(&filename) {
            continue;
        }
        let path = galleryd_common::paths::absolute_path(&root, &filename);
        queue.submit(IngestEvent::Removed { path }).await?;
        report.missing += 1;
    }

    tracing::info!(
        discovered = report.discovered,
        missing = report.missing,
        "Startup scan queued"
    );
    Ok(report)
}

/// Live records whose file is no longer on disk.
pub async fn missing_records(
    root: &Path,
    store: &RegistrationStore,
) -> galleryd_common::Result<Vec<String>> {
    let mut missing = Vec::new();
    for filename in store.live_filenames()? {
        let path = galleryd_common::paths::absolute_path(root, &filename);
        let present = tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_file());
        if !present {
            missing.push(filename);
        }
    }
    Ok(missing)
}
