//! The running service: every component behind an `Arc`, owned by one value.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use galleryd_db::pool::{init_pool, DbPool};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hooks::{HookPipeline, HookRegistry};
use crate::ingest::{self, EventReceiver, IngestQueue, IngestReceiver, IngestionCoordinator};
use crate::server::{self, AppContext};
use crate::state::StateBroadcaster;
use crate::store::RegistrationStore;
use crate::thumbnails::{ThumbnailCache, ThumbnailStorage};
use crate::watch::{self, DirectoryWatcher};

pub struct App {
    ctx: AppContext,
    root: PathBuf,
    queue: IngestQueue,
    ingest_rx: Option<IngestReceiver>,
    cancel: CancellationToken,
    coordinator: Option<JoinHandle<galleryd_common::Result<()>>>,
    watcher: Option<JoinHandle<()>>,
    scan: Option<JoinHandle<()>>,
    server: Option<JoinHandle<Result<()>>>,
}

impl App {
    /// Open the database under `storage.data_dir`, load hooks and start
    /// every background task.
    pub async fn start(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
            format!("Failed to create data directory: {}", config.storage.data_dir.display())
        })?;
        let db_path = config.db_path();
        tracing::info!("Opening database at {}", db_path.display());
        let pool = init_pool(&db_path).context("Failed to open registration database")?;

        let registry = HookRegistry::from_config(&config.hooks);

        let mut app = Self::build(config, registry, pool)?;
        app.run_background().await?;
        Ok(app)
    }

    /// Wire the components without starting any task.
    pub fn build(config: Config, registry: HookRegistry, pool: DbPool) -> Result<Self> {
        let root = config
            .watch
            .root
            .canonicalize()
            .with_context(|| format!("Watch root is not accessible: {}", config.watch.root.display()))?;
        if !root.is_dir() {
            anyhow::bail!("Watch root is not a directory: {}", root.display());
        }

        let broadcaster = Arc::new(StateBroadcaster::new(&config.broadcast));
        let store = Arc::new(RegistrationStore::new(pool, broadcaster.clone()));
        let storage = ThumbnailStorage::new(
            config.thumbnail_dir(),
            config.thumbnails.size,
            config.thumbnails.quality,
        );
        let thumbnails = ThumbnailCache::new(
            storage,
            store.clone(),
            root.clone(),
            config.thumbnails.worker_count(),
        );
        let (queue, ingest_rx) = ingest::channel(config.ingest.queue_capacity);
        let receiver = Arc::new(EventReceiver::new(
            root.clone(),
            config.watch.image_extensions(),
            queue.clone(),
            broadcaster.clone(),
            Duration::from_millis(config.ingest.event_timeout_ms),
        ));

        let ctx = AppContext {
            config: Arc::new(config),
            root: root.clone(),
            store,
            broadcaster,
            thumbnails,
            receiver,
            queue: queue.clone(),
            hooks: Arc::new(registry),
        };

        Ok(Self {
            ctx,
            root,
            queue,
            ingest_rx: Some(ingest_rx),
            cancel: CancellationToken::new(),
            coordinator: None,
            watcher: None,
            scan: None,
            server: None,
        })
    }

    /// Seed state from the store, then start the coordinator, the watcher
    /// and the startup scan.
    pub async fn run_background(&mut self) -> Result<()> {
        let Some(ingest_rx) = self.ingest_rx.take() else {
            anyhow::bail!("Background tasks already started");
        };
        let config = self.ctx.config.clone();

        self.ctx
            .store
            .seed_projection()
            .context("Failed to load registrations")?;
        let live = self.ctx.store.live_fingerprints()?;
        if let Err(e) = self.ctx.thumbnails.cleanup_orphans(&live, false).await {
            tracing::warn!("Thumbnail cleanup failed: {}", e);
        }
        let pending = self.ctx.thumbnails.reschedule_pending()?;
        if pending > 0 {
            tracing::info!(pending, "Rescheduled pending thumbnails");
        }

        let pipeline = HookPipeline::new(
            self.ctx.hooks.clone(),
            Duration::from_millis(config.hooks.timeout_ms),
        );
        let coordinator = IngestionCoordinator::new(
            &config.ingest,
            self.root.clone(),
            self.ctx.store.clone(),
            pipeline,
            self.ctx.thumbnails.clone(),
        );
        let cancel = self.cancel.clone();
        self.coordinator = Some(tokio::spawn(async move {
            let result = coordinator.run(ingest_rx, cancel.clone()).await;
            if result.is_err() {
                // a fatal store error takes the whole service down
                cancel.cancel();
            }
            result
        }));

        if config.watch.enabled {
            let watcher = DirectoryWatcher::new(self.root.clone(), &config.watch, self.queue.clone());
            self.watcher = Some(watcher.spawn(self.cancel.child_token())?);
        } else {
            tracing::info!("File watcher is disabled");
        }

        if config.ingest.scan_on_startup {
            let root = self.root.clone();
            let extensions = config.watch.image_extensions();
            let store = self.ctx.store.clone();
            let queue = self.queue.clone();
            let cancel = self.cancel.clone();
            self.scan = Some(tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = watch::scan_existing(root, extensions, store, queue) => {
                        if let Err(e) = result {
                            tracing::warn!("Startup scan failed: {}", e);
                        }
                    }
                }
            }));
        }

        Ok(())
    }

    /// Serve HTTP on `listener` until shutdown.
    pub fn serve(&mut self, listener: TcpListener) {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.child_token();
        self.server = Some(tokio::spawn(server::serve(listener, ctx, cancel)));
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn router(&self) -> axum::Router {
        server::create_router(self.ctx.clone())
    }

    /// Canonical watched root
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn queue(&self) -> &IngestQueue {
        &self.queue
    }

    /// Resolves once shutdown began, including after a fatal error.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    /// Stop every task and wait for it. Fails when ingestion ended on a
    /// fatal error.
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!("Shutting down...");
        self.cancel.cancel();

        if let Some(server) = self.server.take() {
            match server.await {
                Ok(Err(e)) => tracing::error!("Server error: {:#}", e),
                Err(e) => tracing::error!("Server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        for task in [self.scan.take(), self.watcher.take()].into_iter().flatten() {
            let _ = task.await;
        }

        match self.coordinator.take() {
            Some(coordinator) => match coordinator.await {
                Ok(result) => result.context("Ingestion stopped on a fatal error"),
                Err(e) => Err(anyhow::anyhow!("Ingestion task failed: {e}")),
            },
            None => Ok(()),
        }
    }
}
