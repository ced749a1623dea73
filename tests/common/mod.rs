//! Shared test harness for integration tests.
//!
//! [`TestHarness`] builds a full [`App`] over a tempdir root with an
//! in-memory database and stub extractors. HTTP requests go through the
//! router with `tower::ServiceExt::oneshot`, no socket involved.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use galleryd::config::Config;
use galleryd::hooks::{Extractor, HookInput, HookRegistry};
use galleryd::App;
use galleryd_common::{Metadata, Result};
use galleryd_db::pool::init_memory_pool;
use galleryd_db::ImageRecord;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

/// Extractor contributing one fixed key.
pub struct StaticHook {
    pub name: String,
    pub key: String,
    pub value: serde_json::Value,
}

impl StaticHook {
    pub fn arc(name: &str, key: &str, value: serde_json::Value) -> Arc<dyn Extractor> {
        Arc::new(Self {
            name: name.to_string(),
            key: key.to_string(),
            value,
        })
    }
}

#[async_trait]
impl Extractor for StaticHook {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self, _input: &HookInput, _current: &Metadata) -> Result<Metadata> {
        let mut out = Metadata::new();
        out.insert(self.key.clone(), self.value.clone());
        Ok(out)
    }
}

pub struct TestHarness {
    pub app: App,
    pub root: PathBuf,
    _dir: TempDir,
}

impl TestHarness {
    /// Watcher and startup scan off; one hook yielding `{"prompt": "a cat"}`.
    pub async fn new() -> Self {
        Self::with(|_| {}, vec![StaticHook::arc("prompt", "prompt", "a cat".into())]).await
    }

    pub async fn with(configure: impl FnOnce(&mut Config), hooks: Vec<Arc<dyn Extractor>>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("out");
        std::fs::create_dir_all(&root).expect("create root");

        let mut config = Config::default();
        config.watch.root = root.clone();
        config.watch.enabled = false;
        config.watch.settle_ms = 50;
        config.ingest.scan_on_startup = false;
        config.ingest.sweep_interval_ms = 50;
        config.storage.data_dir = dir.path().join("data");
        config.thumbnails.size = 32;
        config.thumbnails.workers = Some(2);
        configure(&mut config);

        let mut registry = HookRegistry::new();
        for hook in hooks {
            registry.register(hook).expect("register hook");
        }

        let pool = init_memory_pool().expect("failed to create in-memory pool");
        let mut app = App::build(config, registry, pool).expect("build app");
        app.run_background().await.expect("start background tasks");
        let root = app.root().to_path_buf();

        Self {
            app,
            root,
            _dir: dir,
        }
    }

    /// Write a real PNG of the given size under the root.
    pub fn write_png(&self, rel: &str, width: u32, height: u32) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 7) as u8, (y * 13) as u8, 128])
        });
        img.save(&path).expect("save png");
        path
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let (status, _, bytes) = self.raw_request(method, uri, body, &[]).await;
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    pub async fn raw_request(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, HeaderMap, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.router().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes().to_vec();
        (status, headers, bytes)
    }

    pub async fn post_event(&self, event: serde_json::Value) -> (StatusCode, serde_json::Value) {
        self.request("POST", "/api/events", Some(event)).await
    }

    pub fn record(&self, filename: &str) -> Option<ImageRecord> {
        self.app.context().store.get(filename).unwrap()
    }

    /// Poll until `check` holds for the record, or panic after five seconds.
    pub async fn wait_for_record(
        &self,
        filename: &str,
        check: impl Fn(&ImageRecord) -> bool,
    ) -> ImageRecord {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = self.record(filename) {
                if check(&record) {
                    return record;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {filename}: {:?}", self.record(filename));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll until the record is gone (tombstoned), or panic after five seconds.
    pub async fn wait_for_absence(&self, filename: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.record(filename).is_some() {
            if tokio::time::Instant::now() > deadline {
                panic!("{filename} still registered");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub async fn shutdown(self) {
        self.app.shutdown().await.expect("clean shutdown");
    }
}
