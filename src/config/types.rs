use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub hooks: HooksConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub broadcast: BroadcastConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret for HMAC-SHA256 verification of pushed generation events
    #[serde(default)]
    pub event_secret: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8189
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatchConfig {
    /// Root of the generation output tree; registration keys are relative to it
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Quiet period after the last change before a file is reported
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// First retry delay for files that are locked or still empty
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Accepted image extensions (empty = png, jpg, jpeg, webp)
    #[serde(default)]
    pub extensions: Vec<String>,
}

fn default_root() -> PathBuf {
    PathBuf::from("./output")
}
fn default_true() -> bool {
    true
}
fn default_settle_ms() -> u64 {
    500
}
fn default_retry_base_ms() -> u64 {
    200
}
fn default_max_retries() -> u32 {
    10
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            enabled: true,
            settle_ms: default_settle_ms(),
            retry_base_ms: default_retry_base_ms(),
            max_retries: default_max_retries(),
            extensions: Vec::new(),
        }
    }
}

impl WatchConfig {
    /// Configured extensions, or the built-in image set.
    pub fn image_extensions(&self) -> Vec<String> {
        if self.extensions.is_empty() {
            galleryd_common::paths::IMAGE_EXTENSIONS
                .iter()
                .map(|e| e.to_string())
                .collect()
        } else {
            self.extensions.iter().map(|e| e.to_lowercase()).collect()
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long a missing file stays visible before its record is tombstoned
    #[serde(default = "default_removal_grace")]
    pub removal_grace_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Per-output time budget for a pushed generation event
    #[serde(default = "default_event_timeout")]
    pub event_timeout_ms: u64,

    /// Tombstones older than this are deleted for good
    #[serde(default = "default_tombstone_retention")]
    pub tombstone_retention_secs: u64,

    #[serde(default = "default_true")]
    pub scan_on_startup: bool,
}

fn default_queue_capacity() -> usize {
    256
}
fn default_removal_grace() -> u64 {
    10
}
fn default_sweep_interval() -> u64 {
    1000
}
fn default_event_timeout() -> u64 {
    10_000
}
fn default_tombstone_retention() -> u64 {
    7 * 24 * 3600
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            removal_grace_secs: default_removal_grace(),
            sweep_interval_ms: default_sweep_interval(),
            event_timeout_ms: default_event_timeout(),
            tombstone_retention_secs: default_tombstone_retention(),
            scan_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HooksConfig {
    /// Directory scanned once at startup for `*.toml` extractor manifests
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Wall-clock budget for the whole pipeline, per record
    #[serde(default = "default_hook_timeout")]
    pub timeout_ms: u64,

    /// Built-in extractors to enable
    #[serde(default = "default_builtin_hooks")]
    pub builtin: Vec<String>,
}

fn default_hook_timeout() -> u64 {
    2000
}
fn default_builtin_hooks() -> Vec<String> {
    vec!["_default".to_string(), "sidecar".to_string()]
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            dir: None,
            timeout_ms: default_hook_timeout(),
            builtin: default_builtin_hooks(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThumbnailConfig {
    /// Artifact directory (default: `<data_dir>/thumbnails`)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Longest edge in pixels
    #[serde(default = "default_thumb_size")]
    pub size: u32,

    /// JPEG quality, 1-100
    #[serde(default = "default_thumb_quality")]
    pub quality: u8,

    /// Worker pool size (default: number of CPUs)
    #[serde(default)]
    pub workers: Option<usize>,

    /// How long the HTTP thumbnail route waits for a pending job
    #[serde(default = "default_thumb_wait")]
    pub wait_ms: u64,
}

fn default_thumb_size() -> u32 {
    256
}
fn default_thumb_quality() -> u8 {
    85
}
fn default_thumb_wait() -> u64 {
    3000
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            dir: None,
            size: default_thumb_size(),
            quality: default_thumb_quality(),
            workers: None,
            wait_ms: default_thumb_wait(),
        }
    }
}

impl ThumbnailConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BroadcastConfig {
    /// Messages buffered per subscriber before it is disconnected
    #[serde(default = "default_session_buffer")]
    pub session_buffer: usize,

    /// Records kept in the live projection
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_session_buffer() -> usize {
    64
}
fn default_page_size() -> u32 {
    50
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            session_buffer: default_session_buffer(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(shellexpand::tilde("~/.local/share/galleryd").as_ref())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.storage.data_dir.join("galleryd.db")
    }

    pub fn thumbnail_dir(&self) -> PathBuf {
        self.thumbnails
            .dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("thumbnails"))
    }
}
