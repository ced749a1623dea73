mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./galleryd.toml",
        "~/.config/galleryd/config.toml",
        "/etc/galleryd/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    let config = Config::default();
    validate_config(&config)?;
    Ok(config)
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

fn expand_paths(config: &mut Config) {
    config.watch.root = expand(&config.watch.root);
    config.storage.data_dir = expand(&config.storage.data_dir);
    if let Some(dir) = config.hooks.dir.as_mut() {
        *dir = expand(dir);
    }
    if let Some(dir) = config.thumbnails.dir.as_mut() {
        *dir = expand(dir);
    }
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }
    if config.ingest.queue_capacity == 0 {
        anyhow::bail!("ingest.queue_capacity must be at least 1");
    }
    if config.broadcast.session_buffer == 0 {
        anyhow::bail!("broadcast.session_buffer must be at least 1");
    }
    if config.broadcast.page_size == 0 {
        anyhow::bail!("broadcast.page_size must be at least 1");
    }
    if config.thumbnails.size == 0 {
        anyhow::bail!("thumbnails.size must be at least 1");
    }
    if !(1..=100).contains(&config.thumbnails.quality) {
        anyhow::bail!("thumbnails.quality must be between 1 and 100");
    }

    if !config.watch.root.exists() {
        tracing::warn!("Watch root does not exist: {:?}", config.watch.root);
    }
    if let Some(ref dir) = config.hooks.dir {
        if !dir.is_dir() {
            tracing::warn!("Hook directory does not exist: {:?}", dir);
        }
    }

    Ok(())
}
