//! The set of active extractors, fixed at startup.
//!
//! Extractors are kept sorted by name so run order is deterministic no matter
//! the order they were registered or discovered in. Candidates that fail
//! validation are remembered with a reason so operators can see why a hook
//! is not running.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use galleryd_common::{Error, Result};
use serde::Serialize;

use super::manifest::load_manifest;
use super::{builtin, Extractor};
use crate::config::HooksConfig;

/// A candidate that was not activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedHook {
    pub source: String,
    pub reason: String,
}

/// One row of [`HookRegistry::describe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookDescription {
    pub name: String,
    pub kind: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Default)]
pub struct HookRegistry {
    extractors: Vec<Arc<dyn Extractor>>,
    rejected: Vec<RejectedHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration: the enabled built-ins plus every
    /// valid manifest in the hook directory.
    pub fn from_config(config: &HooksConfig) -> Self {
        let mut registry = Self::new();

        for name in &config.builtin {
            match builtin::by_name(name) {
                Some(hook) => registry.register_or_reject(name, hook),
                None => registry.reject(name, "unknown built-in extractor"),
            }
        }

        if let Some(dir) = &config.dir {
            registry.load_dir(dir);
        }

        tracing::info!(
            active = registry.extractors.len(),
            rejected = registry.rejected.len(),
            "Hook registry ready: {}",
            registry.names().join(", ")
        );
        registry
    }

    /// Add an extractor. Empty and duplicate names are refused.
    pub fn register(&mut self, hook: Arc<dyn Extractor>) -> Result<()> {
        let name = hook.name();
        if name.trim().is_empty() {
            return Err(Error::invalid_input("extractor name is empty"));
        }
        match self
            .extractors
            .binary_search_by(|existing| existing.name().cmp(name))
        {
            Ok(_) => Err(Error::invalid_input(format!(
                "duplicate extractor name '{name}'"
            ))),
            Err(pos) => {
                self.extractors.insert(pos, hook);
                Ok(())
            }
        }
    }

    fn register_or_reject(&mut self, source: &str, hook: Arc<dyn Extractor>) {
        if let Err(e) = self.register(hook) {
            self.reject(source, e.to_string());
        }
    }

    fn reject(&mut self, source: impl Into<String>, reason: impl Into<String>) {
        let rejected = RejectedHook {
            source: source.into(),
            reason: reason.into(),
        };
        tracing::warn!(source = %rejected.source, "Hook rejected: {}", rejected.reason);
        self.rejected.push(rejected);
    }

    /// Scan `dir` for `*.toml` manifests. Non-manifest files are ignored.
    pub fn load_dir(&mut self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.reject(dir.display().to_string(), format!("cannot read hook directory: {e}"));
                return;
            }
        };

        let mut manifests: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        manifests.sort();

        for path in manifests {
            let source = path.display().to_string();
            match load_manifest(&path) {
                Ok(hook) => {
                    tracing::debug!(hook = hook.name(), kind = hook.kind(), "Loaded hook manifest");
                    self.register_or_reject(&source, hook);
                }
                Err(e) => self.reject(source, e.to_string()),
            }
        }
    }

    /// Active extractors in run order.
    pub fn extractors(&self) -> &[Arc<dyn Extractor>] {
        &self.extractors
    }

    pub fn names(&self) -> Vec<String> {
        self.extractors.iter().map(|h| h.name().to_string()).collect()
    }

    pub fn rejected(&self) -> &[RejectedHook] {
        &self.rejected
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Active hooks in run order, followed by rejected candidates.
    pub fn describe(&self) -> Vec<HookDescription> {
        let active = self.extractors.iter().map(|h| HookDescription {
            name: h.name().to_string(),
            kind: h.kind().to_string(),
            active: true,
            reason: None,
        });
        let rejected = self.rejected.iter().map(|r| HookDescription {
            name: r.source.clone(),
            kind: "rejected".to_string(),
            active: false,
            reason: Some(r.reason.clone()),
        });
        active.chain(rejected).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookInput;
    use async_trait::async_trait;
    use galleryd_common::Metadata;

    struct Named(&'static str);

    #[async_trait]
    impl Extractor for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn extract(&self, _: &HookInput, _: &Metadata) -> Result<Metadata> {
            Ok(Metadata::new())
        }
    }

    #[test]
    fn test_lexical_order() {
        let mut registry = HookRegistry::new();
        for name in ["zeta", "_default", "conduit", "alpha"] {
            registry.register(Arc::new(Named(name))).unwrap();
        }
        assert_eq!(registry.names(), vec!["_default", "alpha", "conduit", "zeta"]);
    }

    #[test]
    fn test_duplicate_and_empty_names_refused() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(Named("a"))).unwrap();
        assert!(registry.register(Arc::new(Named("a"))).is_err());
        assert!(registry.register(Arc::new(Named("  "))).is_err());
        assert_eq!(registry.names(), vec!["a"]);
    }

    #[test]
    fn test_from_config_builtins() {
        let config = HooksConfig {
            builtin: vec!["sidecar".into(), "_default".into(), "bogus".into()],
            ..Default::default()
        };
        let registry = HookRegistry::from_config(&config);
        assert_eq!(registry.names(), vec!["_default", "sidecar"]);
        assert_eq!(registry.rejected().len(), 1);
        assert_eq!(registry.rejected()[0].source, "bogus");
    }

    #[test]
    fn test_load_dir_validates_candidates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("captions.toml"),
            r#"
name = "captions"
kind = "sidecar"

[[files]]
file = "caption.txt"
key = "caption"
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.toml"), "name = ").unwrap();
        std::fs::write(
            dir.path().join("nofiles.toml"),
            "name = \"nofiles\"\nkind = \"sidecar\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("missing_cmd.toml"),
            "name = \"tagger\"\nkind = \"command\"\ncommand = \"/nonexistent/tagger\"\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a manifest").unwrap();

        let config = HooksConfig {
            dir: Some(dir.path().to_path_buf()),
            builtin: vec!["_default".into()],
            ..Default::default()
        };
        let registry = HookRegistry::from_config(&config);
        assert_eq!(registry.names(), vec!["_default", "captions"]);
        assert_eq!(registry.rejected().len(), 3);

        let described = registry.describe();
        assert_eq!(described.len(), 5);
        assert!(described[0].active);
        assert_eq!(described[1].kind, "sidecar");
        assert!(described[2..].iter().all(|d| !d.active && d.reason.is_some()));
    }

    #[test]
    fn test_missing_dir_is_rejected_not_fatal() {
        let config = HooksConfig {
            dir: Some(PathBuf::from("/nonexistent/hooks")),
            builtin: vec![],
            ..Default::default()
        };
        let registry = HookRegistry::from_config(&config);
        assert!(registry.is_empty());
        assert_eq!(registry.rejected().len(), 1);
    }
}
