//! Pluggable metadata extraction.
//!
//! An [`Extractor`] turns an image (and the folder it lives in) into a partial
//! metadata map. The [`HookRegistry`] holds the extractors that were validated
//! at startup, ordered by name, and the [`HookPipeline`] runs them in that
//! order under one wall-clock budget, merging later-wins.

pub mod builtin;
pub mod manifest;
pub mod pipeline;
pub mod registry;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use galleryd_common::{Metadata, Result};

pub use pipeline::{HookPipeline, PipelineOutput};
pub use registry::{HookDescription, HookRegistry, RejectedHook};

/// What an extractor gets to look at.
#[derive(Debug, Clone)]
pub struct HookInput {
    /// Directory containing the image
    pub folder: PathBuf,
    /// Absolute path of the image
    pub file: PathBuf,
    /// Caller-supplied context from a generation event (read-only)
    pub hints: Metadata,
}

impl HookInput {
    pub fn new(file: impl Into<PathBuf>, hints: Metadata) -> Self {
        let file = file.into();
        let folder = file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            folder,
            file,
            hints,
        }
    }

    /// A string hint, if present.
    pub fn hint_str(&self, key: &str) -> Option<&str> {
        self.hints.get(key).and_then(|v| v.as_str())
    }
}

/// A single metadata extractor.
///
/// Implementations return only the keys they contribute; merging into the
/// record is the pipeline's job.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Unique name; also the sort key for run order.
    fn name(&self) -> &str;

    /// Short label for listings.
    fn kind(&self) -> &'static str {
        "custom"
    }

    async fn extract(&self, input: &HookInput, current: &Metadata) -> Result<Metadata>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hook_input_folder() {
        let input = HookInput::new("/out/conduit/J1/a.png", Metadata::new());
        assert_eq!(input.folder, PathBuf::from("/out/conduit/J1"));
        assert_eq!(input.hint_str("generation_type"), None);

        let mut hints = Metadata::new();
        hints.insert("generation_type".into(), json!("scene_gen"));
        let input = HookInput::new("/out/a.png", hints);
        assert_eq!(input.hint_str("generation_type"), Some("scene_gen"));
    }
}
