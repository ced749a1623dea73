//! Thumbnail artifacts and the worker pool that derives them.

mod cache;
mod storage;

pub use cache::{CacheStats, CleanupReport, ThumbnailArtifact, ThumbnailCache};
pub use storage::{StorageStats, ThumbnailStorage};
