//! Rust models matching the database schema.

use chrono::{DateTime, Utc};
use galleryd_common::{
    DiscoverySource, Fingerprint, HookFailure, Metadata, Rating, ThumbnailStatus,
};
use serde::{Deserialize, Serialize};

/// One registered image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    /// Path relative to the watched root, forward-slash separated.
    pub filename: String,
    pub source: DiscoverySource,
    pub discovered_at: DateTime<Utc>,
    /// External job id when an event reported (or later confirmed) the file.
    pub job_id: Option<String>,
    pub metadata: Metadata,
    pub rating: Rating,
    pub flagged: bool,
    pub fingerprint: Fingerprint,
    pub thumbnail_status: ThumbnailStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hook_failures: Vec<HookFailure>,
    /// Set while the backing file is missing but the grace window is open.
    pub missing_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    /// A fresh record with neutral rating and a pending thumbnail.
    pub fn new(
        filename: impl Into<String>,
        source: DiscoverySource,
        fingerprint: Fingerprint,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            filename: filename.into(),
            source,
            discovered_at,
            job_id: None,
            metadata: Metadata::new(),
            rating: Rating::Neutral,
            flagged: false,
            fingerprint,
            thumbnail_status: ThumbnailStatus::Pending,
            thumbnail_path: None,
            thumbnail_error: None,
            hook_failures: Vec::new(),
            missing_since: None,
            updated_at: discovered_at,
        }
    }

    /// Whether the record is waiting out the removal grace window.
    pub fn is_pending_removal(&self) -> bool {
        self.missing_since.is_some()
    }
}

/// Aggregate counts over live registrations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrationStats {
    pub total: u64,
    pub flagged: u64,
    pub liked: u64,
    pub disliked: u64,
    pub pending_removal: u64,
    pub thumbnails_ready: u64,
    pub thumbnails_failed: u64,
}
