//! Ingestion: the queue, the coordinator that drains it, and the event
//! receiver that feeds it from pushed generation events.

pub mod coordinator;
pub mod fingerprint;
mod queue;
pub mod receiver;

use std::path::PathBuf;

use galleryd_common::{DiscoverySource, Metadata};
use serde::Serialize;

pub use coordinator::{IngestionCoordinator, SweepReport};
pub use queue::{channel, IngestQueue, IngestReceiver, Ticket};
pub use receiver::{EventReceiver, GenerationEvent, OutputDescriptor, OutputResult, OutputStatus};

/// A file that appeared (or changed) under the root.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovery {
    /// Absolute path under the watched root
    pub path: PathBuf,
    pub source: DiscoverySource,
    pub job_id: Option<String>,
    /// Caller context handed to extractors
    pub hints: Metadata,
}

impl Discovery {
    pub fn watched(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source: DiscoverySource::Watched,
            job_id: None,
            hints: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Discovered(Discovery),
    /// A file or directory disappeared
    Removed { path: PathBuf },
}

/// What the coordinator did with one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum IngestOutcome {
    Created,
    Updated,
    /// Same content as the live record; nothing re-derived
    Duplicate,
    /// The record is inside its removal grace window
    PendingRemoval,
    /// Nothing to do (unknown file, or it is back on disk)
    Ignored,
    Failed(String),
}
