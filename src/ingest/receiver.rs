//! Pushed "generation completed" events.
//!
//! The receiver validates an event, turns every valid output into a
//! `Discovered` event on the shared queue and waits (bounded) for the
//! coordinator's verdict, so the caller learns per output whether it was
//! accepted, already known, or refused. An output still waiting in the queue
//! at the deadline is reported `queued`: it will be applied, so resending it
//! is unnecessary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use galleryd_common::paths::{has_extension, relative_filename, resolve_within};
use galleryd_common::{DiscoverySource, Error, Metadata, Result};
use serde::{Deserialize, Serialize};

use super::{Discovery, IngestEvent, IngestOutcome, IngestQueue};
use crate::state::StateBroadcaster;

/// Rejection reason for outputs refused because the queue was full.
pub const SATURATED: &str = "ingest queue saturated";

/// Reason attached to outputs reported before the coordinator got to them.
pub const OUTCOME_PENDING: &str = "outcome pending";

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationEvent {
    pub job_id: String,
    /// Directory the output paths are relative to (default: the watched root)
    #[serde(default)]
    pub output_root: Option<String>,
    #[serde(default)]
    pub outputs: Vec<OutputDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputDescriptor {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub hints: Option<Metadata>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Accepted,
    Duplicate,
    Rejected,
    /// Enqueued, but not processed within the event timeout
    Queued,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputResult {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub status: OutputStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl OutputResult {
    fn rejected(path: &str, filename: Option<String>, reason: impl Into<String>, retryable: bool) -> Self {
        Self {
            path: path.to_string(),
            filename,
            status: OutputStatus::Rejected,
            reason: Some(reason.into()),
            retryable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventResponse {
    pub job_id: String,
    pub results: Vec<OutputResult>,
}

impl EventResponse {
    /// Whether any output was refused for a reason worth retrying.
    pub fn retryable(&self) -> bool {
        self.results.iter().any(|r| r.retryable)
    }

    /// Whether any output was refused because the queue was full.
    pub fn saturated(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.reason.as_deref() == Some(SATURATED))
    }

    fn count(&self, status: OutputStatus) -> u64 {
        self.results.iter().filter(|r| r.status == status).count() as u64
    }
}

pub struct EventReceiver {
    root: PathBuf,
    extensions: Vec<String>,
    queue: IngestQueue,
    broadcaster: Arc<StateBroadcaster>,
    timeout: Duration,
}

impl EventReceiver {
    pub fn new(
        root: PathBuf,
        extensions: Vec<String>,
        queue: IngestQueue,
        broadcaster: Arc<StateBroadcaster>,
        timeout: Duration,
    ) -> Self {
        Self {
            root,
            extensions,
            queue,
            broadcaster,
            timeout,
        }
    }

    /// Validate and ingest one event.
    ///
    /// A structurally invalid event is [`Error::InvalidEventPayload`] and
    /// nothing is enqueued. Otherwise every output gets its own result.
    pub async fn receive(&self, event: GenerationEvent) -> Result<EventResponse> {
        let job_id = event.job_id.trim().to_string();
        let base = match self.validate(&job_id, event.output_root.as_deref()) {
            Ok(base) => base,
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Rejected generation event: {}", e);
                let rejected = event.outputs.len() as u64;
                self.record(&job_id, 0, 0, rejected, 0);
                return Err(e);
            }
        };

        let results = join_all(
            event
                .outputs
                .into_iter()
                .map(|output| self.ingest_output(&base, &job_id, output)),
        )
        .await;

        let response = EventResponse { job_id, results };
        let accepted = response.count(OutputStatus::Accepted);
        let duplicate = response.count(OutputStatus::Duplicate);
        let rejected = response.count(OutputStatus::Rejected);
        let queued = response.count(OutputStatus::Queued);
        self.record(&response.job_id, accepted, duplicate, rejected, queued);
        tracing::info!(
            job_id = %response.job_id,
            accepted,
            duplicate,
            rejected,
            queued,
            "Generation event processed"
        );
        Ok(response)
    }

    fn validate(&self, job_id: &str, output_root: Option<&str>) -> Result<PathBuf> {
        if job_id.is_empty() {
            return Err(Error::invalid_payload("job_id is required"));
        }
        match output_root {
            None => Ok(self.root.clone()),
            Some(raw) if raw.trim().is_empty() => Ok(self.root.clone()),
            Some(raw) => resolve_within(&self.root, &self.root, Path::new(raw.trim()))
                .map_err(|_| Error::invalid_payload(format!("output_root escapes root: {raw}"))),
        }
    }

    fn record(&self, job_id: &str, accepted: u64, duplicate: u64, rejected: u64, queued: u64) {
        let job_id = (!job_id.is_empty()).then(|| job_id.to_string());
        self.broadcaster.update_generation(|status| {
            status.jobs_received += 1;
            status.outputs_accepted += accepted;
            status.outputs_duplicate += duplicate;
            status.outputs_rejected += rejected;
            status.outputs_queued += queued;
            if job_id.is_some() {
                status.last_job_id = job_id;
            }
            status.last_event_at = Some(Utc::now());
        });
    }

    async fn ingest_output(&self, base: &Path, job_id: &str, output: OutputDescriptor) -> OutputResult {
        let raw = output.path.trim();
        if raw.is_empty() {
            return OutputResult::rejected(&output.path, None, "path is empty", false);
        }
        let path = match resolve_within(&self.root, base, Path::new(raw)) {
            Ok(path) => path,
            Err(e) => return OutputResult::rejected(raw, None, reason_of(e), false),
        };
        let Some(filename) = relative_filename(&self.root, &path) else {
            return OutputResult::rejected(raw, None, "path escapes root", false);
        };
        if !has_extension(&path, &self.extensions) {
            return OutputResult::rejected(raw, Some(filename), "unsupported file type", false);
        }
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return OutputResult::rejected(raw, Some(filename), "file not found", false);
        }

        let discovery = Discovery {
            path,
            source: DiscoverySource::Event,
            job_id: Some(job_id.to_string()),
            hints: output.hints.unwrap_or_default(),
        };
        let ticket = match self.queue.try_submit(IngestEvent::Discovered(discovery)) {
            Ok(ticket) => ticket,
            Err(e) => {
                let retryable = e.is_retryable();
                return OutputResult::rejected(raw, Some(filename), reason_of(e), retryable);
            }
        };

        let outcome = match tokio::time::timeout(self.timeout, ticket.outcome()).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return OutputResult::rejected(raw, Some(filename), reason_of(e), false),
            Err(_) => {
                tracing::debug!(filename = %filename, "Output still queued at the event timeout");
                return OutputResult {
                    path: raw.to_string(),
                    filename: Some(filename),
                    status: OutputStatus::Queued,
                    reason: Some(OUTCOME_PENDING.to_string()),
                    retryable: false,
                };
            }
        };

        let status = match outcome {
            IngestOutcome::Created | IngestOutcome::Updated => OutputStatus::Accepted,
            IngestOutcome::Duplicate => OutputStatus::Duplicate,
            IngestOutcome::Failed(reason) => {
                return OutputResult::rejected(raw, Some(filename), reason, false)
            }
            other => {
                return OutputResult::rejected(raw, Some(filename), format!("unexpected outcome {other:?}"), false)
            }
        };
        OutputResult {
            path: raw.to_string(),
            filename: Some(filename),
            status,
            reason: None,
            retryable: false,
        }
    }
}

fn reason_of(e: Error) -> String {
    match e {
        Error::InvalidEventPayload(msg) | Error::Internal(msg) => msg,
        Error::QueueSaturated => SATURATED.to_string(),
        other => other.to_string(),
    }
}
