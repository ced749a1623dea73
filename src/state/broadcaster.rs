//! Versioned projection of registry state with per-subscriber fan-out.
//!
//! Every publish happens under one lock: the version is bumped, the projection
//! updated and the message pushed into each session's bounded channel with
//! `try_send`. Channel order therefore equals version order, and a slow
//! subscriber costs the publisher nothing but a dropped sender.

use std::collections::HashMap;

use galleryd_common::{InstanceId, SessionId};
use galleryd_db::ImageRecord;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::types::{
    GenerationStatus, ProjectionRefresh, Snapshot, StateDiff, StateMessage,
};
use crate::config::BroadcastConfig;

#[derive(Debug, Default)]
struct Projection {
    records: Vec<ImageRecord>,
    total: u64,
    generation: GenerationStatus,
}

impl Projection {
    fn apply(&mut self, diff: &StateDiff, page_size: usize) {
        match diff {
            StateDiff::RecordAdded(record) => {
                self.records.retain(|r| r.filename != record.filename);
                let pos = self
                    .records
                    .iter()
                    .position(|r| {
                        (r.discovered_at, std::cmp::Reverse(&r.filename))
                            < (record.discovered_at, std::cmp::Reverse(&record.filename))
                    })
                    .unwrap_or(self.records.len());
                self.records.insert(pos, record.as_ref().clone());
                self.records.truncate(page_size);
                self.total += 1;
            }
            StateDiff::RecordUpdated(record) => {
                if let Some(slot) = self
                    .records
                    .iter_mut()
                    .find(|r| r.filename == record.filename)
                {
                    *slot = record.as_ref().clone();
                }
            }
            StateDiff::RecordRemoved { filename } => {
                self.records.retain(|r| &r.filename != filename);
                self.total = self.total.saturating_sub(1);
            }
            StateDiff::Generation(status) => {
                self.generation = status.clone();
            }
        }
    }
}

struct Session {
    tx: mpsc::Sender<StateMessage>,
    /// Highest version pushed into the channel
    delivered: u64,
    /// Highest version the client reported back
    acknowledged: u64,
}

struct Inner {
    version: u64,
    projection: Projection,
    sessions: HashMap<SessionId, Session>,
}

/// A live subscription. Dropping the receiver ends it on the next publish.
pub struct Subscription {
    pub id: SessionId,
    pub rx: mpsc::Receiver<StateMessage>,
}

pub struct StateBroadcaster {
    instance_id: InstanceId,
    session_buffer: usize,
    page_size: usize,
    inner: Mutex<Inner>,
}

impl StateBroadcaster {
    pub fn new(config: &BroadcastConfig) -> Self {
        Self {
            instance_id: InstanceId::new(),
            session_buffer: config.session_buffer.max(1),
            page_size: config.page_size.max(1) as usize,
            inner: Mutex::new(Inner {
                version: 0,
                projection: Projection::default(),
                sessions: HashMap::new(),
            }),
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn page_size(&self) -> u32 {
        self.page_size as u32
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Load the initial projection without publishing anything.
    pub fn seed(&self, refresh: ProjectionRefresh) {
        let mut inner = self.inner.lock();
        inner.projection.records = refresh.records;
        inner.projection.records.truncate(self.page_size);
        inner.projection.total = refresh.total;
    }

    /// Commit a change: bump the version, update the projection and fan the
    /// diff out. Returns the new version.
    pub fn publish(&self, diff: StateDiff, refresh: Option<ProjectionRefresh>) -> u64 {
        let mut inner = self.inner.lock();
        self.publish_locked(&mut inner, diff, refresh)
    }

    fn publish_locked(
        &self,
        inner: &mut Inner,
        diff: StateDiff,
        refresh: Option<ProjectionRefresh>,
    ) -> u64 {
        inner.version += 1;
        let version = inner.version;

        match refresh {
            Some(refresh) => {
                if let StateDiff::Generation(ref status) = diff {
                    inner.projection.generation = status.clone();
                }
                inner.projection.records = refresh.records;
                inner.projection.records.truncate(self.page_size);
                inner.projection.total = refresh.total;
            }
            None => inner.projection.apply(&diff, self.page_size),
        }

        let message = StateMessage::from_diff(&diff, version);
        inner.sessions.retain(|id, session| {
            match session.tx.try_send(message.clone()) {
                Ok(()) => {
                    session.delivered = version;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(session = %id, version, "Subscriber buffer overflowed, disconnecting");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(session = %id, "Subscriber gone");
                    false
                }
            }
        });

        tracing::trace!(version, kind = ?diff.kind(), "Published state change");
        version
    }

    /// Replace the aggregate generation status and publish it.
    pub fn update_generation(&self, update: impl FnOnce(&mut GenerationStatus)) -> u64 {
        let mut inner = self.inner.lock();
        let mut status = inner.projection.generation.clone();
        update(&mut status);
        self.publish_locked(&mut inner, StateDiff::Generation(status), None)
    }

    fn snapshot_locked(&self, inner: &Inner) -> Snapshot {
        Snapshot {
            instance_id: self.instance_id,
            version: inner.version,
            records: inner.projection.records.clone(),
            total: inner.projection.total,
            generation: inner.projection.generation.clone(),
        }
    }

    /// Current full snapshot.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock();
        self.snapshot_locked(&inner)
    }

    /// Register a new session. Its channel starts with a full snapshot, so
    /// every later message carries a greater version.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.session_buffer);
        let id = SessionId::new();

        let mut inner = self.inner.lock();
        let snapshot = self.snapshot_locked(&inner);
        let version = snapshot.version;
        // a fresh channel always has room for one message
        let _ = tx.try_send(StateMessage::snapshot(&snapshot));
        inner.sessions.insert(
            id,
            Session {
                tx,
                delivered: version,
                acknowledged: 0,
            },
        );
        tracing::debug!(session = %id, version, "Subscriber connected");

        Subscription { id, rx }
    }

    /// Queue a full snapshot for an existing session, whatever it saw before.
    ///
    /// Returns `false` when the session is unknown or had to be disconnected.
    pub fn resync(&self, id: SessionId) -> bool {
        let mut inner = self.inner.lock();
        let snapshot = self.snapshot_locked(&inner);
        let Some(session) = inner.sessions.get_mut(&id) else {
            return false;
        };
        match session.tx.try_send(StateMessage::snapshot(&snapshot)) {
            Ok(()) => {
                session.delivered = snapshot.version;
                true
            }
            Err(_) => {
                tracing::warn!(session = %id, "Resync could not be queued, disconnecting");
                inner.sessions.remove(&id);
                false
            }
        }
    }

    /// Record the highest version a client confirmed.
    pub fn acknowledge(&self, id: SessionId, version: u64) {
        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.acknowledged = session.acknowledged.max(version.min(session.delivered));
        }
    }

    /// Last acknowledged version of a session, if it is still connected.
    pub fn acknowledged(&self, id: SessionId) -> Option<u64> {
        self.inner.lock().sessions.get(&id).map(|s| s.acknowledged)
    }

    pub fn unsubscribe(&self, id: SessionId) {
        if self.inner.lock().sessions.remove(&id).is_some() {
            tracing::debug!(session = %id, "Subscriber disconnected");
        }
    }
}
