//! The authoritative registration store.
//!
//! Every mutation runs under one mutex, inside one SQLite transaction, and is
//! published to the [`StateBroadcaster`] before the mutex is released. The
//! state version order is therefore the commit order.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use galleryd_common::{Error, Fingerprint, Rating, Result};
use galleryd_db::pool::{get_conn, DbPool};
use galleryd_db::queries::{registrations as q, sqlite_error};
use galleryd_db::{ImageRecord, Pagination, RecordFilter, RecordSort, RegistrationStats, ThumbnailUpdate};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;

use crate::state::{ProjectionRefresh, StateBroadcaster, StateDiff};

/// Whether an upsert created a record or replaced a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredOutcome {
    Added,
    Updated,
}

/// One page of a listing plus the filtered total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordPage {
    pub records: Vec<ImageRecord>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

pub struct RegistrationStore {
    pool: DbPool,
    write_lock: Mutex<()>,
    broadcaster: Arc<StateBroadcaster>,
}

impl RegistrationStore {
    pub fn new(pool: DbPool, broadcaster: Arc<StateBroadcaster>) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &Arc<StateBroadcaster> {
        &self.broadcaster
    }

    /// Load the broadcaster's projection from disk. Called once at startup.
    pub fn seed_projection(&self) -> Result<()> {
        let conn = get_conn(&self.pool)?;
        let refresh = self.load_refresh(&conn)?;
        self.broadcaster.seed(refresh);
        Ok(())
    }

    fn load_refresh(&self, conn: &Connection) -> Result<ProjectionRefresh> {
        let filter = RecordFilter::default();
        let records = q::list_registrations(
            conn,
            &filter,
            RecordSort::DiscoveredDesc,
            &Pagination {
                offset: 0,
                limit: self.broadcaster.page_size(),
            },
        )?;
        let total = q::count_registrations(conn, &filter)?;
        Ok(ProjectionRefresh { records, total })
    }

    /// Run `write` in a transaction under the write lock; if it yields a diff,
    /// publish it after commit while still holding the lock.
    fn mutate<T>(
        &self,
        write: impl FnOnce(&Connection) -> Result<(T, Option<StateDiff>)>,
    ) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction().map_err(sqlite_error)?;

        let (value, diff) = write(&tx)?;
        let refresh = match diff {
            Some(ref d) if d.changes_membership() => Some(self.load_refresh(&tx)?),
            _ => None,
        };
        tx.commit().map_err(sqlite_error)?;

        if let Some(diff) = diff {
            self.broadcaster.publish(diff, refresh);
        }
        Ok(value)
    }

    fn reload(conn: &Connection, filename: &str) -> Result<ImageRecord> {
        q::get_registration(conn, filename)?
            .ok_or_else(|| Error::not_found(filename.to_string()))
    }

    /// Insert a record or replace the live record with the same filename.
    pub fn upsert(&self, record: &ImageRecord) -> Result<StoredOutcome> {
        self.mutate(|conn| {
            let existed = q::upsert_registration(conn, record)?;
            let stored = Box::new(record.clone());
            Ok(if existed {
                (StoredOutcome::Updated, Some(StateDiff::RecordUpdated(stored)))
            } else {
                (StoredOutcome::Added, Some(StateDiff::RecordAdded(stored)))
            })
        })
    }

    pub fn get(&self, filename: &str) -> Result<Option<ImageRecord>> {
        let conn = get_conn(&self.pool)?;
        q::get_registration(&conn, filename)
    }

    /// Like [`get`](Self::get) but a missing record is [`Error::NotFound`].
    pub fn require(&self, filename: &str) -> Result<ImageRecord> {
        self.get(filename)?
            .ok_or_else(|| Error::not_found(filename.to_string()))
    }

    /// Filtered, sorted page. Rows and total come from one read transaction.
    pub fn list(
        &self,
        filter: &RecordFilter,
        sort: RecordSort,
        offset: u32,
        limit: u32,
    ) -> Result<RecordPage> {
        let mut conn = get_conn(&self.pool)?;
        let tx = conn.transaction().map_err(sqlite_error)?;
        let records = q::list_registrations(&tx, filter, sort, &Pagination { offset, limit })?;
        let total = q::count_registrations(&tx, filter)?;
        tx.commit().map_err(sqlite_error)?;

        Ok(RecordPage {
            records,
            total,
            offset,
            limit,
        })
    }

    pub fn set_rating(&self, filename: &str, rating: Rating) -> Result<ImageRecord> {
        self.mutate(|conn| {
            if !q::set_rating(conn, filename, rating, &Utc::now())? {
                return Err(Error::not_found(filename.to_string()));
            }
            let record = Self::reload(conn, filename)?;
            Ok((record.clone(), Some(StateDiff::RecordUpdated(Box::new(record)))))
        })
    }

    pub fn set_flag(&self, filename: &str, flagged: bool) -> Result<ImageRecord> {
        self.mutate(|conn| {
            if !q::set_flag(conn, filename, flagged, &Utc::now())? {
                return Err(Error::not_found(filename.to_string()));
            }
            let record = Self::reload(conn, filename)?;
            Ok((record.clone(), Some(StateDiff::RecordUpdated(Box::new(record)))))
        })
    }

    pub fn toggle_flag(&self, filename: &str) -> Result<ImageRecord> {
        self.mutate(|conn| {
            let current = Self::reload(conn, filename)?;
            q::set_flag(conn, filename, !current.flagged, &Utc::now())?;
            let record = Self::reload(conn, filename)?;
            Ok((record.clone(), Some(StateDiff::RecordUpdated(Box::new(record)))))
        })
    }

    /// Record a thumbnail outcome for `expected`. Returns `false`, and changes
    /// nothing, when the record no longer carries that fingerprint.
    pub fn mark_thumbnail(
        &self,
        filename: &str,
        expected: &Fingerprint,
        update: ThumbnailUpdate,
    ) -> Result<bool> {
        self.mutate(|conn| {
            if !q::set_thumbnail(conn, filename, expected, &update, &Utc::now())? {
                return Ok((false, None));
            }
            let record = Self::reload(conn, filename)?;
            Ok((true, Some(StateDiff::RecordUpdated(Box::new(record)))))
        })
    }

    /// Attach an external job id to a record that has none.
    pub fn attach_job(&self, filename: &str, job_id: &str) -> Result<bool> {
        self.mutate(|conn| {
            if !q::attach_job(conn, filename, job_id, &Utc::now())? {
                return Ok((false, None));
            }
            let record = Self::reload(conn, filename)?;
            Ok((true, Some(StateDiff::RecordUpdated(Box::new(record)))))
        })
    }

    /// Open the removal grace window. The record stays listed.
    pub fn mark_missing(&self, filename: &str, at: DateTime<Utc>) -> Result<bool> {
        self.mutate(|conn| {
            if !q::mark_missing(conn, filename, &at)? {
                return Ok((false, None));
            }
            let record = Self::reload(conn, filename)?;
            Ok((true, Some(StateDiff::RecordUpdated(Box::new(record)))))
        })
    }

    pub fn clear_missing(&self, filename: &str) -> Result<bool> {
        self.mutate(|conn| {
            if !q::clear_missing(conn, filename, &Utc::now())? {
                return Ok((false, None));
            }
            let record = Self::reload(conn, filename)?;
            Ok((true, Some(StateDiff::RecordUpdated(Box::new(record)))))
        })
    }

    pub fn pending_removals(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let conn = get_conn(&self.pool)?;
        q::pending_removals(&conn)
    }

    /// Soft-delete a record. Returns the record as it was, if it was live.
    pub fn tombstone(&self, filename: &str) -> Result<Option<ImageRecord>> {
        self.mutate(|conn| {
            let Some(record) = q::get_registration(conn, filename)? else {
                return Ok((None, None));
            };
            q::tombstone(conn, filename, &Utc::now())?;
            let diff = StateDiff::RecordRemoved {
                filename: filename.to_string(),
            };
            Ok((Some(record), Some(diff)))
        })
    }

    /// Delete tombstones older than `before`. Invisible rows only, so nothing
    /// is published.
    pub fn purge_tombstones(&self, before: DateTime<Utc>) -> Result<usize> {
        self.mutate(|conn| Ok((q::purge_tombstones(conn, &before)?, None)))
    }

    pub fn stats(&self) -> Result<RegistrationStats> {
        let conn = get_conn(&self.pool)?;
        q::registration_stats(&conn)
    }

    pub fn live_filenames(&self) -> Result<Vec<String>> {
        let conn = get_conn(&self.pool)?;
        q::live_filenames(&conn)
    }

    pub fn live_fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let conn = get_conn(&self.pool)?;
        q::live_fingerprints(&conn)
    }

    pub fn pending_thumbnails(&self) -> Result<Vec<(String, Fingerprint)>> {
        let conn = get_conn(&self.pool)?;
        q::pending_thumbnails(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BroadcastConfig;
    use crate::state::MessageKind;
    use galleryd_common::{DiscoverySource, ThumbnailStatus};
    use galleryd_db::pool::init_memory_pool;
    use serde_json::json;

    fn store() -> RegistrationStore {
        let broadcaster = Arc::new(StateBroadcaster::new(&BroadcastConfig::default()));
        RegistrationStore::new(init_memory_pool().unwrap(), broadcaster)
    }

    fn record(name: &str) -> ImageRecord {
        ImageRecord::new(name, DiscoverySource::Watched, Fingerprint::new("fp1"), Utc::now())
    }

    #[test]
    fn test_every_mutation_bumps_version() {
        let store = store();
        let b = store.broadcaster().clone();
        assert_eq!(b.version(), 0);

        assert_eq!(store.upsert(&record("a.png")).unwrap(), StoredOutcome::Added);
        assert_eq!(b.version(), 1);
        assert_eq!(store.upsert(&record("a.png")).unwrap(), StoredOutcome::Updated);
        assert_eq!(b.version(), 2);

        store.set_rating("a.png", Rating::Like).unwrap();
        store.set_flag("a.png", true).unwrap();
        assert_eq!(b.version(), 4);

        // a no-op mutation publishes nothing
        assert!(!store.clear_missing("a.png").unwrap());
        assert_eq!(b.version(), 4);
    }

    #[test]
    fn test_rating_round_trip() {
        let store = store();
        let mut rec = record("img_001.png");
        rec.metadata.insert("prompt".into(), json!("a cat"));
        store.upsert(&rec).unwrap();

        let updated = store.set_rating("img_001.png", Rating::Like).unwrap();
        assert_eq!(updated.rating, Rating::Like);

        let fetched = store.require("img_001.png").unwrap();
        let body = serde_json::to_value(&fetched).unwrap();
        assert_eq!(body["filename"], "img_001.png");
        assert_eq!(body["rating"], 1);
        assert_eq!(body["metadata"], json!({"prompt": "a cat"}));
    }

    #[test]
    fn test_missing_record_errors() {
        let store = store();
        assert!(matches!(
            store.set_rating("nope.png", Rating::Like),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(store.toggle_flag("nope.png"), Err(Error::NotFound(_))));
        assert_eq!(store.tombstone("nope.png").unwrap(), None);
    }

    #[test]
    fn test_toggle_flag() {
        let store = store();
        store.upsert(&record("a.png")).unwrap();
        assert!(store.toggle_flag("a.png").unwrap().flagged);
        assert!(!store.toggle_flag("a.png").unwrap().flagged);
    }

    #[test]
    fn test_stale_thumbnail_not_applied() {
        let store = store();
        store.upsert(&record("a.png")).unwrap();
        let version = store.broadcaster().version();

        let applied = store
            .mark_thumbnail(
                "a.png",
                &Fingerprint::new("other"),
                ThumbnailUpdate::Ready { path: "x.jpg".into() },
            )
            .unwrap();
        assert!(!applied);
        assert_eq!(store.broadcaster().version(), version);
        assert_eq!(store.require("a.png").unwrap().thumbnail_status, ThumbnailStatus::Pending);
    }

    #[test]
    fn test_tombstone_publishes_removal_and_refreshes_projection() {
        let store = store();
        store.upsert(&record("a.png")).unwrap();
        store.upsert(&record("b.png")).unwrap();
        let mut sub = store.broadcaster().subscribe();
        let _ = sub.rx.try_recv();

        let removed = store.tombstone("a.png").unwrap().unwrap();
        assert_eq!(removed.filename, "a.png");

        let msg = sub.rx.try_recv().unwrap();
        assert_eq!(msg.kind, MessageKind::RecordRemoved);
        assert_eq!(msg.data["filename"], "a.png");

        let snap = store.broadcaster().snapshot();
        assert_eq!(snap.total, 1);
        assert_eq!(snap.records.len(), 1);
        assert_eq!(snap.records[0].filename, "b.png");

        let page = store.list(&RecordFilter::default(), RecordSort::DiscoveredDesc, 0, 10).unwrap();
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_seed_projection() {
        let store = store();
        store.upsert(&record("a.png")).unwrap();
        let fresh = Arc::new(StateBroadcaster::new(&BroadcastConfig::default()));
        let reopened = RegistrationStore::new(store.pool.clone(), fresh.clone());
        reopened.seed_projection().unwrap();
        assert_eq!(fresh.snapshot().total, 1);
        assert_eq!(fresh.version(), 0);
    }
}
