//! Registration queries.
//!
//! All functions take a plain `&Connection`; serialization of writers is the
//! caller's job. Tombstoned rows are invisible to every read except
//! [`purge_tombstones`].

use chrono::{DateTime, Utc};
use galleryd_common::{
    DiscoverySource, Error, Fingerprint, HookFailure, Metadata, Rating, Result, ThumbnailStatus,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{named_params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};

use super::{parse_timestamp, sqlite_error, timestamp};
use crate::models::{ImageRecord, RegistrationStats};

const COLUMNS: &str = "filename, source, discovered_at, job_id, metadata, rating, flagged, \
                       fingerprint, thumbnail_status, thumbnail_path, thumbnail_error, \
                       hook_failures, missing_since, updated_at";

/// A predicate over one metadata key.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataPredicate {
    /// The key holds exactly this JSON value.
    Equals {
        key: String,
        value: serde_json::Value,
    },
    /// The key is present (any value, including null).
    Exists { key: String },
}

/// Filter criteria for listing registrations.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFilter {
    pub rating: Option<Rating>,
    pub flagged: Option<bool>,
    pub source: Option<DiscoverySource>,
    pub job_id: Option<String>,
    pub metadata: Vec<MetadataPredicate>,
    /// Include records whose file is missing but still inside the grace window.
    pub include_pending_removal: bool,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            rating: None,
            flagged: None,
            source: None,
            job_id: None,
            metadata: Vec::new(),
            include_pending_removal: true,
        }
    }
}

/// Sort order for listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordSort {
    /// Most recently discovered first.
    #[default]
    DiscoveredDesc,
    DiscoveredAsc,
    Filename,
    /// Liked first, then neutral, then disliked; newest first within a rating.
    RatingDesc,
}

impl RecordSort {
    fn order_by(self) -> &'static str {
        match self {
            Self::DiscoveredDesc => "discovered_at DESC, filename ASC",
            Self::DiscoveredAsc => "discovered_at ASC, filename ASC",
            Self::Filename => "filename ASC",
            Self::RatingDesc => "rating DESC, discovered_at DESC, filename ASC",
        }
    }
}

/// Pagination options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Thumbnail fields written by [`set_thumbnail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbnailUpdate {
    Pending,
    Ready { path: String },
    Failed { error: String },
}

impl ThumbnailUpdate {
    fn status(&self) -> ThumbnailStatus {
        match self {
            Self::Pending => ThumbnailStatus::Pending,
            Self::Ready { .. } => ThumbnailStatus::Ready,
            Self::Failed { .. } => ThumbnailStatus::Failed,
        }
    }
}

struct RawRow {
    filename: String,
    source: String,
    discovered_at: String,
    job_id: Option<String>,
    metadata: String,
    rating: i64,
    flagged: bool,
    fingerprint: String,
    thumbnail_status: String,
    thumbnail_path: Option<String>,
    thumbnail_error: Option<String>,
    hook_failures: String,
    missing_since: Option<String>,
    updated_at: String,
}

fn read_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        filename: row.get(0)?,
        source: row.get(1)?,
        discovered_at: row.get(2)?,
        job_id: row.get(3)?,
        metadata: row.get(4)?,
        rating: row.get(5)?,
        flagged: row.get(6)?,
        fingerprint: row.get(7)?,
        thumbnail_status: row.get(8)?,
        thumbnail_path: row.get(9)?,
        thumbnail_error: row.get(10)?,
        hook_failures: row.get(11)?,
        missing_since: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl RawRow {
    /// Decode column text into a record. Anything undecodable means the
    /// store was written by something other than this crate.
    fn decode(self) -> Result<ImageRecord> {
        let filename = self.filename;
        let bad = |what: String| Error::corruption(format!("registration '{filename}': {what}"));

        let source: DiscoverySource = self.source.parse().map_err(|e: Error| bad(e.to_string()))?;
        let rating = i8::try_from(self.rating)
            .map_err(|_| Error::invalid_input(format!("rating {}", self.rating)))
            .and_then(Rating::try_from)
            .map_err(|e| bad(e.to_string()))?;
        let thumbnail_status: ThumbnailStatus = self
            .thumbnail_status
            .parse()
            .map_err(|e: Error| bad(e.to_string()))?;
        let metadata: Metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| bad(format!("metadata: {e}")))?;
        let hook_failures: Vec<HookFailure> = serde_json::from_str(&self.hook_failures)
            .map_err(|e| bad(format!("hook_failures: {e}")))?;
        let discovered_at = parse_timestamp(&self.discovered_at).map_err(&bad)?;
        let updated_at = parse_timestamp(&self.updated_at).map_err(&bad)?;
        let missing_since = self
            .missing_since
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(&bad)?;

        Ok(ImageRecord {
            filename,
            source,
            discovered_at,
            job_id: self.job_id,
            metadata,
            rating,
            flagged: self.flagged,
            fingerprint: Fingerprint::new(self.fingerprint),
            thumbnail_status,
            thumbnail_path: self.thumbnail_path,
            thumbnail_error: self.thumbnail_error,
            hook_failures,
            missing_since,
            updated_at,
        })
    }
}

fn to_json_text<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::internal(e.to_string()))
}

/// Insert a record or replace every column of an existing one.
///
/// A tombstoned row with the same filename is revived. Returns `true` when a
/// live record already existed.
pub fn upsert_registration(conn: &Connection, record: &ImageRecord) -> Result<bool> {
    let existed = conn
        .query_row(
            "SELECT 1 FROM registrations WHERE filename = ?1 AND tombstoned_at IS NULL",
            [&record.filename],
            |_| Ok(()),
        )
        .optional()
        .map_err(sqlite_error)?
        .is_some();

    let metadata = to_json_text(&record.metadata)?;
    let hook_failures = to_json_text(&record.hook_failures)?;

    conn.execute(
        "INSERT INTO registrations (
            filename, source, discovered_at, job_id, metadata, rating, flagged,
            fingerprint, thumbnail_status, thumbnail_path, thumbnail_error,
            hook_failures, missing_since, tombstoned_at, updated_at
         ) VALUES (
            :filename, :source, :discovered_at, :job_id, :metadata, :rating, :flagged,
            :fingerprint, :thumbnail_status, :thumbnail_path, :thumbnail_error,
            :hook_failures, :missing_since, NULL, :updated_at
         )
         ON CONFLICT(filename) DO UPDATE SET
            source = excluded.source,
            discovered_at = excluded.discovered_at,
            job_id = excluded.job_id,
            metadata = excluded.metadata,
            rating = excluded.rating,
            flagged = excluded.flagged,
            fingerprint = excluded.fingerprint,
            thumbnail_status = excluded.thumbnail_status,
            thumbnail_path = excluded.thumbnail_path,
            thumbnail_error = excluded.thumbnail_error,
            hook_failures = excluded.hook_failures,
            missing_since = excluded.missing_since,
            tombstoned_at = NULL,
            updated_at = excluded.updated_at",
        named_params! {
            ":filename": record.filename,
            ":source": record.source.to_string(),
            ":discovered_at": timestamp(&record.discovered_at),
            ":job_id": record.job_id,
            ":metadata": metadata,
            ":rating": record.rating.as_i8(),
            ":flagged": record.flagged,
            ":fingerprint": record.fingerprint.as_str(),
            ":thumbnail_status": record.thumbnail_status.to_string(),
            ":thumbnail_path": record.thumbnail_path,
            ":thumbnail_error": record.thumbnail_error,
            ":hook_failures": hook_failures,
            ":missing_since": record.missing_since.as_ref().map(timestamp),
            ":updated_at": timestamp(&record.updated_at),
        },
    )
    .map_err(sqlite_error)?;

    Ok(existed)
}

/// Get a live registration by filename.
pub fn get_registration(conn: &Connection, filename: &str) -> Result<Option<ImageRecord>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {COLUMNS} FROM registrations WHERE filename = ?1 AND tombstoned_at IS NULL"
            ),
            [filename],
            read_row,
        )
        .optional()
        .map_err(sqlite_error)?;

    raw.map(RawRow::decode).transpose()
}

/// Build the WHERE clause and its named parameters for a filter.
fn filter_clause(filter: &RecordFilter) -> Result<(String, Vec<(String, SqlValue)>)> {
    let mut clause = String::from(" WHERE tombstoned_at IS NULL");
    let mut params: Vec<(String, SqlValue)> = Vec::new();

    if !filter.include_pending_removal {
        clause.push_str(" AND missing_since IS NULL");
    }
    if let Some(rating) = filter.rating {
        clause.push_str(" AND rating = :rating");
        params.push((":rating".into(), SqlValue::Integer(rating.as_i8().into())));
    }
    if let Some(flagged) = filter.flagged {
        clause.push_str(" AND flagged = :flagged");
        params.push((":flagged".into(), SqlValue::Integer(flagged.into())));
    }
    if let Some(source) = filter.source {
        clause.push_str(" AND source = :source");
        params.push((":source".into(), SqlValue::Text(source.to_string())));
    }
    if let Some(ref job_id) = filter.job_id {
        clause.push_str(" AND job_id = :job_id");
        params.push((":job_id".into(), SqlValue::Text(job_id.clone())));
    }

    for (i, predicate) in filter.metadata.iter().enumerate() {
        let path_param = format!(":mp{i}");
        match predicate {
            MetadataPredicate::Exists { key } => {
                clause.push_str(&format!(" AND json_type(metadata, {path_param}) IS NOT NULL"));
                params.push((path_param, SqlValue::Text(json_path(key)?)));
            }
            MetadataPredicate::Equals { key, value } => {
                let path = SqlValue::Text(json_path(key)?);
                match json_to_sql(value) {
                    None => {
                        clause.push_str(&format!(" AND json_type(metadata, {path_param}) = 'null'"));
                    }
                    Some(sql_value) => {
                        let value_param = format!(":mv{i}");
                        clause.push_str(&format!(
                            " AND json_extract(metadata, {path_param}) = {value_param}"
                        ));
                        params.push((value_param, sql_value));
                    }
                }
                params.push((path_param, path));
            }
        }
    }

    Ok((clause, params))
}

fn json_path(key: &str) -> Result<String> {
    if key.is_empty() || key.contains('"') {
        return Err(Error::invalid_input(format!("invalid metadata key: {key:?}")));
    }
    Ok(format!("$.\"{key}\""))
}

/// The SQL value `json_extract` yields for a JSON value; `None` for null.
fn json_to_sql(value: &serde_json::Value) -> Option<SqlValue> {
    use serde_json::Value;
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer((*b).into())),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        }),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

/// List live registrations matching the filter.
pub fn list_registrations(
    conn: &Connection,
    filter: &RecordFilter,
    sort: RecordSort,
    pagination: &Pagination,
) -> Result<Vec<ImageRecord>> {
    let (clause, mut values) = filter_clause(filter)?;
    let query = format!(
        "SELECT {COLUMNS} FROM registrations{clause} ORDER BY {} LIMIT :limit OFFSET :offset",
        sort.order_by()
    );
    values.push((":limit".into(), SqlValue::Integer(pagination.limit.into())));
    values.push((":offset".into(), SqlValue::Integer(pagination.offset.into())));

    let params: Vec<(&str, &dyn ToSql)> = values
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect();

    let mut stmt = conn.prepare(&query).map_err(sqlite_error)?;
    let rows = stmt
        .query_map(&*params, read_row)
        .map_err(sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sqlite_error)?;

    rows.into_iter().map(RawRow::decode).collect()
}

/// Count live registrations matching the filter.
pub fn count_registrations(conn: &Connection, filter: &RecordFilter) -> Result<u64> {
    let (clause, values) = filter_clause(filter)?;
    let params: Vec<(&str, &dyn ToSql)> = values
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect();

    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM registrations{clause}"),
            &*params,
            |row| row.get(0),
        )
        .map_err(sqlite_error)?;
    Ok(count as u64)
}

/// Set the rating of a live record. Returns `false` if no such record.
pub fn set_rating(
    conn: &Connection,
    filename: &str,
    rating: Rating,
    now: &DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE registrations SET rating = :rating, updated_at = :now
             WHERE filename = :filename AND tombstoned_at IS NULL",
            named_params! {
                ":rating": rating.as_i8(),
                ":now": timestamp(now),
                ":filename": filename,
            },
        )
        .map_err(sqlite_error)?;
    Ok(changed > 0)
}

/// Set the flagged state of a live record. Returns `false` if no such record.
pub fn set_flag(
    conn: &Connection,
    filename: &str,
    flagged: bool,
    now: &DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE registrations SET flagged = :flagged, updated_at = :now
             WHERE filename = :filename AND tombstoned_at IS NULL",
            named_params! {
                ":flagged": flagged,
                ":now": timestamp(now),
                ":filename": filename,
            },
        )
        .map_err(sqlite_error)?;
    Ok(changed > 0)
}

/// Record a thumbnail outcome, but only while the record still carries
/// `expected` as its fingerprint.
///
/// Returns `false` when the record is gone or its content moved on.
pub fn set_thumbnail(
    conn: &Connection,
    filename: &str,
    expected: &Fingerprint,
    update: &ThumbnailUpdate,
    now: &DateTime<Utc>,
) -> Result<bool> {
    let (path, error) = match update {
        ThumbnailUpdate::Pending => (None, None),
        ThumbnailUpdate::Ready { path } => (Some(path.as_str()), None),
        ThumbnailUpdate::Failed { error } => (None, Some(error.as_str())),
    };
    let changed = conn
        .execute(
            "UPDATE registrations
             SET thumbnail_status = :status, thumbnail_path = :path,
                 thumbnail_error = :error, updated_at = :now
             WHERE filename = :filename AND fingerprint = :fingerprint
               AND tombstoned_at IS NULL",
            named_params! {
                ":status": update.status().to_string(),
                ":path": path,
                ":error": error,
                ":now": timestamp(now),
                ":filename": filename,
                ":fingerprint": expected.as_str(),
            },
        )
        .map_err(sqlite_error)?;
    Ok(changed > 0)
}

/// Attach a job id to a live record that has none.
pub fn attach_job(
    conn: &Connection,
    filename: &str,
    job_id: &str,
    now: &DateTime<Utc>,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE registrations SET job_id = :job_id, updated_at = :now
             WHERE filename = :filename AND job_id IS NULL AND tombstoned_at IS NULL",
            named_params! {
                ":job_id": job_id,
                ":now": timestamp(now),
                ":filename": filename,
            },
        )
        .map_err(sqlite_error)?;
    Ok(changed > 0)
}

/// Start the removal grace window. Returns `false` if already pending or absent.
pub fn mark_missing(conn: &Connection, filename: &str, at: &DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE registrations SET missing_since = :at, updated_at = :at
             WHERE filename = :filename AND missing_since IS NULL AND tombstoned_at IS NULL",
            named_params! {
                ":at": timestamp(at),
                ":filename": filename,
            },
        )
        .map_err(sqlite_error)?;
    Ok(changed > 0)
}

/// End the removal grace window. Returns `false` if the record was not pending.
pub fn clear_missing(conn: &Connection, filename: &str, now: &DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE registrations SET missing_since = NULL, updated_at = :now
             WHERE filename = :filename AND missing_since IS NOT NULL AND tombstoned_at IS NULL",
            named_params! {
                ":now": timestamp(now),
                ":filename": filename,
            },
        )
        .map_err(sqlite_error)?;
    Ok(changed > 0)
}

/// Live records inside the removal grace window, oldest first.
pub fn pending_removals(conn: &Connection) -> Result<Vec<(String, DateTime<Utc>)>> {
    let mut stmt = conn
        .prepare(
            "SELECT filename, missing_since FROM registrations
             WHERE missing_since IS NOT NULL AND tombstoned_at IS NULL
             ORDER BY missing_since ASC",
        )
        .map_err(sqlite_error)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sqlite_error)?;

    rows.into_iter()
        .map(|(filename, raw)| {
            let since = parse_timestamp(&raw)
                .map_err(|e| Error::corruption(format!("registration '{filename}': {e}")))?;
            Ok((filename, since))
        })
        .collect()
}

/// Soft-delete a live record. Returns `false` if there was none.
pub fn tombstone(conn: &Connection, filename: &str, at: &DateTime<Utc>) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE registrations SET tombstoned_at = :at, updated_at = :at
             WHERE filename = :filename AND tombstoned_at IS NULL",
            named_params! {
                ":at": timestamp(at),
                ":filename": filename,
            },
        )
        .map_err(sqlite_error)?;
    Ok(changed > 0)
}

/// Hard-delete tombstones older than `before`. Returns the number removed.
pub fn purge_tombstones(conn: &Connection, before: &DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "DELETE FROM registrations WHERE tombstoned_at IS NOT NULL AND tombstoned_at < :before",
        named_params! { ":before": timestamp(before) },
    )
    .map_err(sqlite_error)
}

/// Aggregate counts over live records.
pub fn registration_stats(conn: &Connection) -> Result<RegistrationStats> {
    conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(flagged), 0),
                COALESCE(SUM(rating = 1), 0),
                COALESCE(SUM(rating = -1), 0),
                COALESCE(SUM(missing_since IS NOT NULL), 0),
                COALESCE(SUM(thumbnail_status = 'ready'), 0),
                COALESCE(SUM(thumbnail_status = 'failed'), 0)
         FROM registrations WHERE tombstoned_at IS NULL",
        [],
        |row| {
            Ok(RegistrationStats {
                total: row.get::<_, i64>(0)? as u64,
                flagged: row.get::<_, i64>(1)? as u64,
                liked: row.get::<_, i64>(2)? as u64,
                disliked: row.get::<_, i64>(3)? as u64,
                pending_removal: row.get::<_, i64>(4)? as u64,
                thumbnails_ready: row.get::<_, i64>(5)? as u64,
                thumbnails_failed: row.get::<_, i64>(6)? as u64,
            })
        },
    )
    .map_err(sqlite_error)
}

/// Filenames of all live records.
pub fn live_filenames(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT filename FROM registrations WHERE tombstoned_at IS NULL")
        .map_err(sqlite_error)?;
    let names = stmt
        .query_map([], |row| row.get(0))
        .map_err(sqlite_error)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(sqlite_error)?;
    Ok(names)
}

/// Fingerprints of all live records.
pub fn live_fingerprints(conn: &Connection) -> Result<Vec<Fingerprint>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT fingerprint FROM registrations WHERE tombstoned_at IS NULL")
        .map_err(sqlite_error)?;
    let fps = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sqlite_error)?;
    Ok(fps.into_iter().map(Fingerprint::new).collect())
}

/// Live records whose thumbnail is still pending, as (filename, fingerprint).
pub fn pending_thumbnails(conn: &Connection) -> Result<Vec<(String, Fingerprint)>> {
    let mut stmt = conn
        .prepare(
            "SELECT filename, fingerprint FROM registrations
             WHERE thumbnail_status = 'pending' AND tombstoned_at IS NULL",
        )
        .map_err(sqlite_error)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, Fingerprint::new(row.get::<_, String>(1)?)))
        })
        .map_err(sqlite_error)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(sqlite_error)?;
    Ok(rows)
}
