//! Database query modules.
//!
//! - registrations: image record CRUD, listing, ratings, flags, tombstones

pub mod registrations;

use chrono::{DateTime, SecondsFormat, Utc};
use galleryd_common::Error;

/// Fixed-width RFC 3339 text so that lexical order equals time order.
pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{raw}': {e}"))
}

/// Map a rusqlite error, treating on-disk corruption as fatal.
pub fn sqlite_error(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::DatabaseCorrupt
                || code.code == rusqlite::ErrorCode::NotADatabase =>
        {
            Error::corruption(e.to_string())
        }
        _ => Error::database(e.to_string()),
    }
}
