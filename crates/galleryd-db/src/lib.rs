//! Galleryd-DB: schema, migrations and registration queries.
//!
//! SQLite via rusqlite with r2d2 connection pooling.
//!
//! # Example
//!
//! ```no_run
//! use galleryd_db::pool::{init_pool, get_conn};
//! use galleryd_db::queries::registrations;
//!
//! let pool = init_pool("/var/lib/galleryd/galleryd.db").unwrap();
//! let conn = get_conn(&pool).unwrap();
//!
//! let stats = registrations::registration_stats(&conn).unwrap();
//! println!("{} images", stats.total);
//! ```

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

pub use models::{ImageRecord, RegistrationStats};
pub use queries::registrations::{
    MetadataPredicate, Pagination, RecordFilter, RecordSort, ThumbnailUpdate,
};
