//! Galleryd-Common: shared types, identifiers, errors and path helpers.
//!
//! - **Errors**: the ingestion error taxonomy and its HTTP mapping
//! - **Types**: discovery source, rating, thumbnail status, fingerprints
//! - **IDs**: typed UUID wrappers for subscriber sessions and process instances
//! - **Paths**: image extension checks and root-confined path resolution
//!
//! # Examples
//!
//! ```
//! use galleryd_common::{Error, Rating, Result};
//! use galleryd_common::paths::is_image_file;
//! use std::path::Path;
//!
//! assert!(is_image_file(Path::new("img_001.png")));
//! assert_eq!(Rating::try_from(1).unwrap(), Rating::Like);
//!
//! fn example() -> Result<()> {
//!     Err(Error::not_found("img_001.png"))
//! }
//! assert!(example().is_err());
//! ```

pub mod error;
pub mod ids;
pub mod paths;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
