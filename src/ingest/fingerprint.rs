//! Cheap change detection from file metadata.
//!
//! The fingerprint is the first 16 hex characters of SHA-256 over size,
//! modification time and the registration key. The key is mixed in so two
//! files with identical stat data never share a thumbnail artifact.

use std::path::Path;
use std::time::{Duration, UNIX_EPOCH};

use galleryd_common::{Error, Fingerprint, Result};
use sha2::{Digest, Sha256};

const STAT_ATTEMPTS: u32 = 3;
const STAT_BACKOFF: Duration = Duration::from_millis(50);

pub fn from_parts(size: u64, mtime_nanos: u128, filename: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(size.to_le_bytes());
    hasher.update(mtime_nanos.to_le_bytes());
    hasher.update(filename.as_bytes());
    let digest = hasher.finalize();
    Fingerprint::new(hex::encode(&digest[..8]))
}

pub fn from_metadata(meta: &std::fs::Metadata, filename: &str) -> Fingerprint {
    let mtime_nanos = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    from_parts(meta.len(), mtime_nanos, filename)
}

/// Stat a regular file, retrying transient failures with backoff.
///
/// A missing file is [`Error::NotFound`]; anything that keeps failing is
/// [`Error::TransientIo`].
pub async fn stat_file(path: &Path) -> Result<std::fs::Metadata> {
    let mut delay = STAT_BACKOFF;
    let mut attempt = 1;
    loop {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => return Ok(meta),
            Ok(_) => {
                return Err(Error::invalid_input(format!(
                    "not a regular file: {}",
                    path.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("file not found"))
            }
            Err(e) if attempt >= STAT_ATTEMPTS => {
                return Err(Error::transient(format!("{}: {e}", path.display())))
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), attempt, "stat failed, retrying: {}", e);
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
        }
    }
}
