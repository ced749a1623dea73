//! Core type definitions for image registrations.
//!
//! Enums serialize in lowercase / snake_case, which is also their database
//! text representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Ordered metadata mapping contributed by hooks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Which producer first reported a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    /// The directory watcher (or the startup scan).
    Watched,
    /// A pushed generation event.
    Event,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Watched => write!(f, "watched"),
            Self::Event => write!(f, "event"),
        }
    }
}

impl FromStr for DiscoverySource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watched" => Ok(Self::Watched),
            "event" => Ok(Self::Event),
            other => Err(Error::invalid_input(format!(
                "unknown discovery source: {other}"
            ))),
        }
    }
}

/// User rating of an image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Rating {
    Dislike,
    #[default]
    Neutral,
    Like,
}

impl Rating {
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Dislike => -1,
            Self::Neutral => 0,
            Self::Like => 1,
        }
    }
}

impl TryFrom<i8> for Rating {
    type Error = Error;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Dislike),
            0 => Ok(Self::Neutral),
            1 => Ok(Self::Like),
            other => Err(Error::invalid_input(format!(
                "rating must be -1, 0 or 1 (got {other})"
            ))),
        }
    }
}

impl From<Rating> for i8 {
    fn from(rating: Rating) -> Self {
        rating.as_i8()
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i8())
    }
}

/// Lifecycle of a record's thumbnail artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailStatus {
    #[default]
    Pending,
    Ready,
    Failed,
}

impl fmt::Display for ThumbnailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ThumbnailStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "failed" => Ok(Self::Failed),
            other => Err(Error::invalid_input(format!(
                "unknown thumbnail status: {other}"
            ))),
        }
    }
}

/// Cheap content-change proxy: a short hex digest of size, mtime and filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard used to spread artifacts across directories.
    pub fn shard(&self) -> &str {
        self.0.get(..2).unwrap_or("00")
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One extractor failure recorded on a record for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailure {
    pub hook: String,
    pub error: String,
}
