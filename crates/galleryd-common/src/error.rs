//! Error taxonomy shared by every galleryd crate.
//!
//! Per-item failures (hooks, thumbnails) are recovered by their owners and
//! recorded on the record; boundary failures (bad payloads, a saturated queue)
//! are returned to the caller; [`Error::StoreCorruption`] is fatal.

/// Common error type for galleryd.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested record does not exist (or is tombstoned).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input was provided to an operation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A generation event payload failed structural validation.
    #[error("Invalid event payload: {0}")]
    InvalidEventPayload(String),

    /// A file was mid-write or locked; the caller should retry with backoff.
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// A single metadata extractor failed.
    #[error("Hook '{hook}' failed: {message}")]
    HookFailed { hook: String, message: String },

    /// Thumbnail decode or encode failed.
    #[error("Thumbnail generation failed: {0}")]
    ThumbnailFailed(String),

    /// The ingestion queue is full.
    #[error("Ingest queue saturated")]
    QueueSaturated,

    /// An operation exceeded its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The durable store holds data that cannot be decoded.
    #[error("Store corruption: {0}")]
    StoreCorruption(String),

    /// A database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new NotFound error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new InvalidInput error.
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a new InvalidEventPayload error.
    pub fn invalid_payload<S: Into<String>>(msg: S) -> Self {
        Self::InvalidEventPayload(msg.into())
    }

    /// Create a new TransientIo error.
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::TransientIo(msg.into())
    }

    /// Create a new HookFailed error.
    pub fn hook<H: Into<String>, S: Into<String>>(hook: H, msg: S) -> Self {
        Self::HookFailed {
            hook: hook.into(),
            message: msg.into(),
        }
    }

    /// Create a new ThumbnailFailed error.
    pub fn thumbnail<S: Into<String>>(msg: S) -> Self {
        Self::ThumbnailFailed(msg.into())
    }

    /// Create a new Timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a new StoreCorruption error.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Self::StoreCorruption(msg.into())
    }

    /// Create a new Database error.
    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    /// Create a new Internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueSaturated | Self::Timeout(_) | Self::TransientIo(_)
        )
    }

    /// Whether the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreCorruption(_))
    }

    /// HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidInput(_) | Self::InvalidEventPayload(_) => 400,
            Self::ThumbnailFailed(_) => 422,
            Self::QueueSaturated | Self::TransientIo(_) => 503,
            Self::Timeout(_) => 504,
            Self::HookFailed { .. }
            | Self::StoreCorruption(_)
            | Self::Database(_)
            | Self::Io(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::InvalidEventPayload(_) => "invalid_event_payload",
            Self::TransientIo(_) => "transient_io",
            Self::HookFailed { .. } => "hook_failed",
            Self::ThumbnailFailed(_) => "thumbnail_failed",
            Self::QueueSaturated => "queue_saturated",
            Self::Timeout(_) => "timeout",
            Self::StoreCorruption(_) => "store_corruption",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias using the common Error type.
pub type Result<T> = std::result::Result<T, Error>;
