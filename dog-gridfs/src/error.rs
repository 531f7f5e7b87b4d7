use thiserror::Error;

/// Result type for grid operations
pub type GridResult<T> = Result<T, GridError>;

/// Errors that can occur during upload, finalize and read operations
#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Upload session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Upload session {session_id} is not in progress (status: {status})")]
    SessionNotInProgress { session_id: String, status: String },

    #[error("Chunk {chunk_number} hash mismatch: expected {expected}, computed {actual}")]
    ChunkHashMismatch {
        chunk_number: u64,
        expected: String,
        actual: String,
    },

    #[error("Upload incomplete: {} chunk(s) missing {missing:?}", .missing.len())]
    IncompleteUpload { missing: Vec<u64> },

    #[error("File hash mismatch: expected {expected}, computed {actual}")]
    FileHashMismatch { expected: String, actual: String },

    #[error("Rate limit exceeded: {limit} requests per {window_secs}s")]
    RateLimited { limit: usize, window_secs: u64 },

    #[error("No {slot} slot available within {timeout_ms}ms")]
    SlotUnavailable { slot: &'static str, timeout_ms: u64 },

    #[error("Object not found: {id}")]
    NotFound { id: String },

    #[error("Range start {start} is beyond object length {length}")]
    OutOfRange { start: u64, length: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage backend error: {source}")]
    Backend {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl GridError {
    /// Create a backend error from any error type
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            source: Box::new(error),
        }
    }

    /// Create an invalid argument error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a session not found error
    pub fn session_not_found<S: Into<String>>(session_id: S) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Create a session-state error
    pub fn not_in_progress<S: Into<String>>(session_id: S, status: impl std::fmt::Display) -> Self {
        Self::SessionNotInProgress {
            session_id: session_id.into(),
            status: status.to_string(),
        }
    }

    /// HTTP status a transport should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument { .. } => 400,
            Self::ChunkHashMismatch { .. } => 400,
            Self::SessionNotFound { .. } => 404,
            Self::NotFound { .. } => 404,
            Self::SessionNotInProgress { .. } => 409,
            Self::IncompleteUpload { .. } => 409,
            Self::FileHashMismatch { .. } => 422,
            Self::OutOfRange { .. } => 416,
            Self::RateLimited { .. } => 429,
            Self::SlotUnavailable { .. } => 503,
            Self::Cancelled => 499,
            Self::Backend { .. } | Self::Io { .. } | Self::Serialization { .. } => 500,
        }
    }

    /// Stable kebab-cased error class for clients
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "invalid-argument",
            Self::SessionNotFound { .. } => "session-not-found",
            Self::SessionNotInProgress { .. } => "session-not-in-progress",
            Self::ChunkHashMismatch { .. } => "chunk-hash-mismatch",
            Self::IncompleteUpload { .. } => "incomplete-upload",
            Self::FileHashMismatch { .. } => "file-hash-mismatch",
            Self::RateLimited { .. } => "rate-limited",
            Self::SlotUnavailable { .. } => "slot-unavailable",
            Self::NotFound { .. } => "not-found",
            Self::OutOfRange { .. } => "out-of-range",
            Self::Cancelled => "cancelled",
            Self::Backend { .. } | Self::Io { .. } | Self::Serialization { .. } => "general-error",
        }
    }

    /// Whether re-submitting the same request later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ChunkHashMismatch { .. }
                | Self::IncompleteUpload { .. }
                | Self::RateLimited { .. }
                | Self::SlotUnavailable { .. }
                | Self::Cancelled
                | Self::Backend { .. }
                | Self::Io { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_upload_lists_missing_chunks() {
        let err = GridError::IncompleteUpload { missing: vec![2, 5] };
        assert_eq!(err.to_string(), "Upload incomplete: 2 chunk(s) missing [2, 5]");
        assert_eq!(err.status_code(), 409);
        assert!(err.is_retryable());
    }

    #[test]
    fn backpressure_maps_to_retryable_statuses() {
        let limited = GridError::RateLimited { limit: 10, window_secs: 60 };
        let busy = GridError::SlotUnavailable { slot: "session", timeout_ms: 5000 };
        assert_eq!(limited.status_code(), 429);
        assert_eq!(busy.status_code(), 503);
        assert!(limited.is_retryable() && busy.is_retryable());
    }

    #[test]
    fn state_errors_are_not_retryable() {
        let err = GridError::not_in_progress("ups_1", "Completed");
        assert_eq!(err.class_name(), "session-not-in-progress");
        assert!(!err.is_retryable());
        assert!(!GridError::invalid("bad").is_retryable());
    }
}
