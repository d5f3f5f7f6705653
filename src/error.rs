//! Error types for the upload engine

use std::path::PathBuf;

use thiserror::Error;

/// Upload-wide result type
pub type Result<T> = std::result::Result<T, UploadError>;

/// Upload error types
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("File type {detected} is not permitted: {file}")]
    InvalidFileType { file: String, detected: String },

    #[error("File {file} exceeds the maximum allowed size ({size} bytes, max: {limit})")]
    FileSizeExceeded { file: String, size: u64, limit: u64 },

    #[error("Total batch size {total} exceeds the maximum allowed size {max}")]
    BatchSizeExceeded { total: u64, max: u64 },

    #[error("Number of files ({count}) exceeds the maximum allowed ({max})")]
    MaxUploadExceeded { count: usize, max: usize },

    #[error("Content of {file} does not match claimed type {claimed} (detected: {detected})")]
    ContentVerificationFailed {
        file: String,
        claimed: String,
        detected: String,
    },

    #[error("No files were uploaded")]
    NoFileUploaded,

    #[error("Failed to create {}: {source}", path.display())]
    FileCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Validation hook rejected {file}: {reason}")]
    ValidationFailed { file: String, reason: String },

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Duplicate file name in batch: {0}")]
    DuplicateFileName(String),

    #[error("Invalid session ID: {0:?}")]
    InvalidSessionId(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {0} has no metadata yet (chunk 0 not received)")]
    SessionPending(String),

    #[error("Chunk index out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: usize, total: usize },

    #[error("Chunk count mismatch: session expects {expected} chunks, got {actual}")]
    ChunkCountMismatch { expected: usize, actual: usize },

    #[error("Chunk count {total} exceeds the maximum allowed ({max})")]
    TooManyChunks { total: usize, max: usize },

    #[error("Session {session} is missing {missing} chunks (first: {first:?})")]
    MissingChunks {
        session: String,
        missing: usize,
        first: Vec<usize>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid metadata for session {session}: {source}")]
    Metadata {
        session: String,
        #[source]
        source: serde_json::Error,
    },
}

impl UploadError {
    /// Wrap an I/O error with a description of what was being attempted.
    ///
    /// Meant for `map_err`: `.map_err(UploadError::io(format!("reading chunk {i}")))`.
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    /// True when the referenced session does not exist at all
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_))
    }

    /// True when the caller can fix the request; false for storage faults
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::FileCreationFailed { .. } | Self::Io { .. } | Self::Metadata { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_context_in_message() {
        let err = UploadError::io("reading chunk 3 of abc")(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk gone",
        ));
        assert_eq!(err.to_string(), "reading chunk 3 of abc: disk gone");
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_classification() {
        assert!(UploadError::SessionNotFound("x".into()).is_not_found());
        assert!(!UploadError::SessionPending("x".into()).is_not_found());
        assert!(UploadError::NoFileUploaded.is_client_error());
        assert!(UploadError::MaxUploadExceeded { count: 3, max: 2 }.is_client_error());
        assert!(UploadError::TooManyChunks { total: 1 << 40, max: 10 }.is_client_error());
    }

    #[test]
    fn test_missing_chunks_message() {
        let err = UploadError::MissingChunks {
            session: "abc".into(),
            missing: 1_000_000,
            first: vec![1, 2],
        };
        assert_eq!(
            err.to_string(),
            "Session abc is missing 1000000 chunks (first: [1, 2])"
        );
    }
}
