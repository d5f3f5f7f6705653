//! Upload types shared by the single-shot and chunked paths

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::error::{Result, UploadError};

// ============================================================================
// Constants
// ============================================================================

/// Bytes handed to the sniffer
pub const SNIFF_LEN: usize = 512;

/// Length of generated artifact names (extension excluded)
pub const RANDOM_NAME_LEN: usize = 25;

/// Default per-file ceiling: 100MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Default batch ceiling: 1GB
pub const DEFAULT_MAX_BATCH_SIZE: u64 = 1024 * 1024 * 1024;

/// Default files per batch
pub const DEFAULT_MAX_UPLOAD_COUNT: usize = 5;

/// Default chunk size: 1MB
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default ceiling on `total_chunks` for one session
pub const DEFAULT_MAX_CHUNKS: usize = 10_000;

/// Session expiry time: 24 hours
pub const SESSION_EXPIRY_HOURS: i64 = 24;

/// Fallback type when nothing better is known
pub const OCTET_STREAM: &str = "application/octet-stream";

// ============================================================================
// Artifacts
// ============================================================================

/// A durably persisted upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredArtifact {
    /// Name on disk
    pub new_name: String,

    /// Sanitized name the uploader supplied
    pub original_name: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// Sniffed MIME type, parameters stripped
    pub detected_type: String,

    /// Location of the artifact
    pub final_path: PathBuf,

    /// SHA-256 of the artifact bytes (hex)
    pub checksum: String,
}

// ============================================================================
// Single-Shot Submissions
// ============================================================================

/// One incoming file of a single-shot batch
pub struct FileSubmission {
    /// Name as supplied by the uploader (may contain directories)
    pub name: String,

    /// Type the uploader claims; guessed from the extension when absent
    pub claimed_type: Option<String>,

    /// Declared size in bytes
    pub size: u64,

    /// File contents
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileSubmission {
    /// Create a submission from any async reader
    pub fn new(
        name: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            claimed_type: None,
            size,
            reader: Box::new(reader),
        }
    }

    /// Create a submission from an in-memory buffer
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(name, size, std::io::Cursor::new(data))
    }

    /// Create a submission from a file on disk
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(UploadError::io(format!("opening {}", path.display())))?;
        let size = file
            .metadata()
            .await
            .map_err(UploadError::io(format!("reading metadata of {}", path.display())))?
            .len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, size, file))
    }

    /// Attach a claimed content type
    pub fn with_claimed_type(mut self, claimed_type: impl Into<String>) -> Self {
        self.claimed_type = Some(claimed_type.into());
        self
    }
}

impl std::fmt::Debug for FileSubmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSubmission")
            .field("name", &self.name)
            .field("claimed_type", &self.claimed_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Per-file facts gathered while validating one submission
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub original_name: String,
    pub claimed_size: u64,
    pub sniffed_type: String,
}

// ============================================================================
// Chunk Sessions
// ============================================================================

/// Metadata record persisted next to a session's chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    /// Target file name
    pub file_name: String,

    /// Number of chunks the file was split into
    pub total_chunks: usize,

    /// Placeholder until the assembled size is known
    pub file_size: i64,

    /// When chunk 0 was (last) received
    pub upload_time: DateTime<Utc>,
}

impl SessionMetadata {
    pub fn new(file_name: impl Into<String>, total_chunks: usize) -> Self {
        Self {
            file_name: file_name.into(),
            total_chunks,
            file_size: -1,
            upload_time: Utc::now(),
        }
    }
}

/// A chunked upload in progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSession {
    pub session_id: String,
    pub target_file_name: String,
    pub total_chunks: usize,
    pub created_at: DateTime<Utc>,
}

impl ChunkSession {
    pub(crate) fn from_metadata(session_id: &str, metadata: &SessionMetadata) -> Self {
        Self {
            session_id: session_id.to_string(),
            target_file_name: metadata.file_name.clone(),
            total_chunks: metadata.total_chunks,
            created_at: metadata.upload_time,
        }
    }
}
