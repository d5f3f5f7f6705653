//! Chunk Assembler
//!
//! Rebuilds the final artifact of a chunked upload once every index is present.
//! Chunks are appended in index order into a staging file, the result is
//! sniffed and checked against the policy, then promoted and the session's
//! chunk storage is deleted.
//!
//! Failures before promotion leave the session untouched, so a caller can
//! upload the missing chunks and retry, or cancel.

use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, UploadError};

use super::artifact_store::{ensure_dir, ArtifactStore};
use super::chunk_store::ChunkStore;
use super::naming::{renamed, sanitize_file_name, validate_session_id, NameGenerator};
use super::policy::{essence, Policy};
use super::sniff::Sniffer;
use super::types::{StoredArtifact, OCTET_STREAM};

/// Turns complete chunk sessions into artifacts
#[derive(Clone)]
pub struct ChunkAssembler {
    inner: Arc<AssemblerInner>,
}

struct AssemblerInner {
    chunks: ChunkStore,
    store: ArtifactStore,
    policy: Arc<Policy>,
    sniffer: Arc<dyn Sniffer>,
    names: Arc<dyn NameGenerator>,
}

impl ChunkAssembler {
    pub fn new(
        chunks: ChunkStore,
        store: ArtifactStore,
        policy: Arc<Policy>,
        sniffer: Arc<dyn Sniffer>,
        names: Arc<dyn NameGenerator>,
    ) -> Self {
        Self {
            inner: Arc::new(AssemblerInner {
                chunks,
                store,
                policy,
                sniffer,
                names,
            }),
        }
    }

    /// Assemble a session into its final artifact.
    ///
    /// An empty `original_file_name` falls back to the name recorded with
    /// chunk 0. `destination` defaults to the store's upload directory.
    pub async fn complete(
        &self,
        session_id: &str,
        original_file_name: &str,
        destination: Option<&Path>,
    ) -> Result<StoredArtifact> {
        validate_session_id(session_id)?;
        let chunks = &self.inner.chunks;
        let _guard = chunks.lock_session(session_id).await;

        let entry = chunks
            .entry(session_id)
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
        let metadata = entry
            .metadata
            .as_ref()
            .ok_or_else(|| UploadError::SessionPending(session_id.to_string()))?;
        let total_chunks = metadata.total_chunks;

        let (missing, first) = entry.missing(total_chunks);
        if missing > 0 {
            return Err(UploadError::MissingChunks {
                session: session_id.to_string(),
                missing,
                first,
            });
        }

        let destination = self.inner.store.resolve_destination(destination);
        ensure_dir(&destination).await?;

        let original_name = if original_file_name.trim().is_empty() {
            metadata.file_name.as_str()
        } else {
            original_file_name
        };
        let new_name = self.output_name(original_name);

        // Type and limit are only known after sniffing, so the stage is uncapped
        let mut stage = self
            .inner
            .store
            .begin(&destination, &new_name, u64::MAX)
            .await?;
        for index in 0..total_chunks {
            let path = chunks.chunk_path(session_id, index);
            let mut chunk = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(UploadError::MissingChunks {
                        session: session_id.to_string(),
                        missing: 1,
                        first: vec![index],
                    });
                }
                Err(e) => {
                    return Err(UploadError::io(format!(
                        "opening chunk {index} of session {session_id}"
                    ))(e))
                }
            };
            stage.copy_from(&mut chunk).await?;
        }
        let staged = stage.finish().await?;

        let detected = if staged.prefix.is_empty() {
            OCTET_STREAM.to_string()
        } else {
            self.inner.sniffer.detect(&staged.prefix)
        };

        let policy = &self.inner.policy;
        if !policy.is_type_allowed(&detected) {
            return Err(UploadError::InvalidFileType {
                file: original_name.to_string(),
                detected,
            });
        }
        let limit = policy.effective_size_limit(&detected);
        if staged.size > limit {
            return Err(UploadError::FileSizeExceeded {
                file: original_name.to_string(),
                size: staged.size,
                limit,
            });
        }

        let final_path = destination.join(&new_name);
        let size_bytes = staged.size;
        let checksum = staged.checksum.clone();
        self.inner.store.promote(staged, &final_path).await?;

        if let Err(e) = chunks.erase(session_id).await {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Failed to clean up chunks after assembly"
            );
        }

        let detected_type = match essence(&detected) {
            t if t.is_empty() => OCTET_STREAM.to_string(),
            t => t,
        };

        tracing::info!(
            session_id = %session_id,
            file_name = %new_name,
            total_chunks = total_chunks,
            size = size_bytes,
            detected_type = %detected_type,
            "Assembled chunked upload"
        );

        Ok(StoredArtifact {
            new_name,
            original_name: original_name.to_string(),
            size_bytes,
            detected_type,
            final_path,
            checksum,
        })
    }

    /// Sanitized original name, or a random one when the name is unusable or hidden
    fn output_name(&self, original: &str) -> String {
        let names = self.inner.names.as_ref();
        match sanitize_file_name(original) {
            Ok(name) if !name.starts_with('.') => name,
            Ok(name) => renamed(names, &name),
            Err(_) => names.random_name(),
        }
    }
}
