//! Single-Shot Processor
//!
//! Validates and persists one batch of complete files.
//!
//! Batches are atomic. Processing runs in two phases:
//! 1. Count and declared-size checks, then per file: sniff, verify the claimed
//!    type, check the allow-list and size limit, and stage the bytes
//! 2. Promote every staged file and run the validation hook
//!
//! Any failure removes all staged files and every artifact already promoted by
//! the same call, so the caller gets either all artifacts or none.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncReadExt;

use crate::error::{Result, UploadError};

use super::artifact_store::{ensure_dir, ArtifactStore, StagedFile};
use super::naming::{renamed, sanitize_file_name, NameGenerator};
use super::policy::{essence, Policy};
use super::sniff::{read_prefix, verify_content, Sniffer};
use super::types::{CandidateFile, FileSubmission, StoredArtifact, OCTET_STREAM};

/// Post-promotion check; an error removes the artifact and fails the batch
pub type ValidationHook = Arc<dyn Fn(&StoredArtifact) -> anyhow::Result<()> + Send + Sync>;

/// A validated, staged file waiting for phase 2
struct PendingArtifact {
    candidate: CandidateFile,
    new_name: String,
    staged: StagedFile,
}

// ============================================================================
// Processor
// ============================================================================

/// Validates and persists single-shot batches
#[derive(Clone)]
pub struct SingleShotProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    policy: Arc<Policy>,
    sniffer: Arc<dyn Sniffer>,
    names: Arc<dyn NameGenerator>,
    store: ArtifactStore,
    hook: Option<ValidationHook>,
}

impl SingleShotProcessor {
    pub fn new(
        policy: Arc<Policy>,
        sniffer: Arc<dyn Sniffer>,
        names: Arc<dyn NameGenerator>,
        store: ArtifactStore,
        hook: Option<ValidationHook>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                policy,
                sniffer,
                names,
                store,
                hook,
            }),
        }
    }

    /// Validate and persist a batch.
    ///
    /// `destination` defaults to the store's upload directory. With `rename`
    /// each artifact gets a random name plus its original extension; without
    /// it the sanitized original name is kept.
    pub async fn process(
        &self,
        files: Vec<FileSubmission>,
        destination: Option<&Path>,
        rename: bool,
    ) -> Result<Vec<StoredArtifact>> {
        let policy = &self.inner.policy;

        let count = files.len();
        if count == 0 {
            return Err(UploadError::NoFileUploaded);
        }
        if !policy.admits_count(count) {
            return Err(UploadError::MaxUploadExceeded {
                count,
                max: policy.max_upload_count,
            });
        }

        let declared = files.iter().fold(0u64, |sum, f| sum.saturating_add(f.size));
        if !policy.admits_batch_size(declared) {
            return Err(UploadError::BatchSizeExceeded {
                total: declared,
                max: policy.max_batch_size,
            });
        }

        let destination = self.inner.store.resolve_destination(destination);
        ensure_dir(&destination).await?;

        // Phase 1: validate and stage. Dropping `pending` deletes the stages.
        let mut pending = Vec::with_capacity(count);
        let mut names = HashSet::with_capacity(count);
        for file in files {
            let item = self.stage_one(file, &destination, rename).await?;
            if !names.insert(item.new_name.clone()) {
                return Err(UploadError::DuplicateFileName(item.new_name));
            }
            pending.push(item);
        }

        let actual = pending.iter().map(|p| p.staged.size).sum::<u64>();
        if !policy.admits_batch_size(actual) {
            return Err(UploadError::BatchSizeExceeded {
                total: actual,
                max: policy.max_batch_size,
            });
        }

        // Phase 2: promote
        let mut persisted: Vec<StoredArtifact> = Vec::with_capacity(count);
        for item in pending {
            match self.promote_one(item, &destination).await {
                Ok(artifact) => persisted.push(artifact),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        rolled_back = persisted.len(),
                        "Batch failed during promotion, rolling back"
                    );
                    for artifact in &persisted {
                        self.inner.store.remove(&artifact.final_path).await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(
            files = persisted.len(),
            total_size = actual,
            destination = %destination.display(),
            "Batch uploaded"
        );

        Ok(persisted)
    }

    /// Validate and persist a single file
    pub async fn process_one(
        &self,
        file: FileSubmission,
        destination: Option<&Path>,
        rename: bool,
    ) -> Result<StoredArtifact> {
        self.process(vec![file], destination, rename)
            .await?
            .pop()
            .ok_or(UploadError::NoFileUploaded)
    }

    async fn stage_one(
        &self,
        mut file: FileSubmission,
        destination: &Path,
        rename: bool,
    ) -> Result<PendingArtifact> {
        let policy = &self.inner.policy;
        let original_name = sanitize_file_name(&file.name)?;

        let prefix = read_prefix(&mut file.reader)
            .await
            .map_err(UploadError::io(format!("reading header of {original_name}")))?;
        let sniffed_type = self.inner.sniffer.detect(&prefix);

        let candidate = CandidateFile {
            original_name,
            claimed_size: file.size,
            sniffed_type,
        };

        if let Some(claimed) = claimed_type(&file) {
            if !verify_content(&claimed, &candidate.sniffed_type, &prefix) {
                return Err(UploadError::ContentVerificationFailed {
                    file: candidate.original_name,
                    claimed,
                    detected: candidate.sniffed_type,
                });
            }
        }

        if !policy.is_type_allowed(&candidate.sniffed_type) {
            return Err(UploadError::InvalidFileType {
                file: candidate.original_name,
                detected: candidate.sniffed_type,
            });
        }

        let limit = policy.effective_size_limit(&candidate.sniffed_type);
        if candidate.claimed_size > limit {
            return Err(UploadError::FileSizeExceeded {
                file: candidate.original_name,
                size: candidate.claimed_size,
                limit,
            });
        }

        let new_name = if rename {
            renamed(self.inner.names.as_ref(), &candidate.original_name)
        } else {
            candidate.original_name.clone()
        };

        // The prefix was consumed by sniffing; put it back in front of the stream
        let mut reader = std::io::Cursor::new(prefix).chain(file.reader);
        let mut stage = self
            .inner
            .store
            .begin(destination, &candidate.original_name, limit)
            .await?;
        stage.copy_from(&mut reader).await?;
        let staged = stage.finish().await?;

        tracing::debug!(
            file_name = %candidate.original_name,
            sniffed_type = %candidate.sniffed_type,
            size = staged.size,
            "Staged file"
        );

        Ok(PendingArtifact {
            candidate,
            new_name,
            staged,
        })
    }

    async fn promote_one(&self, item: PendingArtifact, destination: &Path) -> Result<StoredArtifact> {
        let final_path = destination.join(&item.new_name);
        let size_bytes = item.staged.size;
        let checksum = item.staged.checksum.clone();

        self.inner.store.promote(item.staged, &final_path).await?;

        let detected_type = match essence(&item.candidate.sniffed_type) {
            t if t.is_empty() => OCTET_STREAM.to_string(),
            t => t,
        };
        let artifact = StoredArtifact {
            new_name: item.new_name,
            original_name: item.candidate.original_name,
            size_bytes,
            detected_type,
            final_path,
            checksum,
        };

        if let Some(hook) = &self.inner.hook {
            if let Err(e) = hook(&artifact) {
                self.inner.store.remove(&artifact.final_path).await;
                return Err(UploadError::ValidationFailed {
                    file: artifact.original_name,
                    reason: format!("{e:#}"),
                });
            }
        }

        Ok(artifact)
    }
}

/// Explicit claim, else a guess from the extension; `None` when neither says anything
fn claimed_type(file: &FileSubmission) -> Option<String> {
    file.claimed_type
        .clone()
        .or_else(|| {
            mime_guess::from_path(&file.name)
                .first()
                .map(|mime| mime.essence_str().to_string())
        })
        .filter(|claimed| essence(claimed) != OCTET_STREAM)
}
