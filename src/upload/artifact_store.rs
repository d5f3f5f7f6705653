//! Artifact Store
//!
//! Stage-then-promote writer shared by both upload paths:
//! - Bytes are streamed into a hidden staging file (in the temp area when one
//!   is configured, else next to the destination), hashed and size-capped on
//!   the way in, then fsynced
//! - Promotion hard-links the staging file onto the final path, which fails if
//!   anything already lives there; when the temp area is on another filesystem
//!   the bytes are copied to a hidden sibling of the final path first and that
//!   is linked instead, so the final path never holds a partial file
//! - An existing file at the final path is never replaced
//! - A staging file that is dropped without being promoted is deleted

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Result, UploadError};

use super::types::SNIFF_LEN;

const COPY_BUF_SIZE: usize = 64 * 1024;

// ============================================================================
// Artifact Store
// ============================================================================

/// Stage-then-promote file writer
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    upload_dir: PathBuf,
    temp_dir: Option<PathBuf>,
    copy_promotion: bool,
}

impl ArtifactStore {
    pub fn new(upload_dir: impl Into<PathBuf>, temp_dir: Option<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
            temp_dir,
            copy_promotion: false,
        }
    }

    /// Always promote through the copy path
    #[cfg(test)]
    pub(crate) fn with_copy_promotion(mut self) -> Self {
        self.copy_promotion = true;
        self
    }

    /// Default destination directory
    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Explicit destination, else the configured upload directory
    pub fn resolve_destination(&self, destination: Option<&Path>) -> PathBuf {
        destination.unwrap_or(&self.upload_dir).to_path_buf()
    }

    /// Start staging a new artifact bound for `destination`.
    ///
    /// `label` names the file in errors; `limit` caps the number of bytes
    /// the stage accepts.
    pub async fn begin(&self, destination: &Path, label: &str, limit: u64) -> Result<StageWriter> {
        let stage_dir = self.temp_dir.as_deref().unwrap_or(destination);
        ensure_dir(stage_dir).await?;

        let path = stage_dir.join(format!(".stage-{}", Uuid::new_v4().simple()));
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|source| UploadError::FileCreationFailed {
                path: path.clone(),
                source,
            })?;

        Ok(StageWriter {
            file,
            guard: StageGuard::new(path),
            label: label.to_string(),
            limit,
            size: 0,
            hasher: Sha256::new(),
            prefix: Vec::with_capacity(SNIFF_LEN),
        })
    }

    /// Move a staged file onto `final_path`.
    ///
    /// Fails with [`UploadError::FileCreationFailed`] (`AlreadyExists`) when
    /// the final path is taken; the existing file is left untouched.
    pub async fn promote(&self, mut staged: StagedFile, final_path: &Path) -> Result<()> {
        let linked = if self.copy_promotion {
            Err(std::io::Error::other("copy promotion requested"))
        } else {
            tokio::fs::hard_link(staged.path(), final_path).await
        };

        match linked {
            Ok(()) => {}
            Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(UploadError::FileCreationFailed {
                    path: final_path.to_path_buf(),
                    source,
                });
            }
            Err(err) => {
                tracing::debug!(
                    staged = %staged.path().display(),
                    final_path = %final_path.display(),
                    error = %err,
                    "Link failed, promoting by copy"
                );
                copy_into_place(staged.path(), final_path).await?;
            }
        }

        // The artifact is in place; a failed unlink is retried when the guard drops
        if tokio::fs::remove_file(staged.path()).await.is_ok() {
            staged.guard.disarm();
        }

        tracing::debug!(
            final_path = %final_path.display(),
            size = staged.size,
            "Promoted artifact"
        );
        Ok(())
    }

    /// Best-effort removal of a promoted artifact
    pub async fn remove(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove artifact");
            }
        }
    }
}

/// Create a directory and its parents if missing
pub async fn ensure_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| UploadError::FileCreationFailed {
            path: path.to_path_buf(),
            source,
        })
}

/// Copy `src` to a hidden sibling of `final_path`, fsync, then link it into place
async fn copy_into_place(src: &Path, final_path: &Path) -> Result<()> {
    let sibling = final_path.with_file_name(format!(".promote-{}", Uuid::new_v4().simple()));

    let result = async {
        tokio::fs::copy(src, &sibling).await?;
        tokio::fs::File::open(&sibling).await?.sync_all().await?;
        tokio::fs::hard_link(&sibling, final_path).await
    }
    .await;

    let _ = tokio::fs::remove_file(&sibling).await;
    result.map_err(|source| UploadError::FileCreationFailed {
        path: final_path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Staging
// ============================================================================

/// Deletes the staging file on drop unless disarmed
#[derive(Debug)]
struct StageGuard {
    path: PathBuf,
    armed: bool,
}

impl StageGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

// Blocking; runs at most once per staged file, after an upload failed
impl Drop for StageGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// An artifact being written to the staging area
pub struct StageWriter {
    file: tokio::fs::File,
    guard: StageGuard,
    label: String,
    limit: u64,
    size: u64,
    hasher: Sha256,
    prefix: Vec<u8>,
}

impl StageWriter {
    /// Append a block of bytes
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let size = self.size + data.len() as u64;
        if size > self.limit {
            return Err(UploadError::FileSizeExceeded {
                file: self.label.clone(),
                size,
                limit: self.limit,
            });
        }

        if self.prefix.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - self.prefix.len()).min(data.len());
            self.prefix.extend_from_slice(&data[..take]);
        }
        self.hasher.update(data);

        self.file
            .write_all(data)
            .await
            .map_err(UploadError::io(format!("writing staged copy of {}", self.label)))?;
        self.size = size;
        Ok(())
    }

    /// Stream a reader to the end into the stage
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut copied = 0u64;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(UploadError::io(format!("reading {}", self.label)))?;
            if n == 0 {
                return Ok(copied);
            }
            self.write(&buf[..n]).await?;
            copied += n as u64;
        }
    }

    /// Flush and fsync the stage
    pub async fn finish(mut self) -> Result<StagedFile> {
        let context = format!("syncing staged copy of {}", self.label);
        self.file
            .flush()
            .await
            .map_err(UploadError::io(context.clone()))?;
        self.file.sync_all().await.map_err(UploadError::io(context))?;

        Ok(StagedFile {
            guard: self.guard,
            size: self.size,
            checksum: hex::encode(self.hasher.finalize()),
            prefix: self.prefix,
        })
    }
}

/// A fully written, fsynced staging file awaiting promotion
#[derive(Debug)]
pub struct StagedFile {
    guard: StageGuard,
    pub size: u64,
    pub checksum: String,
    /// First bytes of the content, for sniffing
    pub prefix: Vec<u8>,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.guard.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_stage_and_promote() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), None);

        let mut stage = store.begin(dir.path(), "a.txt", 1024).await.unwrap();
        stage.write(b"hello ").await.unwrap();
        stage.write(b"world").await.unwrap();
        let staged = stage.finish().await.unwrap();

        assert_eq!(staged.size, 11);
        assert_eq!(staged.prefix, b"hello world");
        let staged_path = staged.path().to_path_buf();

        let final_path = dir.path().join("a.txt");
        store.promote(staged, &final_path).await.unwrap();

        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"hello world");
        assert!(!staged_path.exists());
    }

    #[tokio::test]
    async fn test_checksum_matches_content() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), None);

        let mut stage = store.begin(dir.path(), "x", u64::MAX).await.unwrap();
        let mut reader = std::io::Cursor::new(b"Hello, World!".to_vec());
        stage.copy_from(&mut reader).await.unwrap();
        let staged = stage.finish().await.unwrap();

        assert_eq!(staged.checksum, hex::encode(Sha256::digest(b"Hello, World!")));
    }

    #[tokio::test]
    async fn test_limit_exceeded_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("temp");
        let store = ArtifactStore::new(dir.path(), Some(temp.clone()));

        let mut stage = store.begin(dir.path(), "big.bin", 4).await.unwrap();
        let mut reader = std::io::Cursor::new(vec![7u8; 10]);
        let result = stage.copy_from(&mut reader).await;
        assert!(matches!(
            result,
            Err(UploadError::FileSizeExceeded { limit: 4, .. })
        ));
        drop(stage);

        let mut entries = tokio::fs::read_dir(&temp).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpromoted_stage_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), None);

        let mut stage = store.begin(dir.path(), "a", 100).await.unwrap();
        stage.write(b"abc").await.unwrap();
        let staged = stage.finish().await.unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());

        drop(staged);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_temp_dir_is_used_for_staging() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("staging");
        let dest = dir.path().join("uploads");
        let store = ArtifactStore::new(&dest, Some(temp.clone()));

        let mut stage = store.begin(&dest, "a", 100).await.unwrap();
        stage.write(b"abc").await.unwrap();
        let staged = stage.finish().await.unwrap();
        assert!(staged.path().starts_with(&temp));

        ensure_dir(&dest).await.unwrap();
        store.promote(staged, &dest.join("a")).await.unwrap();
        assert_eq!(tokio::fs::read(dest.join("a")).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_copy_into_place() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        tokio::fs::write(&src, b"payload").await.unwrap();

        let final_path = dir.path().join("final");
        copy_into_place(&src, &final_path).await.unwrap();
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"payload");

        // Missing parent directory: nothing may appear at the final path
        let bad = dir.path().join("missing").join("final");
        assert!(copy_into_place(&src, &bad).await.is_err());
        assert!(!bad.exists());

        // Taken final path: the copy is discarded and the old file kept
        tokio::fs::write(&src, b"replacement").await.unwrap();
        assert!(copy_into_place(&src, &final_path).await.is_err());
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"payload");
        let mut names = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = read_dir.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["final", "src"]);
    }

    async fn stage_bytes(store: &ArtifactStore, dest: &Path, data: &[u8]) -> StagedFile {
        let mut stage = store.begin(dest, "a", 1024).await.unwrap();
        stage.write(data).await.unwrap();
        stage.finish().await.unwrap()
    }

    #[tokio::test]
    async fn test_promote_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path(), Some(dir.path().join("temp")));
        let final_path = dir.path().join("report.txt");
        tokio::fs::write(&final_path, b"earlier upload").await.unwrap();

        let staged = stage_bytes(&store, dir.path(), b"newer upload").await;
        let staged_path = staged.path().to_path_buf();
        let err = store.promote(staged, &final_path).await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::FileCreationFailed { ref path, ref source }
                if path == &final_path && source.kind() == std::io::ErrorKind::AlreadyExists
        ));
        assert_eq!(tokio::fs::read(&final_path).await.unwrap(), b"earlier upload");
        assert!(!staged_path.exists());
    }

    #[tokio::test]
    async fn test_copy_promotion_removes_stage() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("temp");
        let dest = dir.path().join("uploads");
        let store = ArtifactStore::new(&dest, Some(temp.clone())).with_copy_promotion();
        ensure_dir(&dest).await.unwrap();

        let staged = stage_bytes(&store, &dest, b"copied bytes").await;
        let staged_path = staged.path().to_path_buf();
        store.promote(staged, &dest.join("a")).await.unwrap();

        assert_eq!(tokio::fs::read(dest.join("a")).await.unwrap(), b"copied bytes");
        assert!(!staged_path.exists());
        let mut read_dir = tokio::fs::read_dir(&temp).await.unwrap();
        assert!(read_dir.next_entry().await.unwrap().is_none());
        let mut read_dir = tokio::fs::read_dir(&dest).await.unwrap();
        let only = read_dir.next_entry().await.unwrap().unwrap();
        assert_eq!(only.file_name(), "a");
        assert!(read_dir.next_entry().await.unwrap().is_none());

        // Copy path also refuses a taken final path
        let staged = stage_bytes(&store, &dest, b"second").await;
        assert!(store.promote(staged, &dest.join("a")).await.is_err());
        assert_eq!(tokio::fs::read(dest.join("a")).await.unwrap(), b"copied bytes");
    }
}
