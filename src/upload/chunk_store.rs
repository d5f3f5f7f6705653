//! Chunk Store
//!
//! Durable per-session storage for chunked uploads.
//!
//! Layout under the chunks directory:
//!
//! ```text
//! <session_id>/
//!     0           chunk blobs, named by index
//!     1
//!     ...
//!     metadata    {"fileName", "totalChunks", "fileSize": -1, "uploadTime"}
//! ```
//!
//! Every blob is written to a `.part` sibling, fsynced and renamed into place,
//! so a reader never observes a torn chunk. An in-memory session table mirrors
//! the directory tree and is rebuilt from it by [`ChunkStore::open`]. Writes,
//! assembly and cancellation of one session are serialised by a per-session
//! lock; different sessions never contend.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;

use crate::error::{Result, UploadError};

use super::artifact_store::ensure_dir;
use super::naming::{validate_session_id, NameGenerator};
use super::types::{ChunkSession, SessionMetadata, DEFAULT_MAX_CHUNKS};

/// Name of the metadata record inside a session directory
pub const METADATA_FILE: &str = "metadata";

const PART_SUFFIX: &str = ".part";

/// Missing indices reported by [`SessionEntry::missing`]
const MISSING_PREVIEW: usize = 8;

// ============================================================================
// Session Table
// ============================================================================

/// In-memory view of one session directory
#[derive(Debug, Clone)]
pub(crate) struct SessionEntry {
    /// Present once chunk 0 has been stored
    pub metadata: Option<SessionMetadata>,

    /// Distinct chunk indices on disk
    pub chunks: BTreeSet<usize>,

    /// Last write to the session
    pub last_activity: DateTime<Utc>,
}

impl SessionEntry {
    fn empty() -> Self {
        Self {
            metadata: None,
            chunks: BTreeSet::new(),
            last_activity: Utc::now(),
        }
    }

    /// Distinct indices inside `0..total_chunks`
    pub fn received(&self, total_chunks: usize) -> usize {
        self.chunks.range(..total_chunks).count()
    }

    /// Number of indices inside `0..total_chunks` not yet stored, and the
    /// lowest few of them
    pub fn missing(&self, total_chunks: usize) -> (usize, Vec<usize>) {
        let count = total_chunks - self.received(total_chunks);
        let first = (0..total_chunks)
            .filter(|i| !self.chunks.contains(i))
            .take(MISSING_PREVIEW)
            .collect();
        (count, first)
    }
}

// ============================================================================
// Chunk Store
// ============================================================================

/// Durable chunk storage with an explicit session table
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Root of all session directories
    root: PathBuf,

    /// Session ID source
    names: Arc<dyn NameGenerator>,

    /// Session ID -> session state
    sessions: RwLock<HashMap<String, SessionEntry>>,

    /// Session ID -> exclusive lock, present only while held or awaited
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,

    /// Largest accepted `total_chunks` (0 = unlimited)
    max_chunks: usize,
}

/// Exclusive hold on one session; forgets the lock when nobody else wants it
pub(crate) struct SessionLock {
    guard: Option<OwnedMutexGuard<()>>,
    store: Arc<ChunkStoreInner>,
    session_id: String,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Clones are only taken under the map lock, so a count of one means
        // the map holds the last reference and no task is waiting
        let mut locks = self.store.locks.lock();
        if locks
            .get(&self.session_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.session_id);
        }
    }
}

impl ChunkStore {
    /// Open (or create) a chunks directory and recover its sessions
    pub async fn open(root: impl Into<PathBuf>, names: Arc<dyn NameGenerator>) -> Result<Self> {
        Self::open_with_limit(root, names, DEFAULT_MAX_CHUNKS).await
    }

    /// Like [`ChunkStore::open`], accepting at most `max_chunks` chunks per session
    pub async fn open_with_limit(
        root: impl Into<PathBuf>,
        names: Arc<dyn NameGenerator>,
        max_chunks: usize,
    ) -> Result<Self> {
        let root = root.into();
        ensure_dir(&root).await?;

        let sessions = recover_sessions(&root).await?;
        if !sessions.is_empty() {
            tracing::info!(
                root = %root.display(),
                sessions = sessions.len(),
                "Recovered chunk sessions"
            );
        }

        Ok(Self {
            inner: Arc::new(ChunkStoreInner {
                root,
                names,
                sessions: RwLock::new(sessions),
                locks: Mutex::new(HashMap::new()),
                max_chunks,
            }),
        })
    }

    /// Root of all session directories
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Mint a fresh session ID
    pub fn new_session_id(&self) -> String {
        self.inner.names.session_id()
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.inner.root.join(session_id)
    }

    pub fn chunk_path(&self, session_id: &str, index: usize) -> PathBuf {
        self.session_dir(session_id).join(index.to_string())
    }

    /// Store one chunk.
    ///
    /// Session storage is created on the first write. Re-sending an index
    /// replaces the previous bytes. Metadata is written (or rewritten) only
    /// when `index == 0`.
    pub async fn put_chunk(
        &self,
        session_id: &str,
        index: usize,
        total_chunks: usize,
        target_file_name: &str,
        data: &[u8],
    ) -> Result<()> {
        validate_session_id(session_id)?;
        if index >= total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index,
                total: total_chunks,
            });
        }
        let max = self.inner.max_chunks;
        if max > 0 && total_chunks > max {
            return Err(UploadError::TooManyChunks {
                total: total_chunks,
                max,
            });
        }

        let _guard = self.lock_session(session_id).await;

        let existing = self.entry(session_id).and_then(|e| e.metadata);
        if index != 0 {
            if let Some(expected) = existing.as_ref().map(|m| m.total_chunks) {
                if expected != total_chunks {
                    return Err(UploadError::ChunkCountMismatch {
                        expected,
                        actual: total_chunks,
                    });
                }
            }
        }

        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(UploadError::io(format!("creating storage for session {session_id}")))?;

        write_atomic(&self.chunk_path(session_id, index), data)
            .await
            .map_err(UploadError::io(format!("writing chunk {index} of session {session_id}")))?;

        let metadata = if index == 0 {
            let mut metadata = SessionMetadata::new(target_file_name, total_chunks);
            if let Some(previous) = &existing {
                metadata.upload_time = previous.upload_time;
            }
            let json = serde_json::to_vec(&metadata).map_err(|source| UploadError::Metadata {
                session: session_id.to_string(),
                source,
            })?;
            write_atomic(&dir.join(METADATA_FILE), &json)
                .await
                .map_err(UploadError::io(format!("writing metadata of session {session_id}")))?;
            Some(metadata)
        } else {
            None
        };

        {
            let mut sessions = self.inner.sessions.write();
            let entry = sessions
                .entry(session_id.to_string())
                .or_insert_with(SessionEntry::empty);
            entry.chunks.insert(index);
            entry.last_activity = Utc::now();
            if metadata.is_some() {
                entry.metadata = metadata;
            }
        }

        tracing::debug!(
            session_id = %session_id,
            chunk_index = index,
            total_chunks = total_chunks,
            size = data.len(),
            "Stored chunk"
        );

        Ok(())
    }

    /// Look up a session with metadata
    pub fn session(&self, session_id: &str) -> Result<ChunkSession> {
        validate_session_id(session_id)?;
        let entry = self
            .entry(session_id)
            .ok_or_else(|| UploadError::SessionNotFound(session_id.to_string()))?;
        let metadata = entry
            .metadata
            .as_ref()
            .ok_or_else(|| UploadError::SessionPending(session_id.to_string()))?;
        Ok(ChunkSession::from_metadata(session_id, metadata))
    }

    /// Distinct chunk indices stored for a session
    pub fn stored_indices(&self, session_id: &str) -> Vec<usize> {
        self.entry(session_id)
            .map(|e| e.chunks.into_iter().collect())
            .unwrap_or_default()
    }

    pub(crate) fn entry(&self, session_id: &str) -> Option<SessionEntry> {
        self.inner.sessions.read().get(session_id).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, SessionEntry)> {
        self.inner
            .sessions
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Acquire the exclusive lock of a session
    pub(crate) async fn lock_session(&self, session_id: &str) -> SessionLock {
        let lock = {
            let mut locks = self.inner.locks.lock();
            locks.entry(session_id.to_string()).or_default().clone()
        };
        SessionLock {
            guard: Some(lock.lock_owned().await),
            store: self.inner.clone(),
            session_id: session_id.to_string(),
        }
    }

    /// Number of session locks currently tracked
    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.inner.locks.lock().len()
    }

    /// Delete a session's chunks and metadata. Caller holds the session lock.
    ///
    /// Returns whether anything existed.
    pub(crate) async fn erase(&self, session_id: &str) -> Result<bool> {
        let known = self.inner.sessions.write().remove(session_id).is_some();

        let dir = self.session_dir(session_id);
        let on_disk = match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(UploadError::io(format!("removing storage of session {session_id}"))(e))
            }
        };

        Ok(known || on_disk)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Write `data` to `<path>.part`, fsync, then rename over `path`
async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut part = path.as_os_str().to_owned();
    part.push(PART_SUFFIX);
    let part = PathBuf::from(part);

    let result = async {
        let mut file = tokio::fs::File::create(&part).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&part, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&part).await;
    }
    result
}

/// Rebuild the session table from the directory tree
async fn recover_sessions(root: &Path) -> Result<HashMap<String, SessionEntry>> {
    let mut sessions = HashMap::new();
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(UploadError::io(format!("scanning {}", root.display())))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(UploadError::io(format!("scanning {}", root.display())))?
    {
        let path = entry.path();
        let is_dir = entry
            .file_type()
            .await
            .map_err(UploadError::io(format!("scanning {}", path.display())))?
            .is_dir();
        if !is_dir {
            continue;
        }
        let session_id = entry.file_name().to_string_lossy().into_owned();
        if validate_session_id(&session_id).is_err() {
            tracing::warn!(path = %path.display(), "Skipping unrecognised directory in chunk store");
            continue;
        }

        match recover_session(&session_id, &path).await {
            Ok(session) => {
                sessions.insert(session_id, session);
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to recover session");
            }
        }
    }

    Ok(sessions)
}

async fn recover_session(session_id: &str, dir: &Path) -> Result<SessionEntry> {
    let mut session = SessionEntry::empty();
    let context = || format!("scanning session {session_id}");

    let mut entries = tokio::fs::read_dir(dir).await.map_err(UploadError::io(context()))?;
    while let Some(entry) = entries.next_entry().await.map_err(UploadError::io(context()))? {
        let name = entry.file_name().to_string_lossy().into_owned();

        if name.ends_with(PART_SUFFIX) {
            // Interrupted write
            let _ = tokio::fs::remove_file(entry.path()).await;
        } else if name == METADATA_FILE {
            session.metadata = read_metadata(session_id, &entry.path()).await;
        } else if let Ok(index) = name.parse::<usize>() {
            session.chunks.insert(index);
        }
    }

    if let Ok(modified) = tokio::fs::metadata(dir).await.and_then(|m| m.modified()) {
        session.last_activity = DateTime::<Utc>::from(modified);
    }

    Ok(session)
}

async fn read_metadata(session_id: &str, path: &Path) -> Option<SessionMetadata> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice::<SessionMetadata>(&bytes) {
        Ok(metadata) if metadata.total_chunks > 0 => Some(metadata),
        Ok(_) => {
            tracing::warn!(session_id = %session_id, "Ignoring metadata with zero chunks");
            None
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Ignoring unreadable metadata");
            None
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
