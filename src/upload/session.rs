//! Session Registry
//!
//! Read and lifecycle operations over the chunk store's session table:
//! - Progress as the share of distinct chunk indices present
//! - Listing of sessions whose chunk 0 (and so metadata) has arrived
//! - Cancellation, and expiry of idle sessions by a background reaper

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, UploadError};

use super::chunk_store::ChunkStore;
use super::naming::validate_session_id;
use super::types::ChunkSession;

/// Snapshot of one session's progress
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    #[serde(flatten)]
    pub session: ChunkSession,
    pub received_chunks: usize,
    pub percent: f64,
    pub last_activity: DateTime<Utc>,
}

// ============================================================================
// Session Registry
// ============================================================================

/// Progress, listing, cancellation and expiry of chunk sessions
#[derive(Clone)]
pub struct SessionRegistry {
    chunks: ChunkStore,
}

impl SessionRegistry {
    pub fn new(chunks: ChunkStore) -> Self {
        Self { chunks }
    }

    /// Percentage in `[0, 100]` of distinct chunk indices received
    pub fn progress(&self, session_id: &str) -> Result<f64> {
        let session = self.chunks.session(session_id)?;
        let received = self
            .chunks
            .entry(session_id)
            .map(|e| e.received(session.total_chunks))
            .unwrap_or_default();
        Ok(percent(received, session.total_chunks))
    }

    /// IDs of sessions with metadata, sorted
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .chunks
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| entry.metadata.is_some())
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Progress of every listed session, sorted by creation time
    pub fn sessions(&self) -> Vec<SessionProgress> {
        let mut sessions: Vec<SessionProgress> = self
            .chunks
            .snapshot()
            .into_iter()
            .filter_map(|(id, entry)| {
                let metadata = entry.metadata.as_ref()?;
                let received = entry.received(metadata.total_chunks);
                Some(SessionProgress {
                    session: ChunkSession::from_metadata(&id, metadata),
                    received_chunks: received,
                    percent: percent(received, metadata.total_chunks),
                    last_activity: entry.last_activity,
                })
            })
            .collect();
        sessions.sort_by(|a, b| a.session.created_at.cmp(&b.session.created_at));
        sessions
    }

    /// Delete every chunk and the metadata of a session
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        let _guard = self.chunks.lock_session(session_id).await;

        if !self.chunks.erase(session_id).await? {
            return Err(UploadError::SessionNotFound(session_id.to_string()));
        }

        tracing::info!(session_id = %session_id, "Chunk session cancelled");
        Ok(())
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Cancel sessions idle for longer than `ttl`.
    ///
    /// Pending sessions expire too. Returns the number of sessions removed.
    pub async fn reap_expired(&self, ttl: chrono::Duration) -> usize {
        let cutoff = Utc::now() - ttl;
        let expired: Vec<String> = self
            .chunks
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| entry.last_activity < cutoff)
            .map(|(id, _)| id)
            .collect();

        let mut count = 0;
        for id in expired {
            let _guard = self.chunks.lock_session(&id).await;

            // A chunk may have arrived since the snapshot
            let still_idle = self
                .chunks
                .entry(&id)
                .is_some_and(|entry| entry.last_activity < cutoff);
            if !still_idle {
                continue;
            }

            match self.chunks.erase(&id).await {
                Ok(_) => {
                    tracing::debug!(session_id = %id, "Reaped idle chunk session");
                    count += 1;
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Failed to reap chunk session");
                }
            }
        }

        if count > 0 {
            tracing::info!(count = count, "Reaped idle chunk sessions");
        }

        count
    }

    /// Start the background reaper
    pub fn start_reaper_task(
        self,
        every: Duration,
        ttl: chrono::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                self.reap_expired(ttl).await;
            }
        })
    }
}

fn percent(received: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (received as f64 / total as f64 * 100.0).min(100.0)
}
