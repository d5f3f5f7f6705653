//! Upload Policy
//!
//! Immutable limits shared read-only (behind an `Arc`) by every processor:
//! - Global, per-type and per-category size ceilings
//! - Aggregate batch ceiling and file count ceiling
//! - Allowed content types

use std::collections::HashMap;

use serde::Deserialize;

use super::types::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_UPLOAD_COUNT};

/// Validation policy applied to every upload
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Policy {
    /// Global per-file ceiling in bytes (0 = unlimited)
    pub max_file_size: u64,

    /// Ceiling for the sum of a batch in bytes (0 = unlimited)
    pub max_batch_size: u64,

    /// Maximum files per batch (0 = unlimited)
    pub max_upload_count: usize,

    /// Allowed MIME types; empty allows everything
    pub allowed_types: Vec<String>,

    /// Accept any type regardless of `allowed_types`
    pub allow_unknown_types: bool,

    /// Size ceilings keyed by exact type (`image/png`) or category (`image`)
    pub type_size_limits: HashMap<String, u64>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_upload_count: DEFAULT_MAX_UPLOAD_COUNT,
            allowed_types: Vec::new(),
            allow_unknown_types: false,
            type_size_limits: HashMap::new(),
        }
    }
}

impl Policy {
    /// Most specific size limit for a content type.
    ///
    /// Exact type first, then its category (the part before `/`), then the
    /// global `max_file_size`. Returns `u64::MAX` when nothing applies.
    pub fn effective_size_limit(&self, content_type: &str) -> u64 {
        let essence = essence(content_type);
        let category = essence.split('/').next().unwrap_or_default();

        self.lookup_limit(&essence)
            .or_else(|| self.lookup_limit(category))
            .unwrap_or(match self.max_file_size {
                0 => u64::MAX,
                limit => limit,
            })
    }

    /// Whether a sniffed type passes the allow-list
    pub fn is_type_allowed(&self, content_type: &str) -> bool {
        if self.allow_unknown_types || self.allowed_types.is_empty() {
            return true;
        }
        let wanted = essence(content_type);
        self.allowed_types
            .iter()
            .any(|allowed| essence(allowed) == wanted)
    }

    /// Whether `count` files fit in one batch
    pub fn admits_count(&self, count: usize) -> bool {
        self.max_upload_count == 0 || count <= self.max_upload_count
    }

    /// Whether a batch totalling `total` bytes fits
    pub fn admits_batch_size(&self, total: u64) -> bool {
        self.max_batch_size == 0 || total <= self.max_batch_size
    }

    fn lookup_limit(&self, key: &str) -> Option<u64> {
        self.type_size_limits
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(key))
            .map(|(_, limit)| *limit)
    }
}

/// Lowercased MIME type with parameters (`; charset=...`) removed
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
