//! Artifact and session naming

use std::path::Path;

use rand::Rng;
use uuid::Uuid;

use crate::error::{Result, UploadError};

use super::types::RANDOM_NAME_LEN;

const NAME_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_-";

const MAX_SESSION_ID_LEN: usize = 128;

/// Source of collision-resistant identifiers
pub trait NameGenerator: Send + Sync {
    /// Random artifact stem (no extension)
    fn random_name(&self) -> String;

    /// Fresh chunk session identifier
    fn session_id(&self) -> String;
}

/// Thread-RNG backed generator
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomNames;

impl NameGenerator for RandomNames {
    fn random_name(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..RANDOM_NAME_LEN)
            .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
            .collect()
    }

    fn session_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// Strip directory components from an uploaded name.
///
/// Both `/` and `\` count as separators since names come from arbitrary
/// clients. Empty results and `.`/`..` are rejected.
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." || base.contains('\0') {
        return Err(UploadError::InvalidFileName(name.to_string()));
    }
    Ok(base.to_string())
}

/// Extension including the leading dot, or an empty string
pub fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default()
}

/// Random stem plus the original extension
pub fn renamed(names: &dyn NameGenerator, original: &str) -> String {
    format!("{}{}", names.random_name(), extension_of(original))
}

/// Validate a caller-supplied session ID as a single safe path component
pub fn validate_session_id(session_id: &str) -> Result<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if valid {
        Ok(())
    } else {
        Err(UploadError::InvalidSessionId(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_random_name_shape() {
        let name = RandomNames.random_name();
        assert_eq!(name.len(), RANDOM_NAME_LEN);
        assert!(name.bytes().all(|b| NAME_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_random_names_do_not_collide() {
        let names: HashSet<String> = (0..1000).map(|_| RandomNames.random_name()).collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn test_generated_session_ids_are_valid() {
        let id = RandomNames.session_id();
        assert!(validate_session_id(&id).is_ok());
    }

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt").unwrap(), "a.txt");
        assert_eq!(sanitize_file_name("plain.pdf").unwrap(), "plain.pdf");
    }

    #[test]
    fn test_sanitize_rejects_empty_names() {
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("dir/").is_err());
        assert!(sanitize_file_name("..").is_err());
    }

    #[test]
    fn test_renamed_keeps_extension() {
        let name = renamed(&RandomNames, "photo.jpeg");
        assert!(name.ends_with(".jpeg"));
        assert_eq!(name.len(), RANDOM_NAME_LEN + ".jpeg".len());
        assert_eq!(renamed(&RandomNames, "README").len(), RANDOM_NAME_LEN);
    }

    #[test]
    fn test_session_id_validation() {
        assert!(validate_session_id("abc-123_XYZ").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../escape").is_err());
        assert!(validate_session_id(&"a".repeat(129)).is_err());
    }
}
