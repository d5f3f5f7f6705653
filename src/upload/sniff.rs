//! Content Sniffing
//!
//! Guesses a MIME type from the leading bytes of a stream, independent of
//! whatever label the uploader attached. Only the first [`SNIFF_LEN`] bytes are
//! ever inspected.
//!
//! The default [`SignatureSniffer`] walks a signature table (markup, documents,
//! images, audio/video, fonts, archives, executables) and falls back to a
//! binary-byte scan to decide between `text/plain` and
//! `application/octet-stream`. Tests swap in a [`FixedSniffer`].

use tokio::io::{AsyncRead, AsyncReadExt};

use super::policy::essence;
use super::types::{OCTET_STREAM, SNIFF_LEN};

pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";
pub const PORTABLE_EXECUTABLE: &str = "application/vnd.microsoft.portable-executable";
pub const ELF_EXECUTABLE: &str = "application/x-elf";

// ============================================================================
// Sniffer Trait
// ============================================================================

/// Content-type detection strategy
pub trait Sniffer: Send + Sync {
    /// Best-guess MIME type for a stream starting with `prefix`
    fn detect(&self, prefix: &[u8]) -> String;
}

/// Sniffer that always answers the same type
#[derive(Debug, Clone)]
pub struct FixedSniffer(pub String);

impl FixedSniffer {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self(content_type.into())
    }
}

impl Sniffer for FixedSniffer {
    fn detect(&self, _prefix: &[u8]) -> String {
        self.0.clone()
    }
}

// ============================================================================
// Signature Sniffer
// ============================================================================

enum Signature {
    /// Exact byte prefix
    Prefix(&'static [u8], &'static str),
    /// `data[i] & mask[i] == pattern[i]` over the pattern length
    Masked {
        mask: &'static [u8],
        pattern: &'static [u8],
        content_type: &'static str,
    },
    /// Case-insensitive HTML tag after leading whitespace, followed by ' ' or '>'
    Html(&'static [u8]),
    /// `<?xml` after leading whitespace
    Xml,
    /// ISO base media file with an mp4 brand
    Mp4,
}

const HTML: &str = "text/html; charset=utf-8";

static SIGNATURES: &[Signature] = &[
    Signature::Html(b"<!DOCTYPE HTML"),
    Signature::Html(b"<HTML"),
    Signature::Html(b"<HEAD"),
    Signature::Html(b"<SCRIPT"),
    Signature::Html(b"<IFRAME"),
    Signature::Html(b"<H1"),
    Signature::Html(b"<DIV"),
    Signature::Html(b"<FONT"),
    Signature::Html(b"<TABLE"),
    Signature::Html(b"<A"),
    Signature::Html(b"<STYLE"),
    Signature::Html(b"<TITLE"),
    Signature::Html(b"<B"),
    Signature::Html(b"<BODY"),
    Signature::Html(b"<BR"),
    Signature::Html(b"<P"),
    Signature::Html(b"<!--"),
    Signature::Xml,
    Signature::Prefix(b"%PDF-", "application/pdf"),
    Signature::Prefix(b"%!PS-Adobe-", "application/postscript"),
    // Byte order marks
    Signature::Prefix(b"\xFE\xFF", "text/plain; charset=utf-16be"),
    Signature::Prefix(b"\xFF\xFE", "text/plain; charset=utf-16le"),
    Signature::Prefix(b"\xEF\xBB\xBF", TEXT_PLAIN_UTF8),
    // Images
    Signature::Prefix(b"\x00\x00\x01\x00", "image/x-icon"),
    Signature::Prefix(b"\x00\x00\x02\x00", "image/x-icon"),
    Signature::Prefix(b"BM", "image/bmp"),
    Signature::Prefix(b"GIF87a", "image/gif"),
    Signature::Prefix(b"GIF89a", "image/gif"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WEBPVP",
        content_type: "image/webp",
    },
    Signature::Prefix(b"\x89PNG\x0D\x0A\x1A\x0A", "image/png"),
    Signature::Prefix(b"\xFF\xD8\xFF", "image/jpeg"),
    // Audio and video
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"FORM\x00\x00\x00\x00AIFF",
        content_type: "audio/aiff",
    },
    Signature::Prefix(b"ID3", "audio/mpeg"),
    Signature::Prefix(b"OggS\x00", "application/ogg"),
    Signature::Prefix(b"MThd\x00\x00\x00\x06", "audio/midi"),
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00AVI ",
        content_type: "video/avi",
    },
    Signature::Masked {
        mask: b"\xFF\xFF\xFF\xFF\x00\x00\x00\x00\xFF\xFF\xFF\xFF",
        pattern: b"RIFF\x00\x00\x00\x00WAVE",
        content_type: "audio/wave",
    },
    Signature::Mp4,
    Signature::Prefix(b"\x1A\x45\xDF\xA3", "video/webm"),
    // Fonts
    Signature::Prefix(b"OTTO", "font/otf"),
    Signature::Prefix(b"\x00\x01\x00\x00", "font/ttf"),
    Signature::Prefix(b"wOFF", "font/woff"),
    Signature::Prefix(b"wOF2", "font/woff2"),
    // Archives
    Signature::Prefix(b"\x1F\x8B\x08", "application/x-gzip"),
    Signature::Prefix(b"PK\x03\x04", "application/zip"),
    Signature::Prefix(b"Rar!\x1A\x07\x00", "application/x-rar-compressed"),
    Signature::Prefix(b"Rar!\x1A\x07\x01\x00", "application/x-rar-compressed"),
    Signature::Prefix(b"7z\xBC\xAF\x27\x1C", "application/x-7z-compressed"),
    Signature::Prefix(b"\x00\x61\x73\x6D\x01\x00\x00\x00", "application/wasm"),
    // Executables
    Signature::Prefix(b"MZ", PORTABLE_EXECUTABLE),
    Signature::Prefix(b"\x7FELF", ELF_EXECUTABLE),
];

impl Signature {
    fn matches(&self, data: &[u8]) -> Option<&'static str> {
        let hit = match self {
            Self::Prefix(pattern, _) => data.starts_with(pattern),
            Self::Masked { mask, pattern, .. } => {
                data.len() >= pattern.len()
                    && data
                        .iter()
                        .zip(mask.iter().zip(pattern.iter()))
                        .all(|(d, (m, p))| d & m == *p)
            }
            Self::Html(tag) => {
                let data = skip_whitespace(data);
                data.len() > tag.len()
                    && data
                        .iter()
                        .zip(tag.iter())
                        .all(|(d, t)| if t.is_ascii_uppercase() { d & 0xDF == *t } else { d == t })
                    && matches!(data[tag.len()], b' ' | b'>')
            }
            Self::Xml => skip_whitespace(data).starts_with(b"<?xml"),
            Self::Mp4 => is_mp4(data),
        };

        hit.then_some(match self {
            Self::Prefix(_, content_type) | Self::Masked { content_type, .. } => *content_type,
            Self::Html(_) => HTML,
            Self::Xml => "text/xml; charset=utf-8",
            Self::Mp4 => "video/mp4",
        })
    }
}

fn skip_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | 0x0C | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn is_mp4(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let box_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if box_size < 12 || box_size % 4 != 0 || data.len() < box_size || &data[4..8] != b"ftyp" {
        return false;
    }
    // Brands are 4 bytes apart; offset 12 holds the minor version
    (8..box_size)
        .step_by(4)
        .filter(|offset| *offset != 12)
        .any(|offset| data.get(offset..offset + 3) == Some(b"mp4".as_slice()))
}

fn is_binary(byte: u8) -> bool {
    matches!(byte, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}

/// Signature-table sniffer
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureSniffer;

impl Sniffer for SignatureSniffer {
    fn detect(&self, prefix: &[u8]) -> String {
        let data = &prefix[..prefix.len().min(SNIFF_LEN)];

        if let Some(content_type) = SIGNATURES.iter().find_map(|sig| sig.matches(data)) {
            return content_type.to_string();
        }

        if data.iter().copied().any(is_binary) {
            OCTET_STREAM.to_string()
        } else {
            TEXT_PLAIN_UTF8.to_string()
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Read up to [`SNIFF_LEN`] bytes from the start of a stream.
///
/// The bytes are consumed; callers chain them back in front of the reader
/// before copying the rest.
pub async fn read_prefix<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = Vec::with_capacity(SNIFF_LEN);
    reader.take(SNIFF_LEN as u64).read_to_end(&mut prefix).await?;
    Ok(prefix)
}

/// Check that sniffed content is consistent with a claimed type.
///
/// Only positive evidence rejects: the generic fallbacks (`text/plain`,
/// `application/octet-stream`) never contradict a claim, except that text
/// must not start with an executable header.
pub fn verify_content(claimed: &str, detected: &str, prefix: &[u8]) -> bool {
    let claimed = essence(claimed);
    let detected = essence(detected);

    if claimed.is_empty() || claimed == OCTET_STREAM {
        return true;
    }

    if claimed == "text/plain" && (prefix.starts_with(b"MZ") || prefix.starts_with(b"\x7FELF")) {
        return false;
    }

    if detected == OCTET_STREAM || detected == "text/plain" || detected.starts_with(&claimed) {
        return true;
    }

    claimed == "text/plain" && (detected.starts_with("text/") || detected == "application/xml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sniff(data: &[u8]) -> String {
        SignatureSniffer.detect(data)
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(sniff(b"hello world"), TEXT_PLAIN_UTF8);
        assert_eq!(sniff(b""), TEXT_PLAIN_UTF8);
    }

    #[test]
    fn test_binary_fallback() {
        assert_eq!(sniff(&[0x01, 0x02, 0x03, 0xFF]), OCTET_STREAM);
    }

    #[test]
    fn test_images() {
        assert_eq!(sniff(b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR"), "image/png");
        assert_eq!(sniff(b"\xFF\xD8\xFF\xE0\x00\x10JFIF"), "image/jpeg");
        assert_eq!(sniff(b"GIF89a\x01\x00"), "image/gif");
        assert_eq!(sniff(b"RIFF\x24\x00\x00\x00WEBPVP8 "), "image/webp");
    }

    #[test]
    fn test_markup_skips_leading_whitespace() {
        assert_eq!(sniff(b"  \n<!DOCTYPE html>\n<html>"), HTML);
        assert_eq!(sniff(b"<p>paragraph</p>"), HTML);
        assert_eq!(sniff(b"<?xml version=\"1.0\"?>"), "text/xml; charset=utf-8");
        // `<pre>` is not an html signature, `<p` must be followed by space or '>'
        assert_eq!(sniff(b"<pre>"), TEXT_PLAIN_UTF8);
    }

    #[test]
    fn test_documents_and_archives() {
        assert_eq!(sniff(b"%PDF-1.7\n"), "application/pdf");
        assert_eq!(sniff(b"PK\x03\x04\x14\x00"), "application/zip");
        assert_eq!(sniff(b"\x1F\x8B\x08\x00"), "application/x-gzip");
    }

    #[test]
    fn test_mp4_brand() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0, 0, 0, 0x18]);
        data.extend_from_slice(b"ftypisom\x00\x00\x02\x00isommp41");
        assert_eq!(sniff(&data), "video/mp4");
    }

    #[test]
    fn test_executables() {
        assert_eq!(sniff(b"MZ\x90\x00\x03\x00"), PORTABLE_EXECUTABLE);
        assert_eq!(sniff(b"\x7FELF\x02\x01\x01"), ELF_EXECUTABLE);
    }

    #[test]
    fn test_verify_rejects_executable_claimed_as_text() {
        let mz = b"MZ\x90\x00";
        assert!(!verify_content("text/plain", &sniff(mz), mz));

        let elf = b"\x7FELF\x02\x01";
        assert!(!verify_content("text/plain", OCTET_STREAM, elf));
    }

    #[test]
    fn test_verify_accepts_consistent_claims() {
        assert!(verify_content("text/plain", TEXT_PLAIN_UTF8, b"hi"));
        assert!(verify_content("text/plain", "text/csv", b"a,b"));
        assert!(verify_content("text/plain", "application/xml", b"<a/>"));
        assert!(verify_content("image/png", OCTET_STREAM, b"\x00\x01"));
        assert!(verify_content("application/octet-stream", "image/png", b"\x89PNG"));
        assert!(verify_content("application/json", TEXT_PLAIN_UTF8, b"{}"));
    }

    #[test]
    fn test_verify_rejects_mismatched_claims() {
        assert!(!verify_content("image/png", "application/pdf", b"%PDF-"));
        assert!(!verify_content("text/plain", "image/png", b"\x89PNG"));
    }

    #[tokio::test]
    async fn test_read_prefix_is_bounded() {
        let data = vec![b'a'; SNIFF_LEN * 3];
        let mut reader = std::io::Cursor::new(data);

        let prefix = read_prefix(&mut reader).await.unwrap();
        assert_eq!(prefix.len(), SNIFF_LEN);
        assert_eq!(reader.position(), SNIFF_LEN as u64);
    }
}
