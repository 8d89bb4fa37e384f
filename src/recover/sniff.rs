//! Extension and MIME detection for recovered content.
//!
//! Filesystem candidates often arrive without a usable name, so the
//! extension comes from the bytes first and the surviving name last.

use std::path::Path;

use crate::carve::signatures::SignatureCatalog;

const FALLBACK_EXTENSION: &str = ".bin";
const OCTET_STREAM: &str = "application/octet-stream";

/// Where a detected extension came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedBy {
    Magic,
    Signature,
    OriginalName,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Extension including the leading dot
    pub extension: String,
    pub mime: String,
    pub source: DetectedBy,
}

/// Pick an extension for `head`, trying in order: magic-byte MIME
/// sniffing, the signature catalog, the original name's extension, `.bin`.
pub fn detect(head: &[u8], original_name: Option<&str>, catalog: &SignatureCatalog) -> Detection {
    if let Some(kind) = infer::get(head) {
        return Detection {
            extension: format!(".{}", kind.extension()),
            mime: kind.mime_type().to_string(),
            source: DetectedBy::Magic,
        };
    }

    if let Some(desc) = catalog.identify(head) {
        return Detection {
            extension: desc.extension.to_string(),
            mime: mime_for_extension(desc.extension),
            source: DetectedBy::Signature,
        };
    }

    if let Some(ext) = original_name.and_then(name_extension) {
        return Detection {
            mime: mime_for_extension(&ext),
            extension: ext,
            source: DetectedBy::OriginalName,
        };
    }

    Detection {
        extension: FALLBACK_EXTENSION.to_string(),
        mime: OCTET_STREAM.to_string(),
        source: DetectedBy::Fallback,
    }
}

/// MIME type for an extension (dot optional), octet-stream when unknown
pub fn mime_for_extension(ext: &str) -> String {
    mime_guess::from_ext(ext.trim_start_matches('.'))
        .first_raw()
        .unwrap_or(OCTET_STREAM)
        .to_string()
}

/// Lowercased extension of a surviving filename, if it looks like one
fn name_extension(name: &str) -> Option<String> {
    let ext = Path::new(name).extension()?.to_str()?;
    if ext.is_empty() || ext.len() > 8 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carve::signatures::{SignatureDescriptor, Structure};
    use crate::core::FileType;

    #[test]
    fn magic_bytes_win() {
        let head = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];
        let found = detect(&head, Some("report.txt"), SignatureCatalog::builtin());
        assert_eq!(found.extension, ".png");
        assert_eq!(found.mime, "image/png");
        assert_eq!(found.source, DetectedBy::Magic);
    }

    #[test]
    fn catalog_catches_what_magic_misses() {
        let catalog = SignatureCatalog::new(vec![SignatureDescriptor {
            name: "CVX",
            headers: &[b"CVXDATA1"],
            header_offset: 0,
            footer: None,
            max_size: 1024,
            min_size: 0,
            extension: ".cvx",
            file_type: FileType::Other,
            structure: Structure::Rtf,
        }]);
        let found = detect(b"CVXDATA1 payload", Some("x.txt"), &catalog);
        assert_eq!(found.extension, ".cvx");
        assert_eq!(found.source, DetectedBy::Signature);
    }

    #[test]
    fn surviving_name_then_bin() {
        let text = b"plain words with nothing magic about them";
        let found = detect(text, Some("_OTES.TXT"), SignatureCatalog::builtin());
        assert_eq!(found.extension, ".txt");
        assert_eq!(found.mime, "text/plain");
        assert_eq!(found.source, DetectedBy::OriginalName);

        let found = detect(text, Some("noext"), SignatureCatalog::builtin());
        assert_eq!(found.extension, ".bin");
        assert_eq!(found.mime, "application/octet-stream");

        let found = detect(text, None, SignatureCatalog::builtin());
        assert_eq!(found.source, DetectedBy::Fallback);
    }

    #[test]
    fn mime_lookup_accepts_dotted_extensions() {
        assert_eq!(mime_for_extension(".jpeg"), "image/jpeg");
        assert_eq!(mime_for_extension("pdf"), "application/pdf");
        assert_eq!(mime_for_extension(".nope-nope"), "application/octet-stream");
    }
}
