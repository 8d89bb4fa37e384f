//! File signature catalog for carving.
//!
//! Each descriptor names the header magic (or alternatives), an optional
//! footer, size bounds and the structural check the validator applies.
//! Registration order matters: when several formats share a header the
//! carver tries them in this order, so specific containers (DOCX, MOV) are
//! registered ahead of their generic forms (ZIP, MP4 brands).

use std::collections::HashSet;
use std::sync::OnceLock;

use crate::core::FileType;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Structural check applied after the header matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Structure {
    Jpeg,
    Png,
    Gif,
    Pdf,
    Zip,
    /// ZIP container that must hold an entry under this directory prefix
    OfficeZip(&'static str),
    Rtf,
    /// RIFF container with the given form type at offset 8
    Riff(&'static [u8; 4]),
    /// ISO base-media boxes; `quicktime` selects the `qt  ` major brand
    IsoBmff { quicktime: bool },
    Mp3,
}

/// A format descriptor. Immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct SignatureDescriptor {
    /// Unique format name
    pub name: &'static str,
    /// Alternative header byte sequences
    pub headers: &'static [&'static [u8]],
    /// Offset from the start of the file where the header appears
    pub header_offset: usize,
    pub footer: Option<&'static [u8]>,
    /// Upper bound on file size; also bounds footer search
    pub max_size: u64,
    /// Format-specific floor (the carver also applies a global one)
    pub min_size: u64,
    /// Output extension including the dot
    pub extension: &'static str,
    pub file_type: FileType,
    pub structure: Structure,
}

impl SignatureDescriptor {
    /// Lowercased, underscored name used in carved filenames
    pub fn file_tag(&self) -> String {
        self.name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Whether `head` (bytes from the start of a file) carries one of our headers
    pub fn matches_head(&self, head: &[u8]) -> bool {
        self.headers.iter().any(|h| {
            head.len() >= self.header_offset + h.len()
                && &head[self.header_offset..self.header_offset + h.len()] == *h
        })
    }
}

/// Descriptors sharing one header byte sequence, in registration order
#[derive(Debug, Clone)]
pub struct HeaderGroup<'a> {
    pub header: &'static [u8],
    pub header_offset: usize,
    pub candidates: Vec<&'a SignatureDescriptor>,
}

#[derive(Debug, Clone)]
pub struct SignatureCatalog {
    descriptors: Vec<SignatureDescriptor>,
}

impl SignatureCatalog {
    pub fn new(descriptors: Vec<SignatureDescriptor>) -> Self {
        Self { descriptors }
    }

    /// The built-in catalog, constructed once
    pub fn builtin() -> &'static SignatureCatalog {
        static CATALOG: OnceLock<SignatureCatalog> = OnceLock::new();
        CATALOG.get_or_init(|| SignatureCatalog::new(builtin_signatures()))
    }

    pub fn descriptors(&self) -> &[SignatureDescriptor] {
        &self.descriptors
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.iter().map(|d| d.name)
    }

    /// Case-insensitive lookup by format name
    pub fn lookup(&self, name: &str) -> Option<&SignatureDescriptor> {
        let name = name.trim();
        self.descriptors
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Flatten the selected formats into a header index for single-pass scanning.
    ///
    /// Groups come out in registration order and each group's candidates keep
    /// registration order. Unknown names are logged and skipped.
    pub fn all_headers_for<I, S>(&self, selected: I) -> Vec<HeaderGroup<'_>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut wanted: HashSet<&'static str> = HashSet::new();
        for name in selected {
            match self.lookup(name.as_ref()) {
                Some(desc) => {
                    wanted.insert(desc.name);
                }
                None => {
                    tracing::warn!(format = name.as_ref(), "Unknown format, skipping");
                }
            }
        }

        let mut groups: Vec<HeaderGroup<'_>> = Vec::new();
        for desc in self.descriptors.iter().filter(|d| wanted.contains(d.name)) {
            for header in desc.headers {
                match groups
                    .iter_mut()
                    .find(|g| g.header == *header && g.header_offset == desc.header_offset)
                {
                    Some(group) => group.candidates.push(desc),
                    None => groups.push(HeaderGroup {
                        header,
                        header_offset: desc.header_offset,
                        candidates: vec![desc],
                    }),
                }
            }
        }
        groups
    }

    /// First descriptor whose header matches the start of `head`.
    ///
    /// Used as the extension fallback when MIME sniffing gives up.
    pub fn identify(&self, head: &[u8]) -> Option<&SignatureDescriptor> {
        self.descriptors.iter().find(|d| d.matches_head(head))
    }
}

/// All built-in signatures, in registration order
pub fn builtin_signatures() -> Vec<SignatureDescriptor> {
    vec![
        // ====================================================================
        // Images
        // ====================================================================
        SignatureDescriptor {
            name: "JPEG",
            headers: &[&[0xFF, 0xD8, 0xFF]],
            header_offset: 0,
            footer: Some(&[0xFF, 0xD9]),
            max_size: 50 * MIB,
            min_size: 2048,
            extension: ".jpeg",
            file_type: FileType::Image,
            structure: Structure::Jpeg,
        },
        SignatureDescriptor {
            name: "PNG",
            headers: &[&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]],
            header_offset: 0,
            footer: Some(&[0x49, 0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82]),
            max_size: 50 * MIB,
            min_size: 256,
            extension: ".png",
            file_type: FileType::Image,
            structure: Structure::Png,
        },
        SignatureDescriptor {
            name: "GIF",
            headers: &[b"GIF87a", b"GIF89a"],
            header_offset: 0,
            footer: Some(&[0x00, 0x3B]),
            max_size: 20 * MIB,
            min_size: 0,
            extension: ".gif",
            file_type: FileType::Image,
            structure: Structure::Gif,
        },
        // ====================================================================
        // Documents
        // ====================================================================
        SignatureDescriptor {
            name: "PDF",
            headers: &[b"%PDF"],
            header_offset: 0,
            footer: Some(b"%%EOF"),
            max_size: 100 * MIB,
            min_size: 1024,
            extension: ".pdf",
            file_type: FileType::Document,
            structure: Structure::Pdf,
        },
        SignatureDescriptor {
            name: "DOCX",
            headers: &[&ZIP_LOCAL_HEADER],
            header_offset: 0,
            footer: Some(&ZIP_EOCD),
            max_size: 100 * MIB,
            min_size: 4096,
            extension: ".docx",
            file_type: FileType::Document,
            structure: Structure::OfficeZip("word/"),
        },
        SignatureDescriptor {
            name: "XLSX",
            headers: &[&ZIP_LOCAL_HEADER],
            header_offset: 0,
            footer: Some(&ZIP_EOCD),
            max_size: 100 * MIB,
            min_size: 4096,
            extension: ".xlsx",
            file_type: FileType::Document,
            structure: Structure::OfficeZip("xl/"),
        },
        SignatureDescriptor {
            name: "PPTX",
            headers: &[&ZIP_LOCAL_HEADER],
            header_offset: 0,
            footer: Some(&ZIP_EOCD),
            max_size: 200 * MIB,
            min_size: 4096,
            extension: ".pptx",
            file_type: FileType::Document,
            structure: Structure::OfficeZip("ppt/"),
        },
        SignatureDescriptor {
            name: "RTF",
            headers: &[b"{\\rtf"],
            header_offset: 0,
            footer: Some(b"}"),
            max_size: 20 * MIB,
            min_size: 0,
            extension: ".rtf",
            file_type: FileType::Document,
            structure: Structure::Rtf,
        },
        // ====================================================================
        // Archives
        // ====================================================================
        SignatureDescriptor {
            name: "ZIP",
            headers: &[&ZIP_LOCAL_HEADER],
            header_offset: 0,
            footer: Some(&ZIP_EOCD),
            max_size: 500 * MIB,
            min_size: 128,
            extension: ".zip",
            file_type: FileType::Archive,
            structure: Structure::Zip,
        },
        // ====================================================================
        // Audio / Video
        // ====================================================================
        SignatureDescriptor {
            name: "WAV",
            headers: &[b"RIFF"],
            header_offset: 0,
            footer: None,
            max_size: 2 * GIB,
            min_size: 33,
            extension: ".wav",
            file_type: FileType::Audio,
            structure: Structure::Riff(b"WAVE"),
        },
        SignatureDescriptor {
            name: "AVI",
            headers: &[b"RIFF"],
            header_offset: 0,
            footer: None,
            max_size: 2 * GIB,
            min_size: 33,
            extension: ".avi",
            file_type: FileType::Video,
            structure: Structure::Riff(b"AVI "),
        },
        SignatureDescriptor {
            name: "MP4",
            headers: &[b"ftyp"],
            header_offset: 4,
            footer: None,
            max_size: 4 * GIB,
            min_size: 16 * KIB + 1,
            extension: ".mp4",
            file_type: FileType::Video,
            structure: Structure::IsoBmff { quicktime: false },
        },
        SignatureDescriptor {
            name: "MOV",
            headers: &[b"ftyp"],
            header_offset: 4,
            footer: None,
            max_size: 4 * GIB,
            min_size: 16 * KIB + 1,
            extension: ".mov",
            file_type: FileType::Video,
            structure: Structure::IsoBmff { quicktime: true },
        },
        SignatureDescriptor {
            name: "MP3",
            headers: &[b"ID3", &[0xFF, 0xFB], &[0xFF, 0xFA]],
            header_offset: 0,
            footer: None,
            max_size: 50 * MIB,
            min_size: 4097,
            extension: ".mp3",
            file_type: FileType::Audio,
            structure: Structure::Mp3,
        },
    ]
}

/// ZIP local file header magic
pub const ZIP_LOCAL_HEADER: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
/// ZIP end-of-central-directory magic
pub const ZIP_EOCD: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
