//! Core module - shared data model for carving and recovery
//!
//! Records emitted by both engines live here so pollers, persistence
//! callbacks and the CLI all see the same shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// File type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Other,
}

impl FileType {
    /// Determine file type from extension (with or without the leading dot)
    pub fn from_extension(ext: &str) -> Self {
        match ext.trim_start_matches('.').to_lowercase().as_str() {
            // Images
            "jpg" | "jpeg" | "png" | "gif" | "webp" | "bmp" | "ico" | "tiff" | "tif" | "heic"
            | "heif" => FileType::Image,

            // Videos
            "mp4" | "avi" | "mkv" | "mov" | "wmv" | "flv" | "webm" | "m4v" | "mpeg" | "mpg"
            | "3gp" => FileType::Video,

            // Audio
            "mp3" | "flac" | "wav" | "aac" | "ogg" | "m4a" | "wma" | "aiff" | "opus" => {
                FileType::Audio
            }

            // Documents
            "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "odt" | "ods" | "odp"
            | "txt" | "md" | "rtf" | "csv" | "epub" => FileType::Document,

            // Archives
            "zip" | "tar" | "gz" | "7z" | "rar" | "bz2" | "xz" | "cab" | "iso" => {
                FileType::Archive
            }

            _ => FileType::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileType::Image => "image",
            FileType::Video => "video",
            FileType::Audio => "audio",
            FileType::Document => "document",
            FileType::Archive => "archive",
            FileType::Other => "other",
        }
    }
}

/// The four filesystem recovery strategies, in the order they run per volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    DirectoryWalk,
    InodeScan,
    FileSlack,
    RecycleBin,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::DirectoryWalk,
        Strategy::InodeScan,
        Strategy::FileSlack,
        Strategy::RecycleBin,
    ];

    /// Method tag recorded on recovered files
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::DirectoryWalk => "directory_walk",
            Strategy::InodeScan => "inode_scan",
            Strategy::FileSlack => "file_slack",
            Strategy::RecycleBin => "recycle_bin",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        Strategy::ALL
            .into_iter()
            .find(|s| s.as_str().eq_ignore_ascii_case(tag.trim()))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata that survived on the filesystem for a recovered file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Index of the partition the file came from (0 for an unpartitioned image)
    pub partition: usize,
    /// Byte offset of that partition within the image
    pub partition_offset: u64,
    /// Inode number, or the virtual entry address on inode-less filesystems
    pub inode: Option<u64>,
    pub original_name: Option<String>,
    pub original_path: Option<String>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    pub changed: Option<DateTime<Utc>>,
    pub deleted: Option<DateTime<Utc>>,
}

/// A file written to the output area by either engine.
///
/// Written once, never mutated afterwards. A new run clears the output
/// directory, which is the only thing that removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredFile {
    /// Sequential id, strictly increasing within a run
    pub id: u64,
    /// Generated filename inside the output directory
    pub filename: String,
    pub path: PathBuf,
    /// Absolute byte offset of the content within the image
    pub offset: u64,
    pub size: u64,
    /// Hex xxh3 of the size plus head and tail windows
    pub quick_hash: String,
    /// Hex blake3 of the full content
    pub full_hash: String,
    /// Signature name for carved files, strategy tag for filesystem recovery
    pub method: String,
    pub file_type: FileType,
    pub mime: String,
    /// Extension including the leading dot
    pub extension: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceMetadata>,
}

impl RecoveredFile {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Format an image offset the way status records display it (`0x0000ABCD`).
pub fn format_offset(offset: u64) -> String {
    format!("0x{:08X}", offset)
}

/// Persistence hook run after each file is committed to the output directory
pub type FileCallback = Arc<dyn Fn(&RecoveredFile) -> anyhow::Result<()> + Send + Sync>;

/// Run the hook if one is set. Failures are logged and otherwise ignored.
pub(crate) fn notify(callback: Option<&FileCallback>, file: &RecoveredFile) {
    if let Some(callback) = callback {
        if let Err(e) = callback(file) {
            tracing::warn!(file = %file.filename, error = %e, "Persistence callback failed");
        }
    }
}
