//! carvex Library
//!
//! Disk image forensics: signature carving over raw bytes, and recovery of
//! deleted files through filesystem metadata, sharing one dedup pipeline.
//!
//! # Features
//!
//! - **Signature carving**: JPEG, PNG, GIF, PDF, Office/ZIP, RTF, WAV/AVI,
//!   MP4/MOV and MP3 with per-format structural validation
//! - **Filesystem recovery**: MBR/GPT partitions, ext2/3/4 and FAT12/16/32,
//!   four strategies (directory walk, inode scan, slack, recycle bins)
//! - **Two-tier dedup**: xxh3 head/tail quick key, blake3 computed while writing
//! - **Evidence tools**: MD5/SHA-1/SHA-256/BLAKE3 image hashing and
//!   printable string extraction
//! - **Pollable status**: lock-light boards with serde snapshots
//!
//! # Example
//!
//! ```no_run
//! use carvex::carve::{CarveOptions, Carver};
//! use std::path::Path;
//!
//! let carver = Carver::new(CarveOptions::default());
//! let status = carver.carve(Path::new("disk.img"), ["JPEG", "PDF"]);
//! println!("Found {} files", status.run.files_found);
//! ```

pub mod carve;
pub mod cli;
pub mod config;
pub mod core;
pub mod dedup;
pub mod error;
pub mod evidence;
pub mod fs;
pub mod hashing;
pub mod output;
pub mod progress;
pub mod recover;
pub mod status;
pub mod strings;

// Re-export commonly used types
pub use carve::signatures::{SignatureCatalog, SignatureDescriptor};
pub use carve::{CarveOptions, Carver};
pub use config::Config;
pub use core::{FileType, RecoveredFile, SourceMetadata, Strategy};
pub use dedup::{Deduplicator, HashingWriter, QuickKey};
pub use error::{Error, Result};
pub use evidence::EvidenceImage;
pub use hashing::{ImageDigests, ImageHasher};
pub use recover::{FilesystemRecoveryEngine, RecoveryOptions};
pub use status::{CarveStatus, CarveStatusBoard, RecoveryStatus, RecoveryStatusBoard};
pub use strings::{StringExtractor, StringsOptions};
