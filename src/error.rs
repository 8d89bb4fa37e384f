//! Crate-level errors.
//!
//! These only surface during run setup. Once a run is going, failures end up
//! in the status board's `error` field rather than a returned `Err`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::fs::FsError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("output directory {path} is not usable: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("refusing to clear {0}: not a dedicated output directory")]
    UnsafeOutputDir(PathBuf),

    #[error("cannot open image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("image {0} is empty")]
    EmptyImage(PathBuf),

    #[error("no valid filesystem found at any partition offset or at offset 0")]
    NoFilesystem,

    #[error("invalid recycle-bin pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
