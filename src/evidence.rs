//! Read-only access to evidence images.
//!
//! Images are opened with a plain read handle and memory-mapped. Nothing in
//! the crate writes to an image; a writable source only produces a warning
//! so the examiner knows the original is not write-protected.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::error::{Error, Result};
use crate::fs::{copy_from_slice_at, ImageSource};

/// A memory-mapped disk image
pub struct EvidenceImage {
    path: PathBuf,
    mmap: Mmap,
}

impl std::fmt::Debug for EvidenceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceImage")
            .field("path", &self.path)
            .field("len", &self.mmap.len())
            .finish()
    }
}

impl EvidenceImage {
    pub fn open(path: &Path) -> Result<Self> {
        let image_err = |source: io::Error| Error::Image {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(image_err)?;
        let len = image_len(&file).map_err(image_err)?;
        if len == 0 {
            return Err(Error::EmptyImage(path.to_path_buf()));
        }
        warn_if_writable(path);

        // SAFETY: the mapping is read-only; the image must not be modified
        // externally while mapped.
        let mmap = unsafe { MmapOptions::new().len(len as usize).map(&file) }.map_err(image_err)?;

        tracing::debug!(image = %path.display(), len, "Mapped evidence image");
        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }
}

/// Byte length of an image file. Block devices report a zero metadata
/// length, so those are measured by seeking to the end.
pub(crate) fn image_len(file: &File) -> io::Result<u64> {
    let len = file.metadata()?.len();
    if len > 0 {
        return Ok(len);
    }
    let mut handle = file;
    let end = handle.seek(SeekFrom::End(0))?;
    handle.seek(SeekFrom::Start(0))?;
    Ok(end)
}

impl ImageSource for EvidenceImage {
    fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from_slice_at(&self.mmap, offset, buf))
    }
}

/// Log when the image could be opened for writing
fn warn_if_writable(path: &Path) {
    let writable = OpenOptions::new()
        .write(true)
        .create(false)
        .open(path)
        .is_ok();
    if writable {
        tracing::debug!(
            image = %path.display(),
            "Image is writable; it will only be read, but consider a write-protected copy"
        );
    }
}
