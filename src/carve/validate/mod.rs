//! Content validation for carve candidates.
//!
//! Given the mapped image and a candidate start, decide whether the bytes
//! really are the claimed format and where the file ends. A mismatch is a
//! normal negative result ([`Verdict::Reject`]); only out-of-bounds input is
//! an error.

mod footer;
pub(crate) mod isobmff;
pub(crate) mod mp3;
pub(crate) mod riff;
pub(crate) mod rtf;
pub(crate) mod zip;

use image::ImageFormat;
use memchr::memmem;
use thiserror::Error;

use super::signatures::{SignatureDescriptor, Structure};
use footer::FooterSearch;

/// Why a candidate was turned down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The format's footer never appears within its size bound
    NoFooter,
    /// The region is under the format's floor
    TooSmall,
    /// Header and bounds matched but the structure check failed
    Invalid(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Region `[start, end)` in image coordinates
    Accept { end: u64 },
    Reject(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accept { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("candidate offset {offset} is outside the image ({len} bytes)")]
    OutOfBounds { offset: u64, len: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOptions {
    /// Fully decode image candidates with the `image` crate
    pub decode_images: bool,
}

/// Per-format structural validator
#[derive(Debug, Clone, Default)]
pub struct ContentValidator {
    options: ValidationOptions,
}

impl ContentValidator {
    pub fn new(options: ValidationOptions) -> Self {
        Self { options }
    }

    /// Validate a candidate of format `desc` starting at `start`.
    ///
    /// `start` is where the file begins, which for formats with a header
    /// offset (MP4's `ftyp`) lies before the matched header bytes.
    pub fn validate(
        &self,
        desc: &SignatureDescriptor,
        image: &[u8],
        start: usize,
    ) -> Result<Verdict, ValidationError> {
        if start >= image.len() {
            return Err(ValidationError::OutOfBounds {
                offset: start as u64,
                len: image.len() as u64,
            });
        }
        let limit = image
            .len()
            .min(start.saturating_add(usize::try_from(desc.max_size).unwrap_or(usize::MAX)));
        let window = &image[start..limit];

        let outcome = match desc.structure {
            Structure::Jpeg => self.footer_delimited(desc, window, Some(ImageFormat::Jpeg)),
            Structure::Png => self
                .footer_delimited(desc, window, Some(ImageFormat::Png))
                .and_then(|end| check_png_chunks(&window[..end]).map(|_| end)),
            Structure::Gif => self.footer_delimited(desc, window, Some(ImageFormat::Gif)),
            Structure::Pdf => validate_pdf(desc, window),
            Structure::Zip => validate_zip(desc, window, None),
            Structure::OfficeZip(prefix) => validate_zip(desc, window, Some(prefix)),
            Structure::Rtf => validate_rtf(desc, window),
            Structure::Riff(form) => riff::region_len(window, form),
            Structure::IsoBmff { quicktime } => validate_isobmff(desc, window, quicktime),
            Structure::Mp3 => validate_mp3(desc, window),
        };

        Ok(match outcome {
            Ok(len) => Verdict::Accept {
                end: (start + len) as u64,
            },
            Err(rejection) => Verdict::Reject(rejection),
        })
    }

    fn footer_delimited(
        &self,
        desc: &SignatureDescriptor,
        window: &[u8],
        decode_as: Option<ImageFormat>,
    ) -> Result<usize, Rejection> {
        let end = find_end(desc, window, footer::after_footer(footer_len(desc)))?;
        if self.options.decode_images {
            if let Some(format) = decode_as {
                image::load_from_memory_with_format(&window[..end], format)
                    .map_err(|_| Rejection::Invalid("image failed to decode"))?;
            }
        }
        Ok(end)
    }
}

fn footer_len(desc: &SignatureDescriptor) -> usize {
    desc.footer.map(|f| f.len()).unwrap_or(0)
}

fn header_len(desc: &SignatureDescriptor) -> usize {
    desc.header_offset + desc.headers.iter().map(|h| h.len()).min().unwrap_or(0)
}

fn find_end<F>(desc: &SignatureDescriptor, window: &[u8], end_of: F) -> Result<usize, Rejection>
where
    F: Fn(&[u8], usize) -> Option<usize>,
{
    let Some(footer) = desc.footer else {
        return Err(Rejection::NoFooter);
    };
    match footer::search(window, header_len(desc), footer, desc.min_size, end_of) {
        FooterSearch::Found(end) => Ok(end),
        FooterSearch::TooSmall => Err(Rejection::TooSmall),
        FooterSearch::Missing => Err(Rejection::NoFooter),
    }
}

/// Chunks from the signature must run IHDR first and land exactly on IEND.
fn check_png_chunks(region: &[u8]) -> Result<(), Rejection> {
    let mut pos = 8usize;
    let mut first = true;
    while pos + 12 <= region.len() {
        let len = u32::from_be_bytes([region[pos], region[pos + 1], region[pos + 2], region[pos + 3]])
            as usize;
        let kind = &region[pos + 4..pos + 8];
        if first && kind != b"IHDR" {
            return Err(Rejection::Invalid("png does not start with IHDR"));
        }
        first = false;
        let next = pos
            .checked_add(12 + len)
            .ok_or(Rejection::Invalid("png chunk length overflow"))?;
        if kind == b"IEND" {
            return if next == region.len() {
                Ok(())
            } else {
                Err(Rejection::Invalid("png IEND is not the last chunk"))
            };
        }
        pos = next;
    }
    Err(Rejection::Invalid("png chunk walk lost sync"))
}

fn validate_pdf(desc: &SignatureDescriptor, window: &[u8]) -> Result<usize, Rejection> {
    let mut end = find_end(desc, window, footer::after_footer(footer_len(desc)))?;
    // keep the line ending that follows %%EOF
    for _ in 0..2 {
        match window.get(end) {
            Some(b'\r') | Some(b'\n') => end += 1,
            _ => break,
        }
    }
    let trimmed = trim_ascii_end(&window[..end]);
    if !trimmed.ends_with(b"%%EOF") {
        return Err(Rejection::Invalid("pdf does not end in %%EOF"));
    }
    Ok(end)
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let keep = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    &bytes[..keep]
}

fn validate_zip(
    desc: &SignatureDescriptor,
    window: &[u8],
    office_prefix: Option<&'static str>,
) -> Result<usize, Rejection> {
    let end = find_end(desc, window, zip::eocd_end)?;
    let listing = zip::inspect(&window[..end]).map_err(Rejection::Invalid)?;
    if let Some(prefix) = office_prefix {
        if !listing.contains("[Content_Types].xml") {
            return Err(Rejection::Invalid("office container lacks [Content_Types].xml"));
        }
        if !listing.has_prefix(prefix) {
            return Err(Rejection::Invalid("office container lacks its part directory"));
        }
    }
    Ok(end)
}

fn validate_rtf(desc: &SignatureDescriptor, window: &[u8]) -> Result<usize, Rejection> {
    let end = rtf::balanced_end(window).ok_or(Rejection::NoFooter)?;
    if (end as u64) < desc.min_size {
        return Err(Rejection::TooSmall);
    }
    Ok(end)
}

fn validate_isobmff(
    desc: &SignatureDescriptor,
    window: &[u8],
    quicktime: bool,
) -> Result<usize, Rejection> {
    let brand = isobmff::major_brand(window).ok_or(Rejection::TooSmall)?;
    if isobmff::is_quicktime_brand(brand) != quicktime {
        return Err(Rejection::Invalid("ftyp brand belongs to another format"));
    }
    let walk = isobmff::walk(window);
    if (walk.end as u64) < desc.min_size {
        return Err(Rejection::TooSmall);
    }
    let region = &window[..walk.end];
    if memmem::find(region, b"moov").is_none() && memmem::find(region, b"mdat").is_none() {
        return Err(Rejection::Invalid("no moov or mdat box"));
    }
    Ok(walk.end)
}

fn validate_mp3(desc: &SignatureDescriptor, window: &[u8]) -> Result<usize, Rejection> {
    let walk = mp3::walk(window);
    if walk.frames == 0 {
        return Err(Rejection::Invalid("no mpeg frames"));
    }
    if (walk.frame_bytes as u64) < desc.min_size {
        return Err(Rejection::TooSmall);
    }
    Ok(walk.end)
}
