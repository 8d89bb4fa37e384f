//! RIFF containers (WAV, AVI): the size field at +4 bounds the file.

use super::Rejection;

/// Anything this short cannot hold a real chunk after the form header
const MIN_RIFF_LEN: usize = 32;

/// Total region length for a RIFF candidate at the start of `window`.
///
/// `window` is already clipped to the image end and the format's max size,
/// so a declared size that overruns it is rejected.
pub(crate) fn region_len(window: &[u8], form: &[u8; 4]) -> Result<usize, Rejection> {
    if window.len() < 12 {
        return Err(Rejection::TooSmall);
    }
    if &window[8..12] != form {
        return Err(Rejection::Invalid("riff form type mismatch"));
    }
    let declared = u32::from_le_bytes([window[4], window[5], window[6], window[7]]) as usize;
    let total = declared + 8;
    if total <= MIN_RIFF_LEN {
        return Err(Rejection::TooSmall);
    }
    if total > window.len() {
        return Err(Rejection::Invalid("riff size runs past available bytes"));
    }
    Ok(total)
}
