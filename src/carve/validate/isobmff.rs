//! ISO base-media (MP4/MOV) box walking.

/// Stop after this many top-level boxes
pub(crate) const MAX_BOXES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxWalk {
    /// Region end relative to the window start
    pub end: usize,
    pub boxes: usize,
    /// The last box claimed more bytes than the window holds
    pub truncated: bool,
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn be64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_be_bytes(buf)
}

/// Walk top-level boxes from the start of `window`.
///
/// The walk ends at the first box with a size under 8 or a type that is not
/// four ASCII alphanumerics. A box that runs past the window is clamped to
/// the window end and ends the walk.
pub(crate) fn walk(window: &[u8]) -> BoxWalk {
    let mut pos = 0usize;
    let mut boxes = 0usize;
    let mut truncated = false;

    while boxes < MAX_BOXES && pos + 8 <= window.len() {
        let kind = &window[pos + 4..pos + 8];
        if !kind.iter().all(|b| b.is_ascii_alphanumeric()) {
            break;
        }
        let size = match be32(window, pos) {
            1 => {
                if pos + 16 > window.len() {
                    break;
                }
                be64(window, pos + 8)
            }
            n => n as u64,
        };
        if size < 8 {
            break;
        }
        boxes += 1;

        let remaining = (window.len() - pos) as u64;
        if size > remaining {
            pos = window.len();
            truncated = true;
            break;
        }
        pos += size as usize;
    }

    BoxWalk {
        end: pos,
        boxes,
        truncated,
    }
}

/// Major brand from the `ftyp` box at the start of `window`
pub(crate) fn major_brand(window: &[u8]) -> Option<&[u8]> {
    window.get(8..12)
}

pub(crate) fn is_quicktime_brand(brand: &[u8]) -> bool {
    brand == b"qt  "
}
