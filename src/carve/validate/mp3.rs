//! MPEG-1 Layer III frame streams, with optional leading ID3v2 tag.

/// kbps by bitrate index, MPEG-1 Layer III
const BITRATES_KBPS: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
/// Hz by sample-rate index, MPEG-1
const SAMPLE_RATES: [u32; 4] = [44_100, 48_000, 32_000, 0];

/// Consecutive non-frame bytes tolerated before the walk gives up
pub(crate) const MAX_MISSES: usize = 10;

/// Frame length in bytes for an MPEG-1 Layer III header, or `None`.
pub(crate) fn frame_len(header: &[u8]) -> Option<usize> {
    if header.len() < 4 || header[0] != 0xFF || header[1] & 0xE0 != 0xE0 {
        return None;
    }
    let version = (header[1] >> 3) & 0x03;
    let layer = (header[1] >> 1) & 0x03;
    if version != 0x03 || layer != 0x01 {
        return None;
    }
    let bitrate = BITRATES_KBPS[(header[2] >> 4) as usize];
    let sample_rate = SAMPLE_RATES[((header[2] >> 2) & 0x03) as usize];
    if bitrate == 0 || sample_rate == 0 {
        return None;
    }
    let padding = ((header[2] >> 1) & 0x01) as u32;
    Some((144 * bitrate * 1000 / sample_rate + padding) as usize)
}

/// Length of a leading ID3v2 tag (header, body and optional footer).
pub(crate) fn id3_len(window: &[u8]) -> Option<usize> {
    if window.len() < 10 || &window[..3] != b"ID3" {
        return None;
    }
    let size_bytes = &window[6..10];
    if size_bytes.iter().any(|b| b & 0x80 != 0) {
        return None;
    }
    let size = size_bytes
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | (*b as usize));
    let footer = if window[5] & 0x10 != 0 { 10 } else { 0 };
    Some(10 + size + footer)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct FrameWalk {
    /// End of the last valid frame, relative to the window start
    pub end: usize,
    pub frames: usize,
    /// Sum of valid frame lengths
    pub frame_bytes: usize,
}

pub(crate) fn walk(window: &[u8]) -> FrameWalk {
    let start = if window.starts_with(b"ID3") {
        match id3_len(window) {
            Some(len) => len,
            None => return FrameWalk::default(),
        }
    } else {
        0
    };

    let mut walk = FrameWalk {
        end: start,
        ..FrameWalk::default()
    };
    let mut pos = start;
    let mut misses = 0usize;
    while pos + 4 <= window.len() {
        match frame_len(&window[pos..pos + 4]) {
            Some(len) if pos + len <= window.len() => {
                pos += len;
                walk.end = pos;
                walk.frames += 1;
                walk.frame_bytes += len;
                misses = 0;
            }
            _ => {
                misses += 1;
                if misses > MAX_MISSES {
                    break;
                }
                pos += 1;
            }
        }
    }
    walk
}

#[cfg(test)]
pub(crate) fn frame(bitrate_index: u8, padding: bool) -> Vec<u8> {
    let b2 = (bitrate_index << 4) | if padding { 0x02 } else { 0 };
    let header = [0xFF, 0xFB, b2, 0x44];
    let len = frame_len(&header).unwrap_or(4);
    let mut out = header.to_vec();
    out.extend(std::iter::repeat(0x55).take(len - 4));
    out
}
