//! ZIP container checks: end-of-central-directory trailer, central directory
//! walk and per-entry CRC verification.

use std::io::Read;

use flate2::read::DeflateDecoder;

const EOCD_LEN: usize = 22;
const CDIR_SIG: u32 = 0x0201_4B50;
const LOCAL_SIG: u32 = 0x0403_4B50;
const CDIR_FIXED: usize = 46;
const LOCAL_FIXED: usize = 30;

/// Entries beyond this are counted but not CRC-checked
const MAX_VERIFIED_ENTRIES: usize = 4096;

/// What the integrity walk learned about an archive
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ZipListing {
    pub names: Vec<String>,
    pub verified: usize,
}

impl ZipListing {
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.names.iter().any(|n| n.starts_with(prefix))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

fn le16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]))
}

fn le32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Region end for an EOCD record found at `pos`: the record plus its comment.
pub(crate) fn eocd_end(window: &[u8], pos: usize) -> Option<usize> {
    let comment_len = le16(window, pos + 20)? as usize;
    Some(pos + EOCD_LEN + comment_len)
}

/// Open `archive` (header through trailer) and check it end to end.
pub(crate) fn inspect(archive: &[u8]) -> Result<ZipListing, &'static str> {
    if archive.len() < EOCD_LEN {
        return Err("zip shorter than its trailer");
    }
    let eocd = find_last_eocd(archive).ok_or("zip trailer missing")?;

    let total_entries = le16(archive, eocd + 10).ok_or("zip trailer truncated")? as usize;
    let cd_size = le32(archive, eocd + 12).ok_or("zip trailer truncated")? as usize;
    let cd_offset = le32(archive, eocd + 16).ok_or("zip trailer truncated")? as usize;

    if cd_offset.checked_add(cd_size) != Some(eocd) {
        return Err("central directory does not abut trailer");
    }

    let mut listing = ZipListing::default();
    let mut pos = cd_offset;
    for index in 0..total_entries {
        if le32(archive, pos) != Some(CDIR_SIG) {
            return Err("bad central directory entry");
        }
        let method = le16(archive, pos + 10).ok_or("central directory truncated")?;
        let crc = le32(archive, pos + 16).ok_or("central directory truncated")?;
        let compressed = le32(archive, pos + 20).ok_or("central directory truncated")? as usize;
        let uncompressed = le32(archive, pos + 24).ok_or("central directory truncated")? as usize;
        let name_len = le16(archive, pos + 28).ok_or("central directory truncated")? as usize;
        let extra_len = le16(archive, pos + 30).ok_or("central directory truncated")? as usize;
        let comment_len = le16(archive, pos + 32).ok_or("central directory truncated")? as usize;
        let local_offset = le32(archive, pos + 42).ok_or("central directory truncated")? as usize;

        let name_start = pos + CDIR_FIXED;
        let name = archive
            .get(name_start..name_start + name_len)
            .ok_or("entry name truncated")?;
        listing.names.push(String::from_utf8_lossy(name).into_owned());

        if index < MAX_VERIFIED_ENTRIES {
            let data = local_data(archive, local_offset, compressed)?;
            verify_entry(data, method, crc, uncompressed)?;
            listing.verified += 1;
        }

        pos = name_start + name_len + extra_len + comment_len;
        if pos > eocd {
            return Err("central directory overruns trailer");
        }
    }

    if pos != eocd {
        return Err("central directory size mismatch");
    }
    Ok(listing)
}

fn find_last_eocd(archive: &[u8]) -> Option<usize> {
    let min = archive.len().saturating_sub(EOCD_LEN + u16::MAX as usize);
    (min..=archive.len() - EOCD_LEN)
        .rev()
        .find(|&i| archive[i..i + 4] == crate::carve::signatures::ZIP_EOCD)
}

fn local_data(archive: &[u8], offset: usize, compressed: usize) -> Result<&[u8], &'static str> {
    if le32(archive, offset) != Some(LOCAL_SIG) {
        return Err("bad local file header");
    }
    let name_len = le16(archive, offset + 26).ok_or("local header truncated")? as usize;
    let extra_len = le16(archive, offset + 28).ok_or("local header truncated")? as usize;
    let start = offset + LOCAL_FIXED + name_len + extra_len;
    archive
        .get(start..start + compressed)
        .ok_or("entry data truncated")
}

fn verify_entry(data: &[u8], method: u16, crc: u32, uncompressed: usize) -> Result<(), &'static str> {
    match method {
        // stored
        0 => {
            if data.len() != uncompressed {
                return Err("stored entry size mismatch");
            }
            if crc32fast::hash(data) != crc {
                return Err("stored entry crc mismatch");
            }
        }
        // deflate
        8 => {
            let mut decoder = DeflateDecoder::new(data).take(uncompressed as u64 + 1);
            let mut hasher = crc32fast::Hasher::new();
            let mut buf = [0u8; 16 * 1024];
            let mut total = 0usize;
            loop {
                let n = decoder.read(&mut buf).map_err(|_| "deflate stream corrupt")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                total += n;
            }
            if total != uncompressed {
                return Err("deflated entry size mismatch");
            }
            if hasher.finalize() != crc {
                return Err("deflated entry crc mismatch");
            }
        }
        // other methods are accepted on structure alone
        _ => {}
    }
    Ok(())
}

/// Minimal archive writer for tests (stored entries only).
#[cfg(test)]
pub(crate) fn build_stored_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, data) in entries {
        let offset = out.len() as u32;
        let crc = crc32fast::hash(data);

        out.extend_from_slice(&LOCAL_SIG.to_le_bytes());
        out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);

        central.extend_from_slice(&CDIR_SIG.to_le_bytes());
        central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        central.extend_from_slice(&crc.to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(data.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0u8; 12]);
        central.extend_from_slice(&offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }
    let cd_offset = out.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06, 0, 0, 0, 0]);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(central.len() as u32).to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}
