//! Read-only FAT12/16/32 metadata reader
//!
//! FAT has no inode table, so an entry's "inode" is the byte address of its
//! 32-byte directory slot divided by 32. Deleted entries (first byte 0xE5)
//! lose their cluster chain; their data is assumed contiguous from the
//! first cluster, which is what the FAT itself would have said for an
//! unfragmented file.

use std::ops::RangeInclusive;

use chrono::{DateTime, NaiveDate, Utc};

use super::{
    le16, le32, push_run, DataRun, EntryKind, FileSystem, FsEntry, FsError, FsKind, FsResult,
    Volume, MAX_DIR_BYTES,
};

const DIR_ENTRY_SIZE: u64 = 32;
const DELETED_MARK: u8 = 0xE5;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
const ATTR_LONG_NAME: u8 = 0x0F;

/// Synthetic address of the root directory, which has no slot of its own
const ROOT_INODE: u64 = 0;

/// Boot sector sanity check
pub fn probe(volume: &Volume) -> bool {
    let mut raw = [0u8; 512];
    volume.read_exact_at(0, &mut raw).is_ok() && is_boot_sector(&raw)
}

pub(crate) fn is_boot_sector(sector: &[u8; 512]) -> bool {
    BootSector::parse(sector).is_ok()
}

#[derive(Debug, Clone)]
struct BootSector {
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    reserved_sectors: u64,
    num_fats: u64,
    root_entries: u64,
    total_sectors: u64,
    fat_sectors: u64,
    root_cluster: u32,
}

impl BootSector {
    fn parse(raw: &[u8]) -> FsResult<Self> {
        let bad = |detail: &str| Err(FsError::corrupt("FAT boot sector", detail));
        if raw[510] != 0x55 || raw[511] != 0xAA {
            return bad("missing 0x55AA signature");
        }
        if raw[0] != 0xEB && raw[0] != 0xE9 {
            return bad("no jump instruction");
        }
        if &raw[3..11] == b"NTFS    " || &raw[3..11] == b"EXFAT   " {
            return bad("not a FAT volume");
        }
        let bytes_per_sector = le16(raw, 11) as u64;
        if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return bad("invalid bytes per sector");
        }
        let sectors_per_cluster = raw[13] as u64;
        if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
            return bad("invalid sectors per cluster");
        }
        let reserved_sectors = le16(raw, 14) as u64;
        let num_fats = raw[16] as u64;
        if reserved_sectors == 0 || num_fats == 0 {
            return bad("no reserved sectors or FATs");
        }
        let total_sectors = match le16(raw, 19) {
            0 => le32(raw, 32) as u64,
            n => n as u64,
        };
        let fat_sectors = match le16(raw, 22) {
            0 => le32(raw, 36) as u64,
            n => n as u64,
        };
        if total_sectors == 0 || fat_sectors == 0 {
            return bad("zero-sized volume or FAT");
        }
        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            root_entries: le16(raw, 17) as u64,
            total_sectors,
            fat_sectors,
            root_cluster: le32(raw, 44),
        })
    }
}

pub struct FatFs {
    volume: Volume,
    kind: FsKind,
    cluster_size: u64,
    fat_offset: u64,
    root_dir_offset: u64,
    root_dir_len: u64,
    data_offset: u64,
    cluster_count: u32,
    root_cluster: u32,
}

impl FatFs {
    pub fn open(volume: Volume) -> FsResult<Self> {
        let mut raw = [0u8; 512];
        volume.read_exact_at(0, &mut raw)?;
        let bs = BootSector::parse(&raw)?;

        let bps = bs.bytes_per_sector;
        let root_dir_sectors = (bs.root_entries * DIR_ENTRY_SIZE).div_ceil(bps);
        let root_dir_sector = bs.reserved_sectors + bs.num_fats * bs.fat_sectors;
        let first_data_sector = root_dir_sector + root_dir_sectors;
        if first_data_sector >= bs.total_sectors {
            return Err(FsError::corrupt("FAT layout", "no data region"));
        }
        let cluster_count = (bs.total_sectors - first_data_sector) / bs.sectors_per_cluster;

        // Type is decided by cluster count alone
        let kind = if cluster_count < 4085 {
            FsKind::Fat12
        } else if cluster_count < 65525 {
            FsKind::Fat16
        } else {
            FsKind::Fat32
        };

        let fs = Self {
            volume,
            kind,
            cluster_size: bps * bs.sectors_per_cluster,
            fat_offset: bs.reserved_sectors * bps,
            root_dir_offset: root_dir_sector * bps,
            root_dir_len: root_dir_sectors * bps,
            data_offset: first_data_sector * bps,
            cluster_count: cluster_count.min(u32::MAX as u64 - 2) as u32,
            root_cluster: bs.root_cluster,
        };
        tracing::debug!(
            kind = %fs.kind,
            cluster_size = fs.cluster_size,
            clusters = fs.cluster_count,
            "Opened FAT filesystem"
        );
        Ok(fs)
    }

    fn valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && (cluster as u64) < self.cluster_count as u64 + 2
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset + (cluster as u64 - 2) * self.cluster_size
    }

    fn fat_entry(&self, cluster: u32) -> FsResult<u32> {
        let n = cluster as u64;
        match self.kind {
            FsKind::Fat12 => {
                let mut b = [0u8; 2];
                self.volume.read_exact_at(self.fat_offset + n + n / 2, &mut b)?;
                let v = u16::from_le_bytes(b) as u32;
                Ok(if n % 2 == 1 { v >> 4 } else { v & 0x0FFF })
            }
            FsKind::Fat16 => {
                let mut b = [0u8; 2];
                self.volume.read_exact_at(self.fat_offset + n * 2, &mut b)?;
                Ok(u16::from_le_bytes(b) as u32)
            }
            _ => {
                let mut b = [0u8; 4];
                self.volume.read_exact_at(self.fat_offset + n * 4, &mut b)?;
                Ok(u32::from_le_bytes(b) & 0x0FFF_FFFF)
            }
        }
    }

    fn is_end_of_chain(&self, value: u32) -> bool {
        match self.kind {
            FsKind::Fat12 => value >= 0x0FF8,
            FsKind::Fat16 => value >= 0xFFF8,
            _ => value >= 0x0FFF_FFF8,
        }
    }

    /// Follow the allocation chain from `first`
    fn chain(&self, first: u32) -> FsResult<Vec<DataRun>> {
        let mut runs = Vec::new();
        let mut cluster = first;
        for _ in 0..self.cluster_count {
            if !self.valid_cluster(cluster) {
                return Err(FsError::corrupt(
                    "cluster chain",
                    format!("cluster {} out of range", cluster),
                ));
            }
            push_run(
                &mut runs,
                DataRun::new(self.cluster_offset(cluster), self.cluster_size),
            );
            let next = self.fat_entry(cluster)?;
            if next == 0 || self.is_end_of_chain(next) {
                return Ok(runs);
            }
            cluster = next;
        }
        Err(FsError::corrupt("cluster chain", "loop detected"))
    }

    /// Contiguous guess for entries whose chain was cleared
    fn contiguous(&self, first: u32, clusters: u64) -> Vec<DataRun> {
        let available = (self.cluster_count as u64 + 2).saturating_sub(first as u64);
        let clusters = clusters.min(available);
        if clusters == 0 {
            return Vec::new();
        }
        vec![DataRun::new(
            self.cluster_offset(first),
            clusters * self.cluster_size,
        )]
    }

    fn root_entry(&self) -> FsResult<FsEntry> {
        let runs = if self.kind == FsKind::Fat32 {
            self.chain(self.root_cluster)?
        } else {
            vec![DataRun::new(self.root_dir_offset, self.root_dir_len)]
        };
        let size = runs.iter().map(|r| r.len).sum();
        Ok(FsEntry {
            inode: ROOT_INODE,
            name: String::new(),
            path: String::new(),
            kind: EntryKind::Directory,
            name_allocated: true,
            meta_allocated: true,
            size,
            runs,
            modified: None,
            accessed: None,
            created: None,
            changed: None,
            deleted: None,
        })
    }

    /// Build an entry from one short-name slot
    fn entry_from_slot(&self, addr: u64, slot: &[u8], long_name: Option<String>) -> FsEntry {
        let deleted = slot[0] == DELETED_MARK;
        let attr = slot[11];
        let kind = if attr & ATTR_DIRECTORY != 0 {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let hi = if self.kind == FsKind::Fat32 {
            (le16(slot, 20) as u32) << 16
        } else {
            0
        };
        let first_cluster = hi | le16(slot, 26) as u32;
        let recorded_size = le32(slot, 28) as u64;

        let runs = if !self.valid_cluster(first_cluster) {
            Vec::new()
        } else if deleted {
            let clusters = if kind == EntryKind::Directory {
                1
            } else {
                recorded_size.div_ceil(self.cluster_size)
            };
            self.contiguous(first_cluster, clusters)
        } else {
            self.chain(first_cluster).unwrap_or_else(|e| {
                tracing::debug!(addr, error = %e, "Broken cluster chain");
                Vec::new()
            })
        };
        let size = if kind == EntryKind::Directory {
            runs.iter().map(|r| r.len).sum()
        } else {
            recorded_size
        };

        FsEntry {
            inode: addr / DIR_ENTRY_SIZE,
            name: long_name.unwrap_or_else(|| short_name(slot)),
            path: String::new(),
            kind,
            name_allocated: !deleted,
            meta_allocated: !deleted,
            size,
            runs,
            created: dos_datetime(le16(slot, 16), le16(slot, 14)),
            accessed: dos_datetime(le16(slot, 18), 0),
            modified: dos_datetime(le16(slot, 24), le16(slot, 22)),
            changed: None,
            deleted: None,
        }
    }
}

/// 8.3 name; a deleted entry's lost first character shows as `_`
fn short_name(slot: &[u8]) -> String {
    let mut base: Vec<u8> = slot[..8].to_vec();
    match base[0] {
        DELETED_MARK => base[0] = b'_',
        0x05 => base[0] = DELETED_MARK,
        _ => {}
    }
    let trim = |bytes: &[u8]| {
        let s: String = bytes.iter().map(|b| *b as char).collect();
        s.trim_end_matches([' ', '\0']).to_string()
    };
    let base = trim(&base);
    let ext = trim(&slot[8..11]);
    if ext.is_empty() {
        base
    } else {
        format!("{}.{}", base, ext)
    }
}

fn lfn_checksum(short: &[u8]) -> u8 {
    short[..11].iter().fold(0u8, |sum, b| {
        ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*b)
    })
}

fn lfn_chars(slot: &[u8]) -> impl Iterator<Item = u16> + '_ {
    (1..11)
        .step_by(2)
        .chain((14..26).step_by(2))
        .chain((28..32).step_by(2))
        .map(move |at| le16(slot, at))
}

/// Long-name fragments collected ahead of a short entry
#[derive(Default)]
struct LongName {
    // physical order: highest sequence first
    fragments: Vec<Vec<u16>>,
    checksum: Option<u8>,
    consistent: bool,
}

impl LongName {
    fn push(&mut self, slot: &[u8]) {
        let checksum = slot[13];
        if self.fragments.is_empty() {
            self.checksum = Some(checksum);
            self.consistent = true;
        } else if self.checksum != Some(checksum) {
            self.consistent = false;
        }
        self.fragments.push(lfn_chars(slot).collect());
    }

    /// The assembled name, if the fragments belong to `slot`
    fn take(&mut self, slot: &[u8]) -> Option<String> {
        let fragments = std::mem::take(&mut self.fragments);
        if fragments.is_empty() || !self.consistent {
            return None;
        }
        // a deleted short entry no longer hashes to the stored checksum
        if slot[0] != DELETED_MARK && self.checksum != Some(lfn_checksum(slot)) {
            return None;
        }
        let units: Vec<u16> = fragments
            .into_iter()
            .rev()
            .flatten()
            .take_while(|c| *c != 0x0000 && *c != 0xFFFF)
            .collect();
        let name = String::from_utf16_lossy(&units);
        (!name.is_empty()).then_some(name)
    }

    fn clear(&mut self) {
        self.fragments.clear();
    }
}

fn dos_datetime(date: u16, time: u16) -> Option<DateTime<Utc>> {
    if date == 0 {
        return None;
    }
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;
    let hour = (time >> 11) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = ((time & 0x1F) * 2) as u32;
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)
        .map(|dt| dt.and_utc())
}

impl FileSystem for FatFs {
    fn kind(&self) -> FsKind {
        self.kind
    }

    fn volume(&self) -> &Volume {
        &self.volume
    }

    fn block_size(&self) -> u64 {
        self.cluster_size
    }

    fn root(&self) -> FsResult<FsEntry> {
        self.root_entry()
    }

    fn read_dir(&self, dir: &FsEntry) -> FsResult<Vec<FsEntry>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let mut long_name = LongName::default();
        let mut budget = MAX_DIR_BYTES;

        'runs: for run in dir.runs.iter().filter(|r| !r.sparse) {
            let len = run.len.min(budget);
            budget -= len;
            let data = self.volume.read_vec(run.offset, len as usize)?;
            for (i, slot) in data.chunks_exact(DIR_ENTRY_SIZE as usize).enumerate() {
                let addr = run.offset + i as u64 * DIR_ENTRY_SIZE;
                if slot[0] == 0x00 {
                    break 'runs;
                }
                let attr = slot[11];
                if attr & 0x3F == ATTR_LONG_NAME {
                    long_name.push(slot);
                    continue;
                }
                if attr & ATTR_VOLUME_ID != 0 {
                    long_name.clear();
                    continue;
                }
                let name = long_name.take(slot);
                let mut entry = self.entry_from_slot(addr, slot, name);
                if entry.is_dot() {
                    continue;
                }
                entry.path = dir.child_path(&entry.name);
                entries.push(entry);
            }
            if budget == 0 {
                break;
            }
        }
        Ok(entries)
    }

    fn inode_range(&self) -> Option<RangeInclusive<u64>> {
        None
    }

    fn open_inode(&self, inode: u64) -> FsResult<FsEntry> {
        if inode == ROOT_INODE {
            return self.root_entry();
        }
        let addr = inode
            .checked_mul(DIR_ENTRY_SIZE)
            .filter(|a| a + DIR_ENTRY_SIZE <= self.volume.len())
            .ok_or(FsError::InodeOutOfRange(inode))?;
        let slot = self.volume.read_vec(addr, DIR_ENTRY_SIZE as usize)?;
        if slot[0] == 0x00 || slot[11] & 0x3F == ATTR_LONG_NAME {
            return Err(FsError::InodeOutOfRange(inode));
        }
        let mut entry = self.entry_from_slot(addr, &slot, None);
        entry.path = entry.name.clone();
        Ok(entry)
    }
}
