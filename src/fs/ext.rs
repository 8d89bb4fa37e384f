//! Read-only ext2/ext3/ext4 metadata reader
//!
//! Covers what recovery needs: superblock and group descriptors, inode
//! records with allocation state from the inode bitmaps, block maps (direct
//! through triple indirect), extent trees, and directory blocks including
//! entries hidden in record-length slack after deletion. No journal replay.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};

use super::{
    le16, le32, push_run, DataRun, EntryKind, FileSystem, FsEntry, FsError, FsKind, FsResult,
    Volume, MAX_DIR_BYTES,
};

const SUPERBLOCK_OFFSET: u64 = 1024;
const EXT_MAGIC: u16 = 0xEF53;
const EXTENT_MAGIC: u16 = 0xF30A;
const ROOT_INODE: u64 = 2;
const MAX_EXTENT_DEPTH: u16 = 5;
const MAX_EXTENTS: usize = 1 << 20;
const MAX_GROUPS: u64 = 1 << 22;

const COMPAT_HAS_JOURNAL: u32 = 0x0004;
const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const INCOMPAT_64BIT: u32 = 0x0080;
const INCOMPAT_FLEX_BG: u32 = 0x0200;
const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

const INODE_FLAG_EXTENTS: u32 = 0x0008_0000;
const INODE_FLAG_INLINE_DATA: u32 = 0x1000_0000;
const BG_INODE_UNINIT: u16 = 0x0001;

/// Superblock magic check without parsing anything else
pub fn probe(volume: &Volume) -> bool {
    let mut magic = [0u8; 2];
    volume
        .read_exact_at(SUPERBLOCK_OFFSET + 56, &mut magic)
        .is_ok()
        && u16::from_le_bytes(magic) == EXT_MAGIC
}

#[derive(Debug, Clone)]
struct Superblock {
    inodes_count: u32,
    blocks_count: u64,
    first_data_block: u32,
    block_size: u64,
    inodes_per_group: u32,
    inode_size: u16,
    feature_compat: u32,
    feature_incompat: u32,
    feature_ro_compat: u32,
    desc_size: u16,
}

impl Superblock {
    fn parse(raw: &[u8]) -> FsResult<Self> {
        if le16(raw, 56) != EXT_MAGIC {
            return Err(FsError::corrupt("superblock", "bad magic"));
        }
        let log_block_size = le32(raw, 24);
        if log_block_size > 6 {
            return Err(FsError::corrupt(
                "superblock",
                format!("block size exponent {}", log_block_size),
            ));
        }
        let block_size = 1024u64 << log_block_size;

        let rev_level = le32(raw, 76);
        let inode_size = if rev_level == 0 { 128 } else { le16(raw, 88) };
        if inode_size < 128 || !inode_size.is_power_of_two() || inode_size as u64 > block_size {
            return Err(FsError::corrupt(
                "superblock",
                format!("inode size {}", inode_size),
            ));
        }

        let feature_incompat = le32(raw, 96);
        let is_64bit = feature_incompat & INCOMPAT_64BIT != 0;
        let mut blocks_count = le32(raw, 4) as u64;
        if is_64bit {
            blocks_count |= (le32(raw, 336) as u64) << 32;
        }
        if blocks_count.checked_mul(block_size).is_none() {
            return Err(FsError::corrupt(
                "superblock",
                format!("{} blocks of {} bytes", blocks_count, block_size),
            ));
        }
        let desc_size = if is_64bit { le16(raw, 254).max(32) } else { 32 };

        let inodes_per_group = le32(raw, 40);
        if inodes_per_group == 0 || le32(raw, 32) == 0 {
            return Err(FsError::corrupt("superblock", "empty block group"));
        }

        Ok(Self {
            inodes_count: le32(raw, 0),
            blocks_count,
            first_data_block: le32(raw, 20),
            block_size,
            inodes_per_group,
            inode_size,
            feature_compat: le32(raw, 92),
            feature_incompat,
            feature_ro_compat: le32(raw, 100),
            desc_size,
        })
    }

    fn kind(&self) -> FsKind {
        let ext4_incompat = INCOMPAT_EXTENTS | INCOMPAT_64BIT | INCOMPAT_FLEX_BG;
        if self.feature_incompat & ext4_incompat != 0
            || self.feature_ro_compat & RO_COMPAT_METADATA_CSUM != 0
        {
            FsKind::Ext4
        } else if self.feature_compat & COMPAT_HAS_JOURNAL != 0 {
            FsKind::Ext3
        } else {
            FsKind::Ext2
        }
    }

    fn group_count(&self) -> u64 {
        (self.inodes_count as u64).div_ceil(self.inodes_per_group as u64)
    }
}

#[derive(Debug, Clone, Copy)]
struct GroupDesc {
    inode_bitmap: u64,
    inode_table: u64,
    flags: u16,
}

impl GroupDesc {
    fn parse(raw: &[u8]) -> Self {
        let wide = raw.len() >= 64;
        let hi = |at: usize| if wide { (le32(raw, at) as u64) << 32 } else { 0 };
        Self {
            inode_bitmap: le32(raw, 4) as u64 | hi(0x24),
            inode_table: le32(raw, 8) as u64 | hi(0x28),
            flags: le16(raw, 0x12),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    logical: u64,
    start: u64,
    len: u64,
    unwritten: bool,
}

/// A parsed directory record
#[derive(Debug, Clone, PartialEq, Eq)]
struct DirRecord {
    inode: u64,
    name: String,
    /// False for entries recovered from record slack
    live: bool,
}

pub struct ExtFs {
    volume: Volume,
    sb: Superblock,
    groups: Vec<GroupDesc>,
}

impl ExtFs {
    pub fn open(volume: Volume) -> FsResult<Self> {
        let raw = volume.read_vec(SUPERBLOCK_OFFSET, 1024)?;
        let sb = Superblock::parse(&raw)?;

        let group_count = sb.group_count();
        if group_count == 0 || group_count > MAX_GROUPS {
            return Err(FsError::corrupt(
                "superblock",
                format!("{} block groups", group_count),
            ));
        }
        let gdt_offset = (sb.first_data_block as u64 + 1) * sb.block_size;
        let desc_size = sb.desc_size as usize;
        let table = volume.read_vec(gdt_offset, group_count as usize * desc_size)?;
        let groups = table.chunks_exact(desc_size).map(GroupDesc::parse).collect();

        tracing::debug!(
            kind = %sb.kind(),
            block_size = sb.block_size,
            inodes = sb.inodes_count,
            groups = group_count,
            "Opened ext filesystem"
        );
        Ok(Self { volume, sb, groups })
    }

    fn has_filetype(&self) -> bool {
        self.sb.feature_incompat & INCOMPAT_FILETYPE != 0
    }

    /// Byte offset of `block`, which must lie inside the volume
    fn block_offset(&self, what: &'static str, block: u64) -> FsResult<u64> {
        if block == 0 || block >= self.sb.blocks_count {
            return Err(FsError::corrupt(what, format!("block {}", block)));
        }
        Ok(block * self.sb.block_size)
    }

    fn read_block(&self, block: u64) -> FsResult<Vec<u8>> {
        let offset = self.block_offset("block pointer", block)?;
        Ok(self.volume.read_vec(offset, self.sb.block_size as usize)?)
    }

    fn locate(&self, ino: u64) -> FsResult<(GroupDesc, u64)> {
        if ino == 0 || ino > self.sb.inodes_count as u64 {
            return Err(FsError::InodeOutOfRange(ino));
        }
        let ipg = self.sb.inodes_per_group as u64;
        let group = ((ino - 1) / ipg) as usize;
        let gd = *self
            .groups
            .get(group)
            .ok_or(FsError::InodeOutOfRange(ino))?;
        Ok((gd, (ino - 1) % ipg))
    }

    fn inode_allocated(&self, gd: &GroupDesc, index: u64) -> FsResult<bool> {
        if gd.flags & BG_INODE_UNINIT != 0 {
            return Ok(false);
        }
        let bitmap = self.block_offset("group descriptor", gd.inode_bitmap)?;
        let mut byte = [0u8; 1];
        self.volume.read_exact_at(bitmap + index / 8, &mut byte)?;
        Ok(byte[0] >> (index % 8) & 1 == 1)
    }

    fn read_inode(&self, ino: u64) -> FsResult<FsEntry> {
        let (gd, index) = self.locate(ino)?;
        let inode_size = self.sb.inode_size as u64;
        let read_len = inode_size.min(256) as usize;
        let table = self.block_offset("group descriptor", gd.inode_table)?;
        let at = table
            .checked_add(index * inode_size)
            .ok_or_else(|| FsError::corrupt("group descriptor", format!("inode {}", ino)))?;
        let raw = self.volume.read_vec(at, read_len)?;
        let allocated = self.inode_allocated(&gd, index)?;

        let mode = le16(&raw, 0);
        let kind = match mode & 0xF000 {
            0x8000 => EntryKind::File,
            0x4000 => EntryKind::Directory,
            0xA000 => EntryKind::Symlink,
            _ => EntryKind::Other,
        };
        let mut size = le32(&raw, 4) as u64;
        if kind == EntryKind::File {
            size |= (le32(&raw, 108) as u64) << 32;
        }
        let flags = le32(&raw, 32);
        let i_block = &raw[40..100];

        let runs = if kind == EntryKind::Other
            || flags & INODE_FLAG_INLINE_DATA != 0
            || (kind == EntryKind::Symlink && size < 60)
        {
            Vec::new()
        } else if flags & INODE_FLAG_EXTENTS != 0 {
            self.extent_runs(i_block, size)?
        } else {
            self.block_map_runs(i_block, size)?
        };

        let created = if raw.len() >= 148 && le16(&raw, 128) >= 20 {
            timestamp(le32(&raw, 144))
        } else {
            None
        };

        Ok(FsEntry {
            inode: ino,
            name: String::new(),
            path: String::new(),
            kind,
            name_allocated: allocated,
            meta_allocated: allocated,
            size,
            runs,
            accessed: timestamp(le32(&raw, 8)),
            changed: timestamp(le32(&raw, 12)),
            modified: timestamp(le32(&raw, 16)),
            deleted: timestamp(le32(&raw, 20)),
            created,
        })
    }

    fn blocks_for(&self, size: u64) -> FsResult<u64> {
        let blocks = size.div_ceil(self.sb.block_size);
        if blocks > self.sb.blocks_count {
            return Err(FsError::corrupt("inode", format!("size {} exceeds volume", size)));
        }
        Ok(blocks)
    }

    fn push_block(&self, runs: &mut Vec<DataRun>, ptr: u64) -> FsResult<()> {
        let bs = self.sb.block_size;
        if ptr == 0 {
            push_run(runs, DataRun::hole(bs));
        } else if ptr >= self.sb.blocks_count {
            return Err(FsError::corrupt("block pointer", format!("{}", ptr)));
        } else {
            push_run(runs, DataRun::new(ptr * bs, bs));
        }
        Ok(())
    }

    /// Direct, indirect, double and triple indirect pointers
    fn block_map_runs(&self, i_block: &[u8], size: u64) -> FsResult<Vec<DataRun>> {
        let mut remaining = self.blocks_for(size)?;
        let mut runs = Vec::new();
        for slot in 0..12 {
            if remaining == 0 {
                return Ok(runs);
            }
            self.push_block(&mut runs, le32(i_block, slot * 4) as u64)?;
            remaining -= 1;
        }
        for (level, slot) in [(1u32, 12usize), (2, 13), (3, 14)] {
            if remaining == 0 {
                break;
            }
            let ptr = le32(i_block, slot * 4) as u64;
            self.walk_indirect(ptr, level, &mut remaining, &mut runs)?;
        }
        Ok(runs)
    }

    fn walk_indirect(
        &self,
        ptr: u64,
        level: u32,
        remaining: &mut u64,
        runs: &mut Vec<DataRun>,
    ) -> FsResult<()> {
        let per_block = self.sb.block_size / 4;
        if ptr == 0 {
            let covered = per_block.saturating_pow(level).min(*remaining);
            push_run(runs, DataRun::hole(covered * self.sb.block_size));
            *remaining -= covered;
            return Ok(());
        }
        let table = self.read_block(ptr)?;
        for i in 0..per_block as usize {
            if *remaining == 0 {
                break;
            }
            let child = le32(&table, i * 4) as u64;
            if level == 1 {
                self.push_block(runs, child)?;
                *remaining -= 1;
            } else {
                self.walk_indirect(child, level - 1, remaining, runs)?;
            }
        }
        Ok(())
    }

    fn extent_runs(&self, i_block: &[u8], size: u64) -> FsResult<Vec<DataRun>> {
        let wanted = self.blocks_for(size)?;
        let mut extents = Vec::new();
        collect_extents(
            i_block,
            MAX_EXTENT_DEPTH,
            &|block| self.read_block(block),
            &mut extents,
        )?;
        extents.sort_by_key(|e| e.logical);

        let bs = self.sb.block_size;
        let mut runs = Vec::new();
        let mut cursor = 0u64;
        for extent in extents {
            if extent.logical < cursor {
                return Err(FsError::corrupt("extent tree", "overlapping extents"));
            }
            if extent.start + extent.len > self.sb.blocks_count {
                return Err(FsError::corrupt(
                    "extent",
                    format!("blocks {}+{}", extent.start, extent.len),
                ));
            }
            if extent.logical > cursor {
                push_run(&mut runs, DataRun::hole((extent.logical - cursor) * bs));
            }
            let run = if extent.unwritten {
                DataRun::hole(extent.len * bs)
            } else {
                DataRun::new(extent.start * bs, extent.len * bs)
            };
            push_run(&mut runs, run);
            cursor = extent.logical + extent.len;
        }
        if cursor < wanted {
            push_run(&mut runs, DataRun::hole((wanted - cursor) * bs));
        }
        Ok(runs)
    }
}

/// Walk one extent tree node, descending through index nodes
fn collect_extents(
    node: &[u8],
    depth_limit: u16,
    read_block: &dyn Fn(u64) -> FsResult<Vec<u8>>,
    out: &mut Vec<Extent>,
) -> FsResult<()> {
    if node.len() < 12 || le16(node, 0) != EXTENT_MAGIC {
        return Err(FsError::corrupt("extent tree", "bad header magic"));
    }
    let entries = le16(node, 2) as usize;
    let depth = le16(node, 6);
    if 12 + entries * 12 > node.len() {
        return Err(FsError::corrupt("extent tree", "too many entries for node"));
    }
    if depth > depth_limit {
        return Err(FsError::corrupt("extent tree", format!("depth {}", depth)));
    }

    for i in 0..entries {
        let e = &node[12 + i * 12..24 + i * 12];
        if depth == 0 {
            let raw_len = le16(e, 4);
            let (len, unwritten) = if raw_len > 32768 {
                (raw_len - 32768, true)
            } else {
                (raw_len, false)
            };
            out.push(Extent {
                logical: le32(e, 0) as u64,
                start: (le16(e, 6) as u64) << 32 | le32(e, 8) as u64,
                len: len as u64,
                unwritten,
            });
            if out.len() > MAX_EXTENTS {
                return Err(FsError::corrupt("extent tree", "too many extents"));
            }
        } else {
            let leaf = (le16(e, 8) as u64) << 32 | le32(e, 4) as u64;
            let child = read_block(leaf)?;
            collect_extents(&child, depth - 1, read_block, out)?;
        }
    }
    Ok(())
}

fn timestamp(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    DateTime::from_timestamp(secs as i64, 0)
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn decode_name(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() || bytes.iter().any(|b| *b == 0 || *b == b'/') {
        return None;
    }
    String::from_utf8(bytes.to_vec()).ok()
}

fn name_len_at(block: &[u8], pos: usize, filetype: bool) -> usize {
    if filetype {
        block[pos + 6] as usize
    } else {
        le16(block, pos + 6) as usize
    }
}

/// A plausible deleted record at `pos`, and how far to step past it
fn hidden_record(
    block: &[u8],
    pos: usize,
    end: usize,
    filetype: bool,
    max_inode: u64,
) -> Option<(DirRecord, usize)> {
    let inode = le32(block, pos) as u64;
    if inode == 0 || inode > max_inode {
        return None;
    }
    let rec_len = le16(block, pos + 4) as usize;
    let name_len = name_len_at(block, pos, filetype);
    let needed = align4(8 + name_len);
    if name_len == 0 || rec_len < needed || rec_len % 4 != 0 || pos + 8 + name_len > end {
        return None;
    }
    if filetype && block[pos + 7] > 7 {
        return None;
    }
    let name = decode_name(&block[pos + 8..pos + 8 + name_len])?;
    Some((
        DirRecord {
            inode,
            name,
            live: false,
        },
        needed,
    ))
}

/// Live records of one directory block, plus deleted records still
/// readable in the space each live record's length covers.
fn parse_dir_block(block: &[u8], filetype: bool, max_inode: u64) -> Vec<DirRecord> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= block.len() {
        let inode = le32(block, pos) as u64;
        let rec_len = le16(block, pos + 4) as usize;
        if rec_len < 8 || rec_len % 4 != 0 || pos + rec_len > block.len() {
            break;
        }
        let name_len = name_len_at(block, pos, filetype);

        let mut used = 8;
        if inode != 0 && inode <= max_inode && name_len > 0 && 8 + name_len <= rec_len {
            if let Some(name) = decode_name(&block[pos + 8..pos + 8 + name_len]) {
                out.push(DirRecord {
                    inode,
                    name,
                    live: true,
                });
            }
            used = align4(8 + name_len);
        }

        let end = pos + rec_len;
        let mut p = pos + used;
        while p + 8 <= end {
            match hidden_record(block, p, end, filetype, max_inode) {
                Some((record, step)) => {
                    out.push(record);
                    p += step;
                }
                None => p += 4,
            }
        }
        pos = end;
    }
    out
}

impl FileSystem for ExtFs {
    fn kind(&self) -> FsKind {
        self.sb.kind()
    }

    fn volume(&self) -> &Volume {
        &self.volume
    }

    fn block_size(&self) -> u64 {
        self.sb.block_size
    }

    fn root(&self) -> FsResult<FsEntry> {
        self.read_inode(ROOT_INODE)
    }

    fn read_dir(&self, dir: &FsEntry) -> FsResult<Vec<FsEntry>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let len = dir.size.min(dir.allocated_len()).min(MAX_DIR_BYTES) as usize;
        let mut data = vec![0u8; len];
        let n = self.read_file_at(dir, 0, &mut data)?;
        data.truncate(n);

        let max_inode = self.sb.inodes_count as u64;
        let mut entries = Vec::new();
        for block in data.chunks(self.sb.block_size as usize) {
            for record in parse_dir_block(block, self.has_filetype(), max_inode) {
                if record.name == "." || record.name == ".." {
                    continue;
                }
                match self.read_inode(record.inode) {
                    Ok(mut entry) => {
                        entry.path = dir.child_path(&record.name);
                        entry.name = record.name;
                        entry.name_allocated = record.live;
                        entries.push(entry);
                    }
                    Err(e) => {
                        tracing::debug!(
                            inode = record.inode,
                            name = %record.name,
                            error = %e,
                            "Skipping unreadable directory entry"
                        );
                    }
                }
            }
        }
        Ok(entries)
    }

    fn inode_range(&self) -> Option<RangeInclusive<u64>> {
        Some(1..=self.sb.inodes_count as u64)
    }

    fn open_inode(&self, inode: u64) -> FsResult<FsEntry> {
        self.read_inode(inode)
    }
}
