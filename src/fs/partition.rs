//! MBR (with EBR chains) and GPT partition tables

use serde::Serialize;
use uuid::Uuid;

use super::{le16, le32, le64, ImageSource};

pub const SECTOR_SIZE: u64 = 512;

/// Logical partitions followed in one extended partition
const MAX_LOGICAL: usize = 32;
const MAX_GPT_ENTRIES: u32 = 256;

const MBR_TABLE: usize = 446;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Scheme {
    Mbr,
    Gpt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Partition {
    /// 1-based, in table order
    pub index: usize,
    pub scheme: Scheme,
    /// Byte offset in the image
    pub offset: u64,
    pub len: u64,
    /// MBR type byte (`0x83`) or GPT type GUID
    pub type_id: String,
    pub description: String,
}

impl Partition {
    pub fn label(&self) -> String {
        format!(
            "Partition {}: {} ({})",
            self.index,
            self.description,
            crate::core::format_offset(self.offset)
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct MbrEntry {
    kind: u8,
    start: u32,
    sectors: u32,
}

impl MbrEntry {
    fn parse(sector: &[u8], slot: usize) -> Option<Self> {
        let at = MBR_TABLE + slot * 16;
        let status = sector[at];
        if status != 0x00 && status != 0x80 {
            return None;
        }
        Some(Self {
            kind: sector[at + 4],
            start: le32(sector, at + 8),
            sectors: le32(sector, at + 12),
        })
    }

    fn is_used(&self) -> bool {
        self.kind != 0 && self.sectors > 0
    }

    fn is_extended(&self) -> bool {
        matches!(self.kind, 0x05 | 0x0F | 0x85)
    }
}

/// The four slots of an MBR or EBR sector, if it carries a valid table
fn table_entries(sector: &[u8; 512]) -> Option<[MbrEntry; 4]> {
    if sector[510] != 0x55 || sector[511] != 0xAA {
        return None;
    }
    Some([
        MbrEntry::parse(sector, 0)?,
        MbrEntry::parse(sector, 1)?,
        MbrEntry::parse(sector, 2)?,
        MbrEntry::parse(sector, 3)?,
    ])
}

fn mbr_description(kind: u8) -> &'static str {
    match kind {
        0x01 => "FAT12",
        0x04 | 0x06 | 0x0E => "FAT16",
        0x0B | 0x0C => "FAT32",
        0x07 => "NTFS/exFAT",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x8E => "Linux LVM",
        0xA5 => "FreeBSD",
        0xAF => "HFS+",
        _ => "Unknown",
    }
}

fn read_sector(source: &dyn ImageSource, lba: u64) -> Option<[u8; 512]> {
    let mut sector = [0u8; 512];
    source
        .read_exact_at(lba.checked_mul(SECTOR_SIZE)?, &mut sector)
        .ok()?;
    Some(sector)
}

/// Partitions found in the image, in table order.
///
/// Empty when sector 0 has no plausible table, which includes images that
/// start directly with a filesystem.
pub fn read_table(source: &dyn ImageSource) -> Vec<Partition> {
    let Some(sector) = read_sector(source, 0) else {
        return Vec::new();
    };
    // a volume boot record carries the same signature
    if super::fat::is_boot_sector(&sector) {
        return Vec::new();
    }
    let Some(entries) = table_entries(&sector) else {
        return Vec::new();
    };

    if entries.iter().any(|e| e.kind == 0xEE) {
        if let Some(parts) = read_gpt(source) {
            return parts;
        }
    }

    let disk_sectors = source.len() / SECTOR_SIZE;
    let used: Vec<MbrEntry> = entries.into_iter().filter(MbrEntry::is_used).collect();
    if used.is_empty()
        || used
            .iter()
            .any(|e| e.start == 0 || e.start as u64 >= disk_sectors)
    {
        return Vec::new();
    }

    let mut parts = Vec::new();
    for entry in used {
        if entry.is_extended() {
            walk_ebr_chain(source, entry.start as u64, &mut parts);
        } else {
            push_mbr(&mut parts, entry, 0);
        }
    }
    tracing::debug!(count = parts.len(), "Read MBR partition table");
    parts
}

fn push_mbr(parts: &mut Vec<Partition>, entry: MbrEntry, base_lba: u64) {
    let lba = base_lba + entry.start as u64;
    parts.push(Partition {
        index: parts.len() + 1,
        scheme: Scheme::Mbr,
        offset: lba * SECTOR_SIZE,
        len: entry.sectors as u64 * SECTOR_SIZE,
        type_id: format!("0x{:02X}", entry.kind),
        description: mbr_description(entry.kind).to_string(),
    });
}

/// Follow the EBR linked list. Logical entries are relative to their own
/// EBR; link entries are relative to the start of the extended partition.
fn walk_ebr_chain(source: &dyn ImageSource, extended_lba: u64, parts: &mut Vec<Partition>) {
    let mut ebr_lba = extended_lba;
    for _ in 0..MAX_LOGICAL {
        let Some(sector) = read_sector(source, ebr_lba) else {
            break;
        };
        let Some([logical, link, ..]) = table_entries(&sector) else {
            break;
        };
        if logical.is_used() && !logical.is_extended() {
            push_mbr(parts, logical, ebr_lba);
        }
        if !link.is_extended() || link.start == 0 {
            break;
        }
        ebr_lba = extended_lba + link.start as u64;
    }
}

fn gpt_description(type_guid: &Uuid) -> &'static str {
    match type_guid.to_string().as_str() {
        "0fc63daf-8483-4772-8e79-3d69d8477de4" => "Linux filesystem",
        "c12a7328-f81f-11d2-ba4b-00a0c93ec93b" => "EFI System",
        "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7" => "Microsoft basic data",
        "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f" => "Linux swap",
        "e6d6d379-f507-44c2-a23c-238f2a3df928" => "Linux LVM",
        _ => "Unknown",
    }
}

fn read_gpt(source: &dyn ImageSource) -> Option<Vec<Partition>> {
    let header = read_sector(source, 1)?;
    if &header[..8] != GPT_SIGNATURE {
        return None;
    }
    let entries_lba = le64(&header, 72);
    let count = le32(&header, 80).min(MAX_GPT_ENTRIES);
    let entry_size = le32(&header, 84) as usize;
    if !(128..=4096).contains(&entry_size) {
        return None;
    }

    let mut table = vec![0u8; count as usize * entry_size];
    source
        .read_exact_at(entries_lba.checked_mul(SECTOR_SIZE)?, &mut table)
        .ok()?;

    let mut parts = Vec::new();
    for raw in table.chunks_exact(entry_size) {
        let mut guid = [0u8; 16];
        guid.copy_from_slice(&raw[..16]);
        if guid == [0u8; 16] {
            continue;
        }
        let type_guid = Uuid::from_bytes_le(guid);
        let first = le64(raw, 32);
        let last = le64(raw, 40);
        if last < first {
            continue;
        }
        let name: Vec<u16> = (0..36)
            .map(|i| le16(raw, 56 + i * 2))
            .take_while(|c| *c != 0)
            .collect();
        let name = String::from_utf16_lossy(&name);
        let kind = gpt_description(&type_guid);
        parts.push(Partition {
            index: parts.len() + 1,
            scheme: Scheme::Gpt,
            offset: first * SECTOR_SIZE,
            len: (last - first + 1) * SECTOR_SIZE,
            type_id: type_guid.to_string(),
            description: if name.is_empty() {
                kind.to_string()
            } else {
                format!("{} ({})", name, kind)
            },
        });
    }
    tracing::debug!(count = parts.len(), "Read GPT partition table");
    Some(parts)
}
