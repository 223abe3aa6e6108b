//! Disk image access: partition scan, boot block, sector I/O.
//!
//! The image is addressed in 512-byte blocks at the host level and in
//! 2048-byte sectors at the driver level. Sector addresses crossing this
//! API are encoded (raw 1-based number × 29).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;

use crate::error::{FsError, Result};
use crate::sector::Sector;
use crate::{BLOCKS_PER_SECTOR, BLOCK_SIZE, SECTOR_MULTIPLIER, SECTOR_SIZE};

/// MBR partition type of a Native Oberon file system.
const OBERON_PARTITION_TYPE: u8 = 0x4f;

/// Partition types 5 and 15 chain to an extended boot record.
const EXTENDED_TYPES: [u8; 2] = [5, 15];

const PARTITION_TABLE_OFFSET: usize = 0x1be;
const PARTITION_ENTRY_SIZE: usize = 16;
const MAX_PARTITIONS: usize = 32;

/// Boot-block field holding the root directory offset, in blocks.
const ROOT_OFFSET_FIELD: usize = 0x0e;

const SECTOR_CACHE_SIZE: usize = 128;

#[derive(Clone, Copy, Debug)]
struct Partition {
    kind: u8,
    start: u32,
    size: u32,
}

pub struct DiskImage {
    file: std::fs::File,
    /// Start of the Oberon partition, in blocks.
    partition_offset: u32,
    /// Root directory offset inside the partition, in blocks.
    root_offset: u32,
    /// Highest raw sector number; sectors are 1-based.
    num_sectors: u32,
    cache: LruCache<u32, Sector>,
}

impl DiskImage {
    /// Opens an image read/write and locates the first Oberon partition.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut disk = Self {
            file,
            partition_offset: 0,
            root_offset: 0,
            num_sectors: 0,
            cache: LruCache::new(NonZeroUsize::new(SECTOR_CACHE_SIZE).unwrap()),
        };
        disk.init()?;
        Ok(disk)
    }

    fn init(&mut self) -> Result<()> {
        let partitions = self.read_partition_table()?;
        let oberon = partitions
            .iter()
            .find(|p| p.kind == OBERON_PARTITION_TYPE)
            .copied()
            .ok_or_else(|| {
                FsError::Corrupted(format!(
                    "no Oberon partition (type {OBERON_PARTITION_TYPE:#04x}) in {partitions:?}"
                ))
            })?;
        log::debug!(
            "Oberon partition at block {}, {} blocks",
            oberon.start,
            oberon.size
        );

        let boot = self.read_block(oberon.start)?;
        if &boot[3..9] != b"OBERON" {
            return Err(FsError::Corrupted(format!(
                "bad boot block: {:02x?} at offset 3",
                &boot[3..9]
            )));
        }
        // Some images in the wild carry a valid OBERON boot block but a
        // non-standard signature word; accept them.
        if u16::from_le_bytes([boot[510], boot[511]]) != 0xaa55 {
            log::warn!(
                "boot block signature is {:02x} {:02x}, not 55 aa",
                boot[510],
                boot[511]
            );
        }

        let root_offset = u16::from_le_bytes([boot[ROOT_OFFSET_FIELD], boot[ROOT_OFFSET_FIELD + 1]]);
        self.partition_offset = oberon.start;
        self.root_offset = u32::from(root_offset);
        if oberon.size <= self.root_offset {
            return Err(FsError::Corrupted(format!(
                "partition of {} blocks cannot hold root offset {}",
                oberon.size, self.root_offset
            )));
        }
        self.num_sectors = (oberon.size - self.root_offset) / BLOCKS_PER_SECTOR;
        if self.num_sectors == 0 {
            return Err(FsError::Corrupted("partition holds no sectors".to_string()));
        }
        log::info!(
            "file system: {} sectors of {} bytes, root offset {} blocks",
            self.num_sectors,
            SECTOR_SIZE,
            self.root_offset
        );
        Ok(())
    }

    /// Disk size in encoded Oberon sector addresses.
    pub fn size(&self) -> u32 {
        self.num_sectors * SECTOR_MULTIPLIER
    }

    pub(crate) fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    /// Reads the 2048-byte sector at an encoded address.
    pub fn get_sector(&mut self, addr: u32) -> Result<Sector> {
        let raw = self.check_addr(addr)?;
        if let Some(sec) = self.cache.get(&raw) {
            return Ok(sec.clone());
        }
        let mut sec = Sector::new_zeroed();
        self.file.seek(SeekFrom::Start(self.sector_pos(raw)))?;
        self.file.read_exact(sec.as_bytes_mut())?;
        self.cache.put(raw, sec.clone());
        Ok(sec)
    }

    /// Writes the 2048-byte sector at an encoded address.
    pub fn put_sector(&mut self, addr: u32, sec: &Sector) -> Result<()> {
        let raw = self.check_addr(addr)?;
        self.file.seek(SeekFrom::Start(self.sector_pos(raw)))?;
        self.file.write_all(sec.as_bytes())?;
        self.cache.put(raw, sec.clone());
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn sector_pos(&self, raw: u32) -> u64 {
        u64::from(self.partition_offset + self.root_offset + (raw - 1) * BLOCKS_PER_SECTOR)
            * BLOCK_SIZE as u64
    }

    fn check_addr(&self, addr: u32) -> Result<u32> {
        if addr % SECTOR_MULTIPLIER != 0 {
            return Err(FsError::InvalidSectorAddress(addr));
        }
        let raw = addr / SECTOR_MULTIPLIER;
        if raw < 1 || raw > self.num_sectors {
            return Err(FsError::InvalidSectorAddress(addr));
        }
        Ok(raw)
    }

    fn read_block(&mut self, block: u32) -> Result<[u8; BLOCK_SIZE]> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.file
            .seek(SeekFrom::Start(u64::from(block) * BLOCK_SIZE as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Primary entries plus the logical partitions of every extended
    /// entry, flattened in table order.
    fn read_partition_table(&mut self) -> Result<Vec<Partition>> {
        let mut partitions = Vec::new();
        for part in self.read_primary()? {
            if EXTENDED_TYPES.contains(&part.kind) {
                partitions.extend(self.read_logical(part.start)?);
            } else {
                partitions.push(part);
            }
        }
        Ok(partitions)
    }

    fn read_primary(&mut self) -> Result<Vec<Partition>> {
        let mbr = self.read_block(0)?;
        check_table_signature(&mbr, 0)?;

        let mut partitions = Vec::new();
        for i in 0..4 {
            if let Some(part) = parse_entry(&mbr, i) {
                partitions.push(part);
            }
        }
        Ok(partitions)
    }

    /// Walks an extended-partition chain. Logical partition starts are
    /// relative to their own boot record; chain links are relative to the
    /// outer extended partition.
    fn read_logical(&mut self, first: u32) -> Result<Vec<Partition>> {
        let mut partitions = Vec::new();
        let mut sec = first;
        for _ in 0..MAX_PARTITIONS {
            let ebr = self.read_block(sec)?;
            check_table_signature(&ebr, sec)?;

            for i in 0..4 {
                if let Some(mut part) = parse_entry(&ebr, i) {
                    if !EXTENDED_TYPES.contains(&part.kind) {
                        part.start += sec;
                        partitions.push(part);
                    }
                }
            }

            let next = (0..4)
                .filter_map(|i| parse_entry(&ebr, i))
                .find(|p| EXTENDED_TYPES.contains(&p.kind));
            match next {
                Some(link) => sec = link.start + first,
                None => return Ok(partitions),
            }
        }
        Err(FsError::Corrupted(format!(
            "extended partition chain at block {first} does not terminate"
        )))
    }
}

fn parse_entry(block: &[u8; BLOCK_SIZE], index: usize) -> Option<Partition> {
    let e = PARTITION_TABLE_OFFSET + index * PARTITION_ENTRY_SIZE;
    let kind = block[e + 4];
    let start = u32::from_le_bytes(block[e + 8..e + 12].try_into().unwrap());
    let size = u32::from_le_bytes(block[e + 12..e + 16].try_into().unwrap());
    if kind == 0 || size == 0 {
        return None;
    }
    Some(Partition { kind, start, size })
}

fn check_table_signature(block: &[u8; BLOCK_SIZE], at: u32) -> Result<()> {
    if block[510] != 0x55 || block[511] != 0xaa {
        return Err(FsError::Corrupted(format!(
            "bad partition table signature {:02x} {:02x} at block {at}",
            block[510], block[511]
        )));
    }
    Ok(())
}
