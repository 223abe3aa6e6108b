//! Per-file operations on top of the two-level sector index.
//!
//! File sector 0 is the header sector; its first 352 bytes are metadata
//! and the rest already holds file data. Sectors 0..64 are addressed by
//! the header's sector table, everything beyond through the extension
//! table's index sectors.

use std::time::SystemTime;

use crate::error::{FsError, Result};
use crate::fs::FileSystem;
use crate::layout::{
    self, FileHeader, IndexSector, EXT_TAB_SIZE, HEADER_SIZE, INDEX_SIZE, SEC_TAB_SIZE,
};
use crate::sector::Sector;
use crate::{MAX_FILE_SECTORS, MAX_FILE_SIZE, SECTOR_SIZE};

/// A file inside the image. Carries its own copy of the header sector;
/// the disk copy stays authoritative and is rewritten on every change.
pub struct File<'fs> {
    fs: &'fs FileSystem,
    header: FileHeader,
    header_addr: u32,
}

impl<'fs> File<'fs> {
    pub(crate) fn new(fs: &'fs FileSystem, header: FileHeader, header_addr: u32) -> Self {
        Self {
            fs,
            header,
            header_addr,
        }
    }

    pub fn name(&self) -> String {
        self.header.name()
    }

    /// Encoded address of the header sector; doubles as the file's
    /// stable identity.
    pub fn header_addr(&self) -> u32 {
        self.header_addr
    }

    pub fn creation_time(&self) -> SystemTime {
        self.header.timestamp()
    }

    /// Logical size in bytes.
    pub fn size(&self) -> u32 {
        u32::from(self.header.aleng()) * SECTOR_SIZE as u32 + u32::from(self.header.bleng())
            - HEADER_SIZE as u32
    }

    /// Enters the file into the directory.
    pub fn register(&self) -> Result<()> {
        self.fs.register(self)
    }

    /// Renames the header in place. A directory entry, if one exists,
    /// keeps the old name.
    pub fn set_name(&mut self, name: &str) -> Result<()> {
        layout::validate_filename(name)?;
        self.header.set_name(name);
        self.fs.put_sector(self.header_addr, self.header.as_sector())
    }

    /// Logical byte position -> (file sector index, offset in sector).
    fn physical_pos(pos: u32) -> (u32, usize) {
        let p = pos + HEADER_SIZE as u32;
        (p / SECTOR_SIZE as u32, (p % SECTOR_SIZE as u32) as usize)
    }

    /// Disk address of the file's i-th sector.
    fn sector_addr(&self, index: u32) -> Result<u32> {
        if (index as usize) < SEC_TAB_SIZE {
            let adr = self.header.sector_table_entry(index as usize);
            if adr == 0 {
                return Err(FsError::Corrupted(format!(
                    "file {:?}: sector {index} is unmapped",
                    self.name()
                )));
            }
            return Ok(adr);
        }

        let j = index as usize - SEC_TAB_SIZE;
        let k = j / INDEX_SIZE;
        if k >= EXT_TAB_SIZE {
            return Err(FsError::FileTooLarge);
        }
        let ext = self.header.extension_table();
        let Some(&index_addr) = ext.get(k) else {
            return Err(FsError::Corrupted(format!(
                "file {:?}: index sector {k} for sector {index} missing",
                self.name()
            )));
        };
        let isec = IndexSector::from_sector(self.fs.get_sector(index_addr)?);
        let adr = isec.entry(j % INDEX_SIZE);
        if adr == 0 {
            return Err(FsError::Corrupted(format!(
                "file {:?}: sector {index} is unmapped",
                self.name()
            )));
        }
        Ok(adr)
    }

    /// Reads up to `len` bytes at `pos`, clipped to the end of the file.
    pub fn read_at(&self, pos: u32, len: u32) -> Result<Vec<u8>> {
        let size = self.size();
        if pos >= size {
            return Ok(Vec::new());
        }
        let len = len.min(size - pos) as usize;
        let mut data = Vec::with_capacity(len);

        let (first, offset) = Self::physical_pos(pos);
        let sec = self.fs.get_sector(self.sector_addr(first)?)?;
        let take = len.min(SECTOR_SIZE - offset);
        data.extend_from_slice(&sec.as_bytes()[offset..offset + take]);

        let mut index = first + 1;
        while data.len() < len {
            let sec = self.fs.get_sector(self.sector_addr(index)?)?;
            let take = (len - data.len()).min(SECTOR_SIZE);
            data.extend_from_slice(&sec.as_bytes()[..take]);
            index += 1;
        }
        Ok(data)
    }

    /// Writes `data` at `pos`, growing the file first if needed. Sectors
    /// are written in ascending index order.
    pub fn write_at(&mut self, pos: u32, data: &[u8]) -> Result<()> {
        let required = u64::from(pos) + data.len() as u64;
        if required > u64::from(MAX_FILE_SIZE) {
            return Err(FsError::FileTooLarge);
        }
        self.ensure_size(required as u32)?;
        if data.is_empty() {
            return Ok(());
        }

        let (first, offset) = Self::physical_pos(pos);
        let take = data.len().min(SECTOR_SIZE - offset);
        let addr = self.sector_addr(first)?;
        let mut sec = self.fs.get_sector(addr)?;
        sec.as_bytes_mut()[offset..offset + take].copy_from_slice(&data[..take]);
        self.fs.put_sector(addr, &sec)?;
        let mut data = &data[take..];

        if first == 0 {
            // The header sector itself was touched; pick up its new
            // byte layout from disk.
            self.header =
                FileHeader::from_sector(self.fs.get_sector(self.header_addr)?, self.header_addr)?;
        }

        let mut index = first + 1;
        while data.len() >= SECTOR_SIZE {
            let addr = self.sector_addr(index)?;
            let mut sec = Sector::new_zeroed();
            sec.as_bytes_mut().copy_from_slice(&data[..SECTOR_SIZE]);
            self.fs.put_sector(addr, &sec)?;
            data = &data[SECTOR_SIZE..];
            index += 1;
        }

        if !data.is_empty() {
            let addr = self.sector_addr(index)?;
            let mut sec = self.fs.get_sector(addr)?;
            sec.as_bytes_mut()[..data.len()].copy_from_slice(data);
            self.fs.put_sector(addr, &sec)?;
        }
        Ok(())
    }

    /// Grows the file to hold `new_size` bytes, allocating data sectors
    /// and index sectors as needed and flushing the header.
    fn ensure_size(&mut self, new_size: u32) -> Result<()> {
        if new_size <= self.size() {
            return Ok(());
        }
        let ss = SECTOR_SIZE as u32;
        let hs = HEADER_SIZE as u32;
        let cur_sectors = (self.size() + hs).div_ceil(ss);
        let new_total = new_size + hs;
        let new_sectors = new_total.div_ceil(ss);
        if new_sectors > MAX_FILE_SECTORS {
            return Err(FsError::FileTooLarge);
        }

        for index in cur_sectors..new_sectors {
            let addr = self.fs.alloc_sector(self.fs.random_hint())?;
            self.add_sector(index, addr)?;
        }

        // On an exact sector boundary the tail sector stays full rather
        // than flipping to an empty successor.
        let (aleng, bleng) = if new_total % ss == 0 {
            (new_total / ss - 1, ss)
        } else {
            (new_total / ss, new_total % ss)
        };
        self.header.set_aleng(aleng as u16);
        self.header.set_bleng(bleng as u16);
        self.fs.put_sector(self.header_addr, self.header.as_sector())
    }

    /// Records `addr` as the file's i-th sector, materializing the index
    /// sector for it first if necessary. The header itself is flushed by
    /// the caller.
    fn add_sector(&mut self, index: u32, addr: u32) -> Result<()> {
        if (index as usize) < SEC_TAB_SIZE {
            self.header.set_sector_table_entry(index as usize, addr);
            return Ok(());
        }

        let j = index as usize - SEC_TAB_SIZE;
        let k = j / INDEX_SIZE;
        if k >= EXT_TAB_SIZE {
            return Err(FsError::FileTooLarge);
        }

        let mut ext = self.header.extension_table();
        while ext.len() <= k {
            let hint = ext.last().copied().unwrap_or(0);
            let index_addr = self.fs.alloc_sector(hint)?;
            self.fs.put_sector(index_addr, &Sector::new_zeroed())?;
            ext.push(index_addr);
            self.header.set_extension_table(&ext);
        }

        let index_addr = ext[k];
        let mut isec = IndexSector::from_sector(self.fs.get_sector(index_addr)?);
        isec.set_entry(j % INDEX_SIZE, addr);
        self.fs.put_sector(index_addr, isec.as_sector())
    }
}
