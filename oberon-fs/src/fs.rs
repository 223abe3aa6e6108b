//! Top-level file-system state: directory, reservation map, allocator.
//!
//! One `FileSystem` owns the disk image. The directory list sits behind a
//! read/write lock, the reservation map behind its own lock; operations
//! that touch both take the directory lock first.

use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use crate::bitmap::BitMap;
use crate::dir::{self, DirEntry, Directory};
use crate::disk::DiskImage;
use crate::error::{FsError, Result};
use crate::file::File;
use crate::layout::{
    self, FileHeader, IndexSector, DIR_ROOT_ADR, HEADER_SIZE, MAP_MARK, SEC_TAB_SIZE,
};
use crate::sector::Sector;
use crate::SECTOR_MULTIPLIER;

/// In-memory reservation map, one bit per raw sector, rebuilt on every
/// open and never persisted.
struct SectorMap {
    map: BitMap,
    num_sectors: u32,
    used: u32,
}

impl SectorMap {
    fn new(num_sectors: u32) -> Self {
        let mut map = BitMap::new(num_sectors + 1);
        map.set(0); // sector 0 is illegal to use
        Self {
            map,
            num_sectors,
            used: 0,
        }
    }

    fn check(&self, addr: u32) -> Result<u32> {
        if addr % SECTOR_MULTIPLIER != 0 {
            return Err(FsError::InvalidSectorAddress(addr));
        }
        let raw = addr / SECTOR_MULTIPLIER;
        if raw < 1 || raw > self.num_sectors {
            return Err(FsError::InvalidSectorAddress(addr));
        }
        Ok(raw)
    }

    fn mark_used(&mut self, addr: u32) -> Result<()> {
        let raw = self.check(addr)?;
        if !self.map.test(raw) {
            self.map.set(raw);
            self.used += 1;
        }
        Ok(())
    }

    fn free(&mut self, addr: u32) -> Result<()> {
        let raw = self.check(addr)?;
        if self.map.test(raw) {
            self.map.clear(raw);
            self.used -= 1;
        }
        Ok(())
    }

    fn is_free(&self, addr: u32) -> Result<bool> {
        Ok(!self.map.test(self.check(addr)?))
    }

    /// First free sector at or after `hint + 29`, wrapping once around
    /// the disk. A full pass without a hit is "disk full".
    fn alloc(&mut self, hint: u32) -> Result<u32> {
        if hint % SECTOR_MULTIPLIER != 0 {
            return Err(FsError::InvalidSectorAddress(hint));
        }
        let size = self.num_sectors * SECTOR_MULTIPLIER;
        let hint = if hint > size { 0 } else { hint };
        let mut sec = hint + SECTOR_MULTIPLIER;
        if sec > size {
            sec = SECTOR_MULTIPLIER;
        }
        for _ in 0..self.num_sectors {
            let raw = sec / SECTOR_MULTIPLIER;
            if !self.map.test(raw) {
                self.map.set(raw);
                self.used += 1;
                return Ok(sec);
            }
            sec += SECTOR_MULTIPLIER;
            if sec > size {
                sec = SECTOR_MULTIPLIER;
            }
        }
        Err(FsError::DiskFull)
    }
}

pub struct FileSystem {
    disk: Mutex<DiskImage>,
    /// Disk size in encoded sector addresses.
    size: u32,
    num_sectors: u32,
    map: Mutex<SectorMap>,
    files: RwLock<Directory>,
}

impl FileSystem {
    /// Loads the directory and rebuilds the reservation map by walking
    /// every file's sector and extension tables. Any persisted map index
    /// at the last sector is invalidated first.
    pub fn open(mut disk: DiskImage) -> Result<Self> {
        let size = disk.size();
        let num_sectors = disk.num_sectors();
        let mut map = SectorMap::new(num_sectors);

        // Free space is recomputed from scratch; zero the map-index
        // mark so the source OS cannot trust a stale bitmap either.
        let mut last = disk.get_sector(size)?;
        if last.read_u32(0) == MAP_MARK {
            log::info!("invalidating persisted map index at sector {size}");
        }
        last.write_u32(0, 0);
        disk.put_sector(size, &last)?;

        log::info!("loading directory");
        let dir = dir::load(&mut disk)?;

        for &page in &dir.pages {
            map.mark_used(page)?;
        }
        for entry in &dir.entries {
            let header = FileHeader::from_sector(disk.get_sector(entry.adr)?, entry.adr)?;
            for i in 0..SEC_TAB_SIZE {
                let adr = header.sector_table_entry(i);
                if adr != 0 {
                    map.mark_used(adr)?;
                }
            }
            for ext in header.extension_table() {
                map.mark_used(ext)?;
                let index = IndexSector::from_sector(disk.get_sector(ext)?);
                for adr in index.entries() {
                    map.mark_used(adr)?;
                }
            }
        }
        log::info!("{} files occupying {} sectors", dir.entries.len(), map.used);

        Ok(Self {
            disk: Mutex::new(disk),
            size,
            num_sectors,
            map: Mutex::new(map),
            files: RwLock::new(dir),
        })
    }

    /// Disk size in encoded sector addresses.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn get_sector(&self, addr: u32) -> Result<Sector> {
        self.disk.lock().unwrap().get_sector(addr)
    }

    pub(crate) fn put_sector(&self, addr: u32, sec: &Sector) -> Result<()> {
        self.disk.lock().unwrap().put_sector(addr, sec)
    }

    /// Random allocation hint, spreading new files across the disk.
    pub(crate) fn random_hint(&self) -> u32 {
        rand::random::<u32>() % self.num_sectors * SECTOR_MULTIPLIER
    }

    pub fn alloc_sector(&self, hint: u32) -> Result<u32> {
        self.map.lock().unwrap().alloc(hint)
    }

    pub fn free_sector(&self, addr: u32) -> Result<()> {
        self.map.lock().unwrap().free(addr)
    }

    pub fn is_sector_free(&self, addr: u32) -> Result<bool> {
        self.map.lock().unwrap().is_free(addr)
    }

    pub fn find(&self, name: &str) -> Result<Option<File<'_>>> {
        let adr = {
            let files = self.files.read().unwrap();
            files.entries.iter().find(|e| e.name == name).map(|e| e.adr)
        };
        match adr {
            Some(adr) => Ok(Some(self.file_from_header(adr)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, filter: impl Fn(&File<'_>) -> bool) -> Result<Vec<File<'_>>> {
        let addrs: Vec<u32> = {
            let files = self.files.read().unwrap();
            files.entries.iter().map(|e| e.adr).collect()
        };
        let mut result = Vec::with_capacity(addrs.len());
        for adr in addrs {
            let file = self.file_from_header(adr)?;
            if filter(&file) {
                result.push(file);
            }
        }
        Ok(result)
    }

    /// Builds a FileObject from its header address, validating the mark.
    pub fn file_from_header(&self, addr: u32) -> Result<File<'_>> {
        let header = FileHeader::from_sector(self.get_sector(addr)?, addr)?;
        Ok(File::new(self, header, addr))
    }

    /// Creates a new file with an empty, flushed header. The file enters
    /// the directory only when it is registered.
    pub fn create(&self, name: &str) -> Result<File<'_>> {
        layout::validate_filename(name)?;
        let addr = self.alloc_sector(self.random_hint())?;
        let mut header = FileHeader::new_zeroed();
        header.set_name(name);
        header.set_aleng(0);
        header.set_bleng(HEADER_SIZE as u16);
        header.set_sector_table_entry(0, addr);
        header.set_timestamp(SystemTime::now());
        self.put_sector(addr, header.as_sector())?;
        log::debug!("created {name:?} at {addr}");
        Ok(File::new(self, header, addr))
    }

    /// Enters a created file into the directory, keeping the list sorted.
    pub fn register(&self, file: &File<'_>) -> Result<()> {
        let name = file.name();
        let mut files = self.files.write().unwrap();
        if files.entries.iter().any(|e| e.name == name) {
            return Err(FsError::AlreadyExists(name));
        }
        let pos = files
            .entries
            .iter()
            .position(|e| e.name.as_str() > name.as_str())
            .unwrap_or(files.entries.len());
        files.entries.insert(
            pos,
            DirEntry {
                name,
                adr: file.header_addr(),
            },
        );
        files.dirty = true;
        Ok(())
    }

    /// Drops the directory entry. The file's sectors stay reserved until
    /// the next open; nothing reclaims them.
    pub fn remove(&self, name: &str) -> bool {
        let mut files = self.files.write().unwrap();
        match files.entries.iter().position(|e| e.name == name) {
            Some(pos) => {
                files.entries.remove(pos);
                files.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Rebuilds and flushes the directory tree if anything changed.
    pub fn close(&self) -> Result<()> {
        let mut files = self.files.write().unwrap();
        if !files.dirty {
            return Ok(());
        }
        files.entries.sort_by(|a, b| a.name.cmp(&b.name));

        {
            let mut map = self.map.lock().unwrap();
            for &page in &files.pages {
                map.free(page)?;
            }
        }

        let old_pages = files.pages.clone();
        let mut reuse = old_pages.iter().copied();
        let mut new_pages: Vec<u32> = Vec::new();
        let mut provider = || -> Result<u32> {
            let addr = match reuse.next() {
                Some(addr) => {
                    self.map.lock().unwrap().mark_used(addr)?;
                    addr
                }
                None => self.alloc_sector(0)?,
            };
            new_pages.push(addr);
            Ok(addr)
        };
        let mut root = dir::rebuild(&files.entries, &mut provider)?;

        // The provider reuses the old pages in order, so the root comes
        // out on 29 again; pin it regardless.
        debug_assert_eq!(root.addr, DIR_ROOT_ADR);
        root.addr = DIR_ROOT_ADR;

        {
            let mut disk = self.disk.lock().unwrap();
            dir::flush(&root, &mut disk)?;
            disk.flush()?;
        }

        log::info!(
            "wrote {} files in {} directory pages, freed {} pages",
            files.entries.len(),
            new_pages.len(),
            old_pages.len().saturating_sub(new_pages.len())
        );
        files.pages = new_pages;
        files.dirty = false;
        Ok(())
    }
}
