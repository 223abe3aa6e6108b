//! The directory B-tree.
//!
//! On disk the directory is a B-tree of 50-entry pages rooted at address
//! 29. In memory it is a flat, sorted list of (name, header address)
//! pairs; the tree shape only matters for persistence. A dirty directory
//! is rebuilt balanced from scratch and flushed on close.

use std::collections::HashSet;

use crate::disk::DiskImage;
use crate::error::{FsError, Result};
use crate::layout::{DirPageSector, DIR_PAGE_SIZE, DIR_ROOT_ADR};

#[derive(Clone)]
pub(crate) struct DirEntry {
    pub name: String,
    pub adr: u32,
}

pub(crate) struct Directory {
    /// All files, in name order.
    pub entries: Vec<DirEntry>,
    /// Addresses of the pages backing the on-disk tree.
    pub pages: Vec<u32>,
    pub dirty: bool,
}

/// Reads the whole tree from disk, collecting entries in key order and
/// page addresses in visit order (the root first).
pub(crate) fn load(disk: &mut DiskImage) -> Result<Directory> {
    let mut dir = Directory {
        entries: Vec::new(),
        pages: Vec::new(),
        dirty: false,
    };
    let mut seen = HashSet::new();
    load_page(disk, DIR_ROOT_ADR, 0, &mut seen, &mut dir)?;
    Ok(dir)
}

fn load_page(
    disk: &mut DiskImage,
    addr: u32,
    parent: u32,
    seen: &mut HashSet<u32>,
    dir: &mut Directory,
) -> Result<()> {
    if !seen.insert(addr) {
        return Err(FsError::Corrupted(format!(
            "cycle in directory: page {addr} reached again from {parent}"
        )));
    }
    let page = DirPageSector::from_sector(disk.get_sector(addr)?, addr)?;
    dir.pages.push(addr);

    let m = page.m() as usize;
    log::debug!("directory page {addr}: {m} entries");
    if page.p0() != 0 {
        load_page(disk, page.p0(), addr, seen, dir)?;
    }
    for i in 0..m {
        dir.entries.push(DirEntry {
            name: page.entry_name(i),
            adr: page.entry_adr(i),
        });
        let p = page.entry_p(i);
        if p != 0 {
            load_page(disk, p, addr, seen, dir)?;
        }
    }
    Ok(())
}

pub(crate) struct BuildPage {
    pub addr: u32,
    p0: Option<Box<BuildPage>>,
    entries: Vec<(DirEntry, Option<Box<BuildPage>>)>,
}

/// Builds a balanced tree over sorted `entries`, drawing page addresses
/// from `alloc_page` (the provider hands out reclaimed addresses first,
/// so the root lands back on 29). An empty directory still gets its one
/// empty leaf page.
pub(crate) fn rebuild(
    entries: &[DirEntry],
    alloc_page: &mut dyn FnMut() -> Result<u32>,
) -> Result<BuildPage> {
    let addr = alloc_page()?;
    if entries.len() <= DIR_PAGE_SIZE {
        return Ok(BuildPage {
            addr,
            p0: None,
            entries: entries.iter().map(|e| (e.clone(), None)).collect(),
        });
    }

    // Split into 51 buckets so that at most 50 separator keys remain on
    // this page. A bucket is never smaller than a full page.
    let bucket_size = entries
        .len()
        .div_ceil(DIR_PAGE_SIZE + 1)
        .max(DIR_PAGE_SIZE);
    let mut chunks = entries.chunks(bucket_size);

    let p0 = Some(Box::new(rebuild(chunks.next().unwrap(), alloc_page)?));
    let mut page_entries = Vec::new();
    for chunk in chunks {
        let subtree = if chunk.len() > 1 {
            Some(Box::new(rebuild(&chunk[1..], alloc_page)?))
        } else {
            None
        };
        page_entries.push((chunk[0].clone(), subtree));
    }
    Ok(BuildPage {
        addr,
        p0,
        entries: page_entries,
    })
}

/// Serializes the built tree, page by page.
pub(crate) fn flush(page: &BuildPage, disk: &mut DiskImage) -> Result<()> {
    let mut sec = DirPageSector::new_zeroed();
    sec.set_m(page.entries.len() as u16);
    sec.set_p0(page.p0.as_ref().map_or(0, |p| p.addr));
    for (i, (entry, subtree)) in page.entries.iter().enumerate() {
        sec.set_entry(
            i,
            &entry.name,
            entry.adr,
            subtree.as_ref().map_or(0, |p| p.addr),
        );
    }
    disk.put_sector(page.addr, sec.as_sector())?;

    if let Some(p0) = &page.p0 {
        flush(p0, disk)?;
    }
    for (_, subtree) in &page.entries {
        if let Some(subtree) = subtree {
            flush(subtree, disk)?;
        }
    }
    Ok(())
}
