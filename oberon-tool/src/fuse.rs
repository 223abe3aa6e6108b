//! FUSE bridge presenting the image as a single flat directory.
//!
//! Inode 1 is the directory; every file's inode is its header address.
//! The driver has no truncate, so size-changing `setattr` requests are
//! rejected.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use log::debug;
use oberon_fs::{File, FileSystem, FsError};

const TTL: Duration = Duration::from_secs(1);

pub fn mount(fs: &FileSystem, mountpoint: &Path) -> std::io::Result<()> {
    let options = [MountOption::FSName("oberon".to_string())];
    fuser::mount2(Bridge { fs }, mountpoint, &options)
}

struct Bridge<'fs> {
    fs: &'fs FileSystem,
}

fn errno(err: &FsError) -> i32 {
    match err {
        FsError::Io(_) | FsError::Corrupted(_) | FsError::InvalidSectorAddress(_) => libc::EIO,
        FsError::InvalidFileName(_) => libc::EINVAL,
        FsError::AlreadyExists(_) => libc::EEXIST,
        FsError::NotFound(_) => libc::ENOENT,
        FsError::DiskFull => libc::ENOSPC,
        FsError::FileTooLarge => libc::EFBIG,
    }
}

fn file_attr(file: &File<'_>, uid: u32, gid: u32) -> FileAttr {
    let created = file.creation_time();
    FileAttr {
        ino: u64::from(file.header_addr()),
        size: u64::from(file.size()),
        blocks: u64::from(file.size().div_ceil(512)),
        atime: created,
        mtime: created,
        ctime: created,
        crtime: created,
        kind: FileType::RegularFile,
        perm: 0o666,
        nlink: 1,
        uid,
        gid,
        rdev: 0,
        blksize: 2048,
        flags: 0,
    }
}

fn root_attr(uid: u32, gid: u32) -> FileAttr {
    FileAttr {
        ino: FUSE_ROOT_ID,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o755,
        nlink: 2,
        uid,
        gid,
        rdev: 0,
        blksize: 2048,
        flags: 0,
    }
}

impl<'fs> Bridge<'fs> {
    fn file_by_ino(&self, ino: u64) -> Result<File<'fs>, i32> {
        let addr = u32::try_from(ino).map_err(|_| libc::ENOENT)?;
        self.fs.file_from_header(addr).map_err(|err| {
            debug!("no file for inode {ino}: {err}");
            match err {
                FsError::InvalidSectorAddress(_) => libc::ENOENT,
                other => errno(&other),
            }
        })
    }
}

impl Filesystem for Bridge<'_> {
    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup {name:?}");
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.find(name) {
            Ok(Some(file)) => reply.entry(&TTL, &file_attr(&file, req.uid(), req.gid()), 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == FUSE_ROOT_ID {
            reply.attr(&TTL, &root_attr(req.uid(), req.gid()));
            return;
        }
        match self.file_by_ino(ino) {
            Ok(file) => reply.attr(&TTL, &file_attr(&file, req.uid(), req.gid())),
            Err(code) => reply.error(code),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == FUSE_ROOT_ID {
            reply.attr(&TTL, &root_attr(req.uid(), req.gid()));
            return;
        }
        match self.file_by_ino(ino) {
            Ok(file) => {
                // Attribute changes are not persisted and truncation is
                // not supported; only a no-op size change passes.
                if let Some(size) = size {
                    if size != u64::from(file.size()) {
                        reply.error(libc::EOPNOTSUPP);
                        return;
                    }
                }
                reply.attr(&TTL, &file_attr(&file, req.uid(), req.gid()));
            }
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir at offset {offset}");
        if ino != FUSE_ROOT_ID {
            reply.error(libc::ENOTDIR);
            return;
        }
        let files = match self.fs.list(|_| true) {
            Ok(files) => files,
            Err(err) => {
                reply.error(errno(&err));
                return;
            }
        };
        let mut entries = vec![
            (FUSE_ROOT_ID, FileType::Directory, ".".to_string()),
            (FUSE_ROOT_ID, FileType::Directory, "..".to_string()),
        ];
        for file in &files {
            entries.push((
                u64::from(file.header_addr()),
                FileType::RegularFile,
                file.name(),
            ));
        }
        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read inode {ino}, offset {offset}, size {size}");
        let file = match self.file_by_ino(ino) {
            Ok(file) => file,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let Ok(pos) = u32::try_from(offset) else {
            // Negative is invalid; anything past 4G is past EOF.
            if offset < 0 {
                reply.error(libc::EINVAL);
            } else {
                reply.data(&[]);
            }
            return;
        };
        match file.read_at(pos, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write inode {ino}, offset {offset}, {} bytes", data.len());
        let mut file = match self.file_by_ino(ino) {
            Ok(file) => file,
            Err(code) => {
                reply.error(code);
                return;
            }
        };
        let Ok(pos) = u32::try_from(offset) else {
            reply.error(if offset < 0 { libc::EINVAL } else { libc::EFBIG });
            return;
        };
        match file.write_at(pos, data) {
            Ok(()) => reply.written(data.len() as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create {name:?}");
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let result = self.fs.create(name).and_then(|file| {
            file.register()?;
            Ok(file)
        });
        match result {
            Ok(file) => reply.created(&TTL, &file_attr(&file, req.uid(), req.gid()), 0, 0, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink {name:?}");
        if parent != FUSE_ROOT_ID {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        if self.fs.remove(name) {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }
}
