//! Adapts [`crate::ops::Core`]'s path-based operations to `fuser`'s
//! inode-based `Filesystem` trait.
//!
//! The container format has no concept of an inode number of its own, so
//! the bridge keeps a small table mapping the inode numbers it hands out
//! to the kernel back to the path they name. A node's block address
//! (stable for the node's whole lifetime) becomes its inode number,
//! offset by one so the root can keep FUSE's reserved inode `1`.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use libc::{O_ACCMODE, O_RDONLY, O_RDWR, O_WRONLY};
use log::{error, warn};

use crate::consts::{is_dir_mode, PERM_MASK};
use crate::ops::{Attr, Core};

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

/// The `fuser::Filesystem` implementation wrapping a mounted [`Core`].
pub struct BoxFs {
    core: Core,
    root_addr: u32,
    paths: HashMap<u64, String>,
}

impl BoxFs {
    pub fn new(core: Core, root_addr: u32) -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_INO, "/".to_string());
        Self {
            core,
            root_addr,
            paths,
        }
    }

    fn ino_for_addr(&self, addr: u32) -> u64 {
        if addr == self.root_addr {
            ROOT_INO
        } else {
            addr as u64 + 1
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    fn child_path(parent: &str, name: &OsStr) -> String {
        let name = name.to_string_lossy();
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }

    fn remember(&mut self, path: String, attr: &Attr) -> u64 {
        let ino = self.ino_for_addr(attr.addr);
        self.paths.insert(ino, path);
        ino
    }

    fn to_file_attr(req: &Request<'_>, ino: u64, attr: &Attr) -> FileAttr {
        let kind = if is_dir_mode(attr.mode) {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mtime = UNIX_EPOCH + Duration::from_secs(attr.mtime as u64);
        FileAttr {
            ino,
            size: attr.size,
            blocks: (attr.size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: attr.mode & PERM_MASK,
            nlink: attr.nlink as u32,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn decode_access(flags: i32) -> (bool, bool) {
        match flags & O_ACCMODE {
            O_RDONLY => (true, false),
            O_WRONLY => (false, true),
            O_RDWR => (true, true),
            _ => (true, false),
        }
    }
}

impl Filesystem for BoxFs {
    fn destroy(&mut self) {
        if let Err(e) = self.core.unmount() {
            error!("unmount failed: {e}");
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.core.getattr(&child_path) {
            Ok(attr) => {
                let ino = self.remember(child_path, &attr);
                reply.entry(&TTL, &Self::to_file_attr(req, ino, &attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.core.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &Self::to_file_attr(req, ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        if let Some(mode) = mode {
            if let Err(e) = self.core.chmod(&path, mode as u16 & PERM_MASK) {
                reply.error(e.to_errno());
                return;
            }
        }
        if let Some(size) = size {
            if size > u32::MAX as u64 {
                reply.error(libc::EFBIG);
                return;
            }
            if let Err(e) = self.core.truncate(&path, size as u32) {
                reply.error(e.to_errno());
                return;
            }
        }
        if let Some(mtime) = mtime {
            let secs = match mtime {
                fuser::TimeOrNow::SpecificTime(t) => t
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0),
                fuser::TimeOrNow::Now => crate::time::now_secs(),
            };
            if let Err(e) = self.core.utime(&path, secs) {
                reply.error(e.to_errno());
                return;
            }
        }
        match self.core.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &Self::to_file_attr(req, ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);
        let perm = (mode & !umask & 0o777) as u16;
        match self.core.mkdir(&child_path, perm) {
            Ok(_) => match self.core.getattr(&child_path) {
                Ok(attr) => {
                    let ino = self.remember(child_path, &attr);
                    reply.entry(&TTL, &Self::to_file_attr(req, ino, &attr), 0);
                }
                Err(e) => reply.error(e.to_errno()),
            },
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);
        let perm = (mode & !umask & 0o777) as u16;
        if let Err(e) = self.core.create(&child_path, perm) {
            reply.error(e.to_errno());
            return;
        }
        let attr = match self.core.getattr(&child_path) {
            Ok(attr) => attr,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let ino = self.remember(child_path.clone(), &attr);
        let (read, write) = Self::decode_access(flags);
        match self.core.open(&child_path, read, write) {
            Ok(fh) => reply.created(&TTL, &Self::to_file_attr(req, ino, &attr), 0, fh as u64, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.core.unlink(&child_path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::EINVAL);
            return;
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.core.rmdir(&child_path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (Some(existing_path), Some(new_parent_path)) = (self.path_of(ino), self.path_of(newparent))
        else {
            reply.error(libc::EINVAL);
            return;
        };
        let new_path = Self::child_path(&new_parent_path, newname);
        if let Err(e) = self.core.link(&existing_path, &new_path) {
            reply.error(e.to_errno());
            return;
        }
        match self.core.getattr(&new_path) {
            Ok(attr) => {
                let ino = self.remember(new_path, &attr);
                reply.entry(&TTL, &Self::to_file_attr(req, ino, &attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        let (read, write) = Self::decode_access(flags);
        match self.core.open(&path, read, write) {
            Ok(fh) => reply.opened(fh as u64, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.core.read(fh as usize, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.core.write(fh as usize, offset as u64, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.core.release(fh as usize) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.core.opendir(&path) {
            Ok(fh) => reply.opened(fh as u64, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        match self.core.release(fh as usize) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
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
        let Some(self_path) = self.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };

        // The directory payload already carries real `.`/`..` entries
        // (spec §3), so there is nothing to synthesize here.
        let children = match self.core.readdir(&self_path) {
            Ok(children) => children,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        for (i, child) in children.iter().enumerate().skip(offset as usize) {
            let kind = if is_dir_mode(child.mode) {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            let child_ino = self.ino_for_addr(child.addr);
            let next_offset = (i + 1) as i64;
            let name = String::from_utf8_lossy(&child.name).into_owned();
            if reply.add(child_ino, next_offset, kind, OsStr::new(&name)) {
                break;
            }
        }
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::EINVAL);
            return;
        };
        match self.core.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.core.statfs() {
            Ok((total, free)) => {
                let bsize = 1u32;
                reply.statfs(total, free, free, 0, 0, bsize, 255, bsize);
            }
            Err(e) => {
                warn!("statfs failed: {e}");
                reply.error(e.to_errno());
            }
        }
    }
}
