//! The core file-operation surface (spec §4.7), sitting on top of the
//! block allocator, node protocol, directory engine, path resolver and
//! handle table. `Core` is the single entry point the FUSE bridge and the
//! CLI binaries drive; it owns the container and every piece of mutable
//! mount state.

use std::fs::File;

use log::{info, warn};

use crate::alloc::{self, AllocError};
use crate::consts::*;
use crate::container::Container;
use crate::dir::{self, DirError};
use crate::error::{Error, Result};
use crate::handle::{HandleTable, OpenFile};
use crate::node::{self, NodeHeader};
use crate::path::{self, PathCache};
use crate::time::now_secs;

/// Attributes reported for a resolved node.
#[derive(Debug, Clone, Copy)]
pub struct Attr {
    pub addr: u32,
    pub mtime: u32,
    pub nlink: u16,
    pub mode: u16,
    pub size: u64,
}

/// One entry produced by [`Core::readdir`].
#[derive(Debug, Clone)]
pub struct Listing {
    pub name: Vec<u8>,
    pub addr: u32,
    pub mode: u16,
}

/// The live, mounted filesystem.
pub struct Core {
    container: Container,
    root_addr: u32,
    free_head: u32,
    cache: PathCache,
    handles: HandleTable,
    read_only: bool,
}

impl Core {
    /// Mounts `file` as a container, reading the superblock.
    pub fn mount(file: File, read_only: bool) -> Result<Self> {
        let container = Container::new(file);
        let root_addr = container.read_u32_at(SB_ROOT_ADDR)?;
        let free_head = container.read_u32_at(SB_FREE_HEAD)?;
        info!("mounted container (root={root_addr}, free_head={free_head}, read_only={read_only})");
        Ok(Self {
            container,
            root_addr,
            free_head,
            cache: PathCache::new(),
            handles: HandleTable::new(),
            read_only,
        })
    }

    /// Flushes the backing file and drops the path cache. Any handles
    /// still open at this point are simply abandoned by the caller.
    pub fn unmount(&mut self) -> Result<()> {
        self.container.sync()?;
        self.cache.clear();
        info!("unmounted container");
        Ok(())
    }

    /// The block address of the root directory, used by the FUSE bridge
    /// to map its reserved root inode number onto this node.
    pub fn root_addr(&self) -> u32 {
        self.root_addr
    }

    fn resolve(&mut self, path: &str) -> Result<u32> {
        path::resolve(&self.container, &mut self.cache, self.root_addr, path)
    }

    fn header(&self, addr: u32) -> Result<NodeHeader> {
        node::read_header(&self.container, addr)
    }

    // -- attributes -----------------------------------------------------

    pub fn getattr(&mut self, path: &str) -> Result<Attr> {
        let addr = self.resolve(path)?;
        self.attr_of(addr)
    }

    fn attr_of(&self, addr: u32) -> Result<Attr> {
        let header = self.header(addr)?;
        let size = if is_reg_mode(header.mode) {
            node::read_size(&self.container, addr)? as u64
        } else {
            let spans = node::iterate_blocks(&self.container, addr, header.mode)?;
            dir::list_entries(&self.container, &spans)?.len() as u64
        };
        Ok(Attr {
            addr,
            mtime: header.mtime,
            nlink: header.nlink,
            mode: header.mode,
            size,
        })
    }

    pub fn chmod(&mut self, path: &str, perm: u16) -> Result<()> {
        self.reject_if_read_only()?;
        let addr = self.resolve(path)?;
        let header = self.header(addr)?;
        let new_mode = (header.mode & TYPE_MASK) | (perm & PERM_MASK);
        node::write_mode(&self.container, addr, new_mode)
    }

    pub fn utime(&mut self, path: &str, mtime: u32) -> Result<()> {
        self.reject_if_read_only()?;
        let addr = self.resolve(path)?;
        node::write_mtime(&self.container, addr, mtime)
    }

    /// Checks `path` against `mask`, a bitmask of `libc::{R,W,X,F}_OK`.
    /// `F_OK` (0) short-circuits to success once the path resolves; the
    /// other bits are tested against the owner permission bits only (spec
    /// §4.7: no process-credential enforcement).
    pub fn access(&mut self, path: &str, mask: i32) -> Result<()> {
        let addr = self.resolve(path)?;
        if mask == libc::F_OK {
            return Ok(());
        }
        let header = self.header(addr)?;
        if mask & libc::R_OK != 0 && header.mode & 0o400 == 0 {
            return Err(Error::PermissionDenied);
        }
        if mask & libc::W_OK != 0 && header.mode & 0o200 == 0 {
            return Err(Error::PermissionDenied);
        }
        if mask & libc::X_OK != 0 && header.mode & 0o100 == 0 {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    pub fn statfs(&self) -> Result<(u64, u64)> {
        let total = self.container.size()?;
        let mut free = 0u64;
        let mut cur = self.free_head;
        while cur != 0 {
            let size = self.container.read_u32_at(cur as u64)?;
            free += size as u64;
            cur = self.container.read_u32_at(cur as u64 + 4)?;
        }
        Ok((total, free))
    }

    // -- directory operations -------------------------------------------

    pub fn readdir(&mut self, path: &str) -> Result<Vec<Listing>> {
        let addr = self.resolve(path)?;
        let header = self.header(addr)?;
        if !is_dir_mode(header.mode) {
            return Err(Error::NotDir);
        }
        let spans = node::iterate_blocks(&self.container, addr, header.mode)?;
        let mut out = Vec::new();
        for entry in dir::list_entries(&self.container, &spans)? {
            let child_header = self.header(entry.child_addr)?;
            out.push(Listing {
                name: entry.name,
                addr: entry.child_addr,
                mode: child_header.mode,
            });
        }
        Ok(out)
    }

    /// Creates a new, empty subdirectory.
    ///
    /// Unlike [`Core::create`], a directory is never a bare header: it is
    /// born with `.` and `..` entries already in its payload and a link
    /// count of 2 (spec §3's "a freshly created directory has exactly two
    /// entries"). Its parent's link count is incremented to account for
    /// the new `..` pointing back at it.
    pub fn mkdir(&mut self, path: &str, perm: u16) -> Result<u32> {
        self.reject_if_read_only()?;
        let (parent, name) = path::split_parent(path)?;
        if name.as_bytes().len() > NAME_MAX || name.is_empty() {
            return Err(Error::NameTooLong);
        }
        let parent_addr = self.resolve(&parent)?;
        let parent_header = self.header(parent_addr)?;
        if !is_dir_mode(parent_header.mode) {
            return Err(Error::NotDir);
        }
        if parent_header.nlink == u16::MAX {
            return Err(Error::MaxLinks);
        }
        let parent_spans = node::iterate_blocks(&self.container, parent_addr, parent_header.mode)?;
        if dir::lookup(&self.container, &parent_spans, name.as_bytes())?.is_some() {
            return Err(Error::Exists);
        }

        let mode = TYPE_DIRECTORY | (perm & PERM_MASK);
        let new_addr = self.alloc_block(DIR_BLOCK_SIZE)?;
        node::init_head(&self.container, new_addr, now_secs(), 2, mode, 0)?;
        let payload_start = node::head_payload_start(new_addr, mode);
        self.container.write_u32_at(payload_start as u64, 0)?;
        let new_spans = node::iterate_blocks(&self.container, new_addr, mode)?;
        if let Err(e) = dir::insert_entry(&self.container, &new_spans, b".", new_addr)
            .and_then(|_| dir::insert_entry(&self.container, &new_spans, b"..", parent_addr))
        {
            alloc::free_chain(&self.container, &mut self.free_head, new_addr)?;
            return Err(e.into());
        }

        if let Err(e) =
            self.insert_with_growth(parent_addr, parent_header.mode, name.as_bytes(), new_addr)
        {
            alloc::free_chain(&self.container, &mut self.free_head, new_addr)?;
            return Err(e);
        }
        node::write_nlink(&self.container, parent_addr, parent_header.nlink + 1)?;
        node::write_mtime(&self.container, parent_addr, now_secs())?;
        self.cache.invalidate_subtree(&parent);
        Ok(new_addr)
    }

    /// Creates a new, empty regular file with link count 1.
    pub fn create(&mut self, path: &str, perm: u16) -> Result<u32> {
        self.reject_if_read_only()?;
        let (parent, name) = path::split_parent(path)?;
        if name.as_bytes().len() > NAME_MAX || name.is_empty() {
            return Err(Error::NameTooLong);
        }
        let parent_addr = self.resolve(&parent)?;
        let parent_header = self.header(parent_addr)?;
        if !is_dir_mode(parent_header.mode) {
            return Err(Error::NotDir);
        }
        let parent_spans = node::iterate_blocks(&self.container, parent_addr, parent_header.mode)?;
        if dir::lookup(&self.container, &parent_spans, name.as_bytes())?.is_some() {
            return Err(Error::Exists);
        }

        let mode = TYPE_REGULAR | (perm & PERM_MASK);
        let new_addr = self.alloc_block(REG_BLOCK_SIZE)?;
        node::init_head(&self.container, new_addr, now_secs(), 1, mode, 0)?;

        if let Err(e) =
            self.insert_with_growth(parent_addr, parent_header.mode, name.as_bytes(), new_addr)
        {
            alloc::free_chain(&self.container, &mut self.free_head, new_addr)?;
            return Err(e);
        }
        node::write_mtime(&self.container, parent_addr, now_secs())?;
        self.cache.invalidate_subtree(&parent);
        Ok(new_addr)
    }

    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.reject_if_read_only()?;
        let (parent, name) = path::split_parent(path)?;
        let parent_addr = self.resolve(&parent)?;
        let parent_header = self.header(parent_addr)?;
        let parent_spans = node::iterate_blocks(&self.container, parent_addr, parent_header.mode)?;
        let child_addr = dir::lookup(&self.container, &parent_spans, name.as_bytes())?
            .ok_or(Error::NoSuchEntry)?;
        let child_header = self.header(child_addr)?;
        if is_dir_mode(child_header.mode) {
            return Err(Error::IsDir);
        }
        if self.handles.is_open(child_addr) {
            return Err(Error::Busy);
        }

        dir::remove_entry(&self.container, &mut self.free_head, &parent_spans, name.as_bytes())?;
        if child_header.nlink <= 1 {
            alloc::free_chain(&self.container, &mut self.free_head, child_addr)?;
        } else {
            node::write_nlink(&self.container, child_addr, child_header.nlink - 1)?;
        }
        node::write_mtime(&self.container, parent_addr, now_secs())?;
        self.cache.invalidate_subtree(path);
        self.handles.invalidate_for_node(parent_addr);
        Ok(())
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.reject_if_read_only()?;
        if path == "/" {
            return Err(Error::Invalid);
        }
        let addr = self.resolve(path)?;
        let header = self.header(addr)?;
        if !is_dir_mode(header.mode) {
            return Err(Error::NotDir);
        }
        let spans = node::iterate_blocks(&self.container, addr, header.mode)?;
        if !dir::is_empty(&self.container, &spans)? {
            return Err(Error::NotEmpty);
        }

        let (parent, name) = path::split_parent(path)?;
        let parent_addr = self.resolve(&parent)?;
        let parent_header = self.header(parent_addr)?;
        let parent_spans = node::iterate_blocks(&self.container, parent_addr, parent_header.mode)?;
        dir::remove_entry(&self.container, &mut self.free_head, &parent_spans, name.as_bytes())?;
        alloc::free_chain(&self.container, &mut self.free_head, addr)?;
        node::write_nlink(&self.container, parent_addr, parent_header.nlink - 1)?;
        node::write_mtime(&self.container, parent_addr, now_secs())?;
        self.cache.invalidate_subtree(path);
        self.handles.invalidate_for_node(parent_addr);
        Ok(())
    }

    /// Creates a new hard link `new_path` to the existing regular file
    /// named by `existing_path`. Directories cannot be hard-linked.
    pub fn link(&mut self, existing_path: &str, new_path: &str) -> Result<()> {
        self.reject_if_read_only()?;
        let target_addr = self.resolve(existing_path)?;
        let target_header = self.header(target_addr)?;
        if is_dir_mode(target_header.mode) {
            return Err(Error::NotSupported);
        }
        if target_header.nlink == u16::MAX {
            return Err(Error::MaxLinks);
        }

        let (parent, name) = path::split_parent(new_path)?;
        if name.as_bytes().len() > NAME_MAX || name.is_empty() {
            return Err(Error::NameTooLong);
        }
        let parent_addr = self.resolve(&parent)?;
        let parent_header = self.header(parent_addr)?;
        if !is_dir_mode(parent_header.mode) {
            return Err(Error::NotDir);
        }
        let parent_spans = node::iterate_blocks(&self.container, parent_addr, parent_header.mode)?;
        if dir::lookup(&self.container, &parent_spans, name.as_bytes())?.is_some() {
            return Err(Error::Exists);
        }

        self.insert_with_growth(parent_addr, parent_header.mode, name.as_bytes(), target_addr)?;
        node::write_nlink(&self.container, target_addr, target_header.nlink + 1)?;
        node::write_mtime(&self.container, parent_addr, now_secs())?;
        self.cache.invalidate_subtree(&parent);
        Ok(())
    }

    /// Inserts `(name, child_addr)` into `parent_addr`'s directory,
    /// growing its block chain with fresh directory-sized blocks as many
    /// times as needed when the current chain has no room left.
    fn insert_with_growth(
        &mut self,
        parent_addr: u32,
        parent_mode: u16,
        name: &[u8],
        child_addr: u32,
    ) -> Result<()> {
        loop {
            let spans = node::iterate_blocks(&self.container, parent_addr, parent_mode)?;
            match dir::insert_entry(&self.container, &spans, name, child_addr) {
                Ok(()) => return Ok(()),
                Err(DirError::NoRoom) => {
                    let last = *spans.last().expect("a node always has a head block");
                    let new_block = self.alloc_block(DIR_BLOCK_SIZE)?;
                    self.container.write_u32_at(last.addr as u64 + 4, new_block)?;
                    self.handles.invalidate_for_node(parent_addr);
                }
                Err(DirError::Io(e)) => return Err(e),
            }
        }
    }

    // -- truncation -------------------------------------------------------

    pub fn truncate(&mut self, path: &str, new_size: u32) -> Result<()> {
        self.reject_if_read_only()?;
        let addr = self.resolve(path)?;
        let header = self.header(addr)?;
        if !is_reg_mode(header.mode) {
            return Err(Error::IsDir);
        }
        self.truncate_node(addr, header.mode, new_size)
    }

    /// Grows or shrinks a regular-file node's chain to `new_size`.
    ///
    /// A grow that cannot fully satisfy `new_size` still keeps whatever
    /// blocks it managed to append before the allocator ran out of room;
    /// `size` is only advanced on full success, so the extra capacity sits
    /// unused until a later operation consumes or truncates it away. This
    /// mirrors the container format's all-or-nothing size bookkeeping
    /// rather than attempting to unwind a partial grow.
    fn truncate_node(&mut self, addr: u32, mode: u16, new_size: u32) -> Result<()> {
        let old_size = node::read_size(&self.container, addr)?;
        if new_size == old_size {
            return Ok(());
        }
        if new_size < old_size {
            self.shrink_node(addr, mode, new_size)?;
        } else {
            self.grow_node(addr, mode, old_size, new_size)?;
        }
        self.handles.invalidate_for_node(addr);
        Ok(())
    }

    fn shrink_node(&mut self, addr: u32, mode: u16, new_size: u32) -> Result<()> {
        let (span, local) = node::locate_offset(&self.container, addr, mode, new_size as u64)?;
        let old_link = span.link;
        if local < span.capacity {
            self.container
                .zero_fill((span.payload_start + local) as u64, span.capacity - local)?;
        }
        if old_link != 0 {
            self.container.write_u32_at(span.addr as u64 + 4, 0)?;
            alloc::free_chain(&self.container, &mut self.free_head, old_link)?;
        }
        node::write_size(&self.container, addr, new_size)?;
        Ok(())
    }

    fn grow_node(&mut self, addr: u32, mode: u16, old_size: u32, new_size: u32) -> Result<()> {
        let spans = node::iterate_blocks(&self.container, addr, mode)?;
        let mut total_cap: u64 = spans.iter().map(|s| s.capacity as u64).sum();

        // Zero-fill whatever spare capacity already sits in the existing
        // chain between the old and new size (spec §4.7 Grow: "If there is
        // spare capacity in that block, zero-fill up to min(capacity,
        // new_size - current_size)"), generalized across however many
        // already-allocated blocks that spare capacity spans, not just the
        // one `locate_offset` would land on for `old_size`.
        let zero_end = (new_size as u64).min(total_cap);
        if zero_end > old_size as u64 {
            node::zero_logical_range(&self.container, &spans, old_size as u64, zero_end)?;
        }

        let mut last_addr = spans.last().expect("head block always present").addr;

        while total_cap < new_size as u64 {
            match alloc::allocate(&self.container, &mut self.free_head, REG_BLOCK_SIZE) {
                Ok(new_block) => {
                    self.link_new_block(last_addr, new_block, REG_BLOCK_SIZE)?;
                    total_cap += (REG_BLOCK_SIZE - CONT_PAYLOAD_OFFSET) as u64;
                    last_addr = new_block;
                }
                Err(AllocError::NoSpace { largest_free }) if largest_free > CONT_PAYLOAD_OFFSET => {
                    let new_block =
                        alloc::allocate(&self.container, &mut self.free_head, largest_free)?;
                    self.link_new_block(last_addr, new_block, largest_free)?;
                    total_cap += (largest_free - CONT_PAYLOAD_OFFSET) as u64;
                    last_addr = new_block;
                    warn!(
                        "grow: only a partial block ({largest_free} bytes) was available; \
                         node {addr} will report NoSpace without reaching the requested size"
                    );
                    return Err(Error::NoSpace);
                }
                Err(AllocError::NoSpace { .. }) => return Err(Error::NoSpace),
                Err(AllocError::Io(e)) => return Err(e),
            }
        }
        node::write_size(&self.container, addr, new_size)
    }

    fn link_new_block(&self, prev_addr: u32, new_block: u32, block_size: u32) -> Result<()> {
        self.container.write_u32_at(prev_addr as u64 + 4, new_block)?;
        self.container
            .zero_fill((new_block + CONT_PAYLOAD_OFFSET) as u64, block_size - CONT_PAYLOAD_OFFSET)
    }

    // -- open file handles ------------------------------------------------

    pub fn open(&mut self, path: &str, read: bool, write: bool) -> Result<usize> {
        if write && self.read_only {
            return Err(Error::ReadOnly);
        }
        let addr = self.resolve(path)?;
        let header = self.header(addr)?;
        if is_dir_mode(header.mode) {
            return Err(Error::IsDir);
        }
        if read && header.mode & 0o400 == 0 {
            return Err(Error::PermissionDenied);
        }
        if write && header.mode & 0o200 == 0 {
            return Err(Error::PermissionDenied);
        }
        self.handles.insert(OpenFile::new(addr, header.mode, read, write))
    }

    pub fn opendir(&mut self, path: &str) -> Result<usize> {
        let addr = self.resolve(path)?;
        let header = self.header(addr)?;
        if !is_dir_mode(header.mode) {
            return Err(Error::NotDir);
        }
        self.handles.insert(OpenFile::new(addr, header.mode, true, false))
    }

    pub fn release(&mut self, fh: usize) -> Result<()> {
        self.handles.remove(fh)
    }

    pub fn read(&mut self, fh: usize, offset: u64, len: u32) -> Result<Vec<u8>> {
        let head_addr = self.handles.get(fh)?.head_addr;
        if !self.handles.get(fh)?.can_read {
            return Err(Error::PermissionDenied);
        }
        let size = node::read_size(&self.container, head_addr)? as u64;
        if offset > size {
            return Err(Error::Overflow);
        }
        let start = offset;
        let end = (offset + len as u64).min(size);
        let mut out = vec![0u8; (end - start) as usize];

        let handle = self.handles.get_mut(fh)?;
        let mut pos = start;
        let mut done = 0usize;
        while pos < end {
            handle.set_position(&self.container, pos)?;
            let (span, local) = handle.cursor();
            let avail = (span.capacity - local) as u64;
            let want = avail.min(end - pos) as usize;
            self.container
                .read_at((span.payload_start + local) as u64, &mut out[done..done + want])?;
            pos += want as u64;
            done += want;
        }
        handle.set_position(&self.container, pos)?;
        Ok(out)
    }

    pub fn write(&mut self, fh: usize, offset: u64, data: &[u8]) -> Result<u32> {
        self.reject_if_read_only()?;
        let (head_addr, mode, can_write) = {
            let handle = self.handles.get(fh)?;
            (handle.head_addr, handle.mode, handle.can_write)
        };
        if !can_write {
            return Err(Error::PermissionDenied);
        }
        let cur_size = node::read_size(&self.container, head_addr)? as u64;
        let end = offset + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(Error::Overflow);
        }
        if end > cur_size {
            self.truncate_node(head_addr, mode, end as u32)?;
        }

        let handle = self.handles.get_mut(fh)?;
        let mut pos = offset;
        let mut done = 0usize;
        while done < data.len() {
            handle.set_position(&self.container, pos)?;
            let (span, local) = handle.cursor();
            let avail = (span.capacity - local) as usize;
            let want = avail.min(data.len() - done);
            self.container
                .write_at((span.payload_start + local) as u64, &data[done..done + want])?;
            pos += want as u64;
            done += want;
        }
        handle.set_position(&self.container, pos)?;
        node::write_mtime(&self.container, head_addr, now_secs())?;
        Ok(data.len() as u32)
    }

    // -- allocator plumbing -----------------------------------------------

    fn alloc_block(&mut self, size: u32) -> Result<u32> {
        match alloc::allocate(&self.container, &mut self.free_head, size) {
            Ok(addr) => Ok(addr),
            Err(AllocError::NoSpace { .. }) => Err(Error::NoSpace),
            Err(AllocError::Io(e)) => Err(e),
        }
    }

    fn reject_if_read_only(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{create_container, open_container};
    use crate::node;

    /// Formats and mounts a fresh container of the given total capacity.
    fn mounted(capacity: u64) -> (tempfile::TempDir, Core) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.box");
        create_container(&path, capacity).unwrap();
        let file = open_container(&path, false).unwrap();
        let core = Core::mount(file, false).unwrap();
        (dir, core)
    }

    #[test]
    fn create_and_stat_regular_file() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/hello", 0o644).unwrap();
        let attr = core.getattr("/hello").unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.mode, TYPE_REGULAR | 0o644);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/hello", 0o644).unwrap();
        let fh = core.open("/hello", true, true).unwrap();
        let written = core.write(fh, 0, b"Hello, world!").unwrap();
        assert_eq!(written, 13);
        assert_eq!(core.getattr("/hello").unwrap().size, 13);
        let data = core.read(fh, 0, 13).unwrap();
        assert_eq!(data, b"Hello, world!");
        core.release(fh).unwrap();
    }

    #[test]
    fn cross_block_read_sees_zero_fill_around_a_write() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/big", 0o644).unwrap();
        core.truncate("/big", 5000).unwrap();
        let fh = core.open("/big", true, true).unwrap();
        let zeros = core.read(fh, 0, 5000).unwrap();
        assert!(zeros.iter().all(|&b| b == 0));

        let pattern = vec![0xAAu8; 2000];
        core.write(fh, 4000, &pattern).unwrap();
        let window = core.read(fh, 3900, 2200).unwrap();
        assert_eq!(&window[..100], &[0u8; 100][..]);
        assert_eq!(&window[100..2100], &pattern[..]);
        assert_eq!(&window[2100..], &[0u8; 100][..]);
        core.release(fh).unwrap();
    }

    #[test]
    fn grow_within_reused_block_zero_fills_stale_bytes() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/a", 0o644).unwrap();
        let fh = core.open("/a", true, true).unwrap();
        // Fill the whole head block so no continuation is allocated, then
        // drop the file so its block goes back to the free list.
        let pattern = vec![0xFFu8; (REG_BLOCK_SIZE - REG_HEAD_PAYLOAD_OFFSET) as usize];
        core.write(fh, 0, &pattern).unwrap();
        core.release(fh).unwrap();
        core.unlink("/a").unwrap();

        // First-fit hands the freshly-freed block straight back out.
        core.create("/b", 0o644).unwrap();

        // Grows within the block's existing capacity -- no new block is
        // ever linked, so only the spare-capacity zero-fill can clear the
        // stale 0xFF bytes left behind by `/a`.
        core.truncate("/b", 100).unwrap();
        let fh = core.open("/b", true, true).unwrap();
        let data = core.read(fh, 0, 100).unwrap();
        assert_eq!(data, vec![0u8; 100]);
        core.release(fh).unwrap();
    }

    #[test]
    fn directory_create_and_list_increments_parent_nlink() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        assert_eq!(core.getattr("/").unwrap().nlink, 2);
        core.mkdir("/d", 0o755).unwrap();
        let listing = core.readdir("/d").unwrap();
        let names: Vec<&[u8]> = listing.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![b".".as_slice(), b"..".as_slice()]);
        assert_eq!(core.getattr("/").unwrap().nlink, 3);
    }

    #[test]
    fn removal_refusal_then_success_restores_parent_nlink() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.mkdir("/d", 0o755).unwrap();
        core.create("/d/x", 0o644).unwrap();
        assert!(matches!(core.rmdir("/d"), Err(Error::NotEmpty)));
        core.unlink("/d/x").unwrap();
        core.rmdir("/d").unwrap();
        assert_eq!(core.getattr("/").unwrap().nlink, 2);
        assert!(matches!(core.getattr("/d"), Err(Error::NoSuchEntry)));
    }

    #[test]
    fn truncate_is_idempotent() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/f", 0o644).unwrap();
        core.truncate("/f", 200).unwrap();
        let addr = core.resolve("/f").unwrap();
        let size_once = node::read_size(&core.container, addr).unwrap();
        core.truncate("/f", 200).unwrap();
        let size_twice = node::read_size(&core.container, addr).unwrap();
        assert_eq!(size_once, size_twice);
    }

    #[test]
    fn busy_regular_file_cannot_be_unlinked_while_open() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/f", 0o644).unwrap();
        let fh = core.open("/f", true, false).unwrap();
        assert!(matches!(core.unlink("/f"), Err(Error::Busy)));
        core.release(fh).unwrap();
        core.unlink("/f").unwrap();
    }

    #[test]
    fn read_past_file_length_reports_overflow() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/f", 0o644).unwrap();
        let fh = core.open("/f", true, true).unwrap();
        core.write(fh, 0, b"abc").unwrap();
        assert!(matches!(core.read(fh, 10, 1), Err(Error::Overflow)));
        assert_eq!(core.read(fh, 3, 5).unwrap(), Vec::<u8>::new());
        core.release(fh).unwrap();
    }

    #[test]
    fn closed_handle_is_rejected() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/f", 0o644).unwrap();
        let fh = core.open("/f", true, true).unwrap();
        core.release(fh).unwrap();
        assert!(matches!(core.read(fh, 0, 1), Err(Error::BadHandle)));
        assert!(matches!(core.write(fh, 0, b"x"), Err(Error::BadHandle)));
    }

    #[test]
    fn hard_link_shares_data_and_bumps_nlink() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/a", 0o644).unwrap();
        let fh = core.open("/a", true, true).unwrap();
        core.write(fh, 0, b"shared").unwrap();
        core.release(fh).unwrap();

        core.link("/a", "/b").unwrap();
        assert_eq!(core.getattr("/a").unwrap().nlink, 2);
        let fh = core.open("/b", true, false).unwrap();
        assert_eq!(core.read(fh, 0, 6).unwrap(), b"shared");
        core.release(fh).unwrap();

        core.unlink("/a").unwrap();
        assert!(matches!(core.getattr("/a"), Err(Error::NoSuchEntry)));
        assert_eq!(core.getattr("/b").unwrap().nlink, 1);
    }

    #[test]
    fn mkdir_reports_max_links_when_parent_is_saturated() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        let root = core.root_addr();
        node::write_nlink(&core.container, root, u16::MAX).unwrap();
        assert!(matches!(core.mkdir("/x", 0o755), Err(Error::MaxLinks)));
    }

    #[test]
    fn create_fails_with_no_space_when_container_is_full() {
        let (_dir, mut core) = mounted(SUPERBLOCK_SIZE + DIR_BLOCK_SIZE as u64);
        assert!(matches!(core.create("/f", 0o644), Err(Error::NoSpace)));
    }

    #[test]
    fn chmod_replaces_only_the_permission_bits() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/f", 0o644).unwrap();
        core.chmod("/f", 0o600).unwrap();
        let attr = core.getattr("/f").unwrap();
        assert_eq!(attr.mode, TYPE_REGULAR | 0o600);
    }

    #[test]
    fn access_succeeds_only_for_resolvable_paths() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/f", 0o644).unwrap();
        assert!(core.access("/f", libc::F_OK).is_ok());
        assert!(matches!(
            core.access("/missing", libc::F_OK),
            Err(Error::NoSuchEntry)
        ));
    }

    #[test]
    fn access_checks_the_requested_permission_bits() {
        let (_dir, mut core) = mounted(DEFAULT_CAPACITY);
        core.create("/f", 0o400).unwrap();
        assert!(core.access("/f", libc::R_OK).is_ok());
        assert!(matches!(
            core.access("/f", libc::W_OK),
            Err(Error::PermissionDenied)
        ));
    }
}
