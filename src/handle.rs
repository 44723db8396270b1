//! Open-handle table (spec §4.6).
//!
//! Handles are allocated at the lowest free slot index, up to
//! `MAX_OPEN_FILES` outstanding at once. Each handle keeps a small
//! streaming cursor: the block span and payload offset last visited, so a
//! forward-biased `set_position` (the common case -- sequential read or
//! write) can walk forward from there instead of re-resolving the whole
//! chain from the head block on every call.

use crate::consts::{CONT_PAYLOAD_OFFSET, MAX_OPEN_FILES};
use crate::container::Container;
use crate::error::{Error, Result};
use crate::node::{self, BlockSpan};

/// One open file or directory handle.
pub struct OpenFile {
    pub head_addr: u32,
    pub mode: u16,
    pub can_read: bool,
    pub can_write: bool,
    position: u64,
    cached_span: Option<BlockSpan>,
    cached_base: u64,
}

impl OpenFile {
    pub fn new(head_addr: u32, mode: u16, can_read: bool, can_write: bool) -> Self {
        Self {
            head_addr,
            mode,
            can_read,
            can_write,
            position: 0,
            cached_span: None,
            cached_base: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Drops the cached span, forcing the next [`set_position`] to
    /// re-resolve from the head block. Callers must invalidate after any
    /// structural change to the node's chain (growth, truncation).
    pub fn invalidate_cursor(&mut self) {
        self.cached_span = None;
    }

    /// Repositions the handle's cursor to `new_pos`, an absolute logical
    /// offset into the node's regular-file payload.
    pub fn set_position(&mut self, container: &Container, new_pos: u64) -> Result<()> {
        if let Some(span) = self.cached_span {
            if new_pos >= self.cached_base {
                let (span, local) = walk_forward(container, span, self.cached_base, new_pos)?;
                self.cached_base = new_pos - local as u64;
                self.cached_span = Some(span);
                self.position = new_pos;
                return Ok(());
            }
        }
        let (span, local) = node::locate_offset(container, self.head_addr, self.mode, new_pos)?;
        self.cached_base = new_pos - local as u64;
        self.cached_span = Some(span);
        self.position = new_pos;
        Ok(())
    }

    /// Returns the block span and in-block offset at the current cursor
    /// position. Panics if called before any [`set_position`] -- callers
    /// always reposition before reading or writing.
    pub fn cursor(&self) -> (BlockSpan, u32) {
        let span = self.cached_span.expect("cursor used before set_position");
        (span, (self.position - self.cached_base) as u32)
    }
}

/// Continues a chain walk from a previously visited `span` (whose logical
/// start is `base`) forward to `target`, without revisiting blocks before
/// `span`.
fn walk_forward(
    container: &Container,
    mut span: BlockSpan,
    mut base: u64,
    target: u64,
) -> Result<(BlockSpan, u32)> {
    loop {
        let cap = span.capacity as u64;
        if target < base + cap || span.link == 0 {
            return Ok((span, (target - base) as u32));
        }
        base += cap;
        let next_addr = span.link;
        let size = container.read_u32_at(next_addr as u64)?;
        let link = container.read_u32_at(next_addr as u64 + 4)?;
        span = BlockSpan {
            addr: next_addr,
            payload_start: next_addr + CONT_PAYLOAD_OFFSET,
            capacity: size - CONT_PAYLOAD_OFFSET,
            link,
        };
    }
}

/// The table of all currently open handles, indexed by handle number.
#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Option<OpenFile>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Allocates the lowest free slot for `file`, growing the table if
    /// every existing slot is occupied. Fails once `MAX_OPEN_FILES`
    /// handles are outstanding.
    pub fn insert(&mut self, file: OpenFile) -> Result<usize> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[idx] = Some(file);
            return Ok(idx);
        }
        if self.slots.len() >= MAX_OPEN_FILES {
            return Err(Error::NoSpace);
        }
        self.slots.push(Some(file));
        Ok(self.slots.len() - 1)
    }

    pub fn get(&self, fh: usize) -> Result<&OpenFile> {
        self.slots.get(fh).and_then(|s| s.as_ref()).ok_or(Error::BadHandle)
    }

    pub fn get_mut(&mut self, fh: usize) -> Result<&mut OpenFile> {
        self.slots
            .get_mut(fh)
            .and_then(|s| s.as_mut())
            .ok_or(Error::BadHandle)
    }

    /// Closes `fh`, then trims any now-empty slots off the end of the
    /// table so it doesn't grow unbounded across the lifetime of a mount.
    pub fn remove(&mut self, fh: usize) -> Result<()> {
        let slot = self.slots.get_mut(fh).ok_or(Error::BadHandle)?;
        if slot.is_none() {
            return Err(Error::BadHandle);
        }
        *slot = None;
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        Ok(())
    }

    /// Drops the cached cursor of every open handle on `head_addr`. Must be
    /// called after any structural change to that node's block chain
    /// (growth or truncation), since a handle's cached span may otherwise
    /// reference a `link` field that is now stale.
    pub fn invalidate_for_node(&mut self, head_addr: u32) {
        for file in self.slots.iter_mut().flatten() {
            if file.head_addr == head_addr {
                file.invalidate_cursor();
            }
        }
    }

    /// Returns true if any open handle currently refers to `head_addr`.
    /// Used to enforce that a regular file cannot be unlinked-and-freed
    /// while still open (spec: removing an open file's last link is
    /// rejected rather than deferred).
    pub fn is_open(&self, head_addr: u32) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|f| f.head_addr == head_addr)
    }
}
