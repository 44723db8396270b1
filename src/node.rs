//! The file-node protocol shared by directories and regular files (spec §4.3).
//!
//! A node occupies a chain of one or more allocated blocks. The head block
//! carries a 12-byte node header immediately after the 8-byte block header;
//! continuation blocks carry only the block header.

use crate::consts::*;
use crate::container::Container;
use crate::error::{Error, Result};

/// The node header fields stored in a head block (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct NodeHeader {
    pub mtime: u32,
    pub nlink: u16,
    pub mode: u16,
}

/// One allocated block belonging to a node's chain.
#[derive(Debug, Clone, Copy)]
pub struct BlockSpan {
    /// Address of the block itself (its 8-byte header).
    pub addr: u32,
    /// Absolute address of the first payload byte in this block.
    pub payload_start: u32,
    /// Usable payload bytes in this block.
    pub capacity: u32,
    /// The block's `link` field (next block in the chain, or 0).
    pub link: u32,
}

/// Reads the node header at `head_addr`.
pub fn read_header(container: &Container, head_addr: u32) -> Result<NodeHeader> {
    let mtime = container.read_u32_at(head_addr as u64 + 8)?;
    let nlink = container.read_u16_at(head_addr as u64 + 12)?;
    let mode = container.read_u16_at(head_addr as u64 + 14)?;
    Ok(NodeHeader { mtime, nlink, mode })
}

/// Reads the payload size of a regular file node. Callers must have already
/// checked that the node is a regular file.
pub fn read_size(container: &Container, head_addr: u32) -> Result<u32> {
    container.read_u32_at(head_addr as u64 + 16)
}

/// Writes the payload size of a regular file node.
pub fn write_size(container: &Container, head_addr: u32, size: u32) -> Result<()> {
    container.write_u32_at(head_addr as u64 + 16, size)
}

/// Writes the node's modification time.
pub fn write_mtime(container: &Container, head_addr: u32, mtime: u32) -> Result<()> {
    container.write_u32_at(head_addr as u64 + 8, mtime)
}

/// Writes the node's hard-link count.
pub fn write_nlink(container: &Container, head_addr: u32, nlink: u16) -> Result<()> {
    container.write_u16_at(head_addr as u64 + 12, nlink)
}

/// Writes the node's mode (type bits and permission bits).
pub fn write_mode(container: &Container, head_addr: u32, mode: u16) -> Result<()> {
    container.write_u16_at(head_addr as u64 + 14, mode)
}

/// Initializes a freshly allocated head block with a node header.
///
/// For regular files the payload size field is initialized to `size`
/// (normally 0). For directories the size field does not exist; `size` is
/// ignored.
pub fn init_head(
    container: &Container,
    head_addr: u32,
    mtime: u32,
    nlink: u16,
    mode: u16,
    size: u32,
) -> Result<()> {
    write_mtime(container, head_addr, mtime)?;
    write_nlink(container, head_addr, nlink)?;
    write_mode(container, head_addr, mode)?;
    if is_reg_mode(mode) {
        write_size(container, head_addr, size)?;
    }
    Ok(())
}

/// Returns the absolute offset of the first payload byte of a node's head
/// block, given its mode.
pub fn head_payload_start(head_addr: u32, mode: u16) -> u32 {
    head_addr
        + if is_dir_mode(mode) {
            DIR_HEAD_PAYLOAD_OFFSET
        } else {
            REG_HEAD_PAYLOAD_OFFSET
        }
}

/// Yields the (block, payload_start, capacity, link) chain of a node, head
/// block first, in order.
pub fn iterate_blocks(container: &Container, head_addr: u32, mode: u16) -> Result<Vec<BlockSpan>> {
    let mut spans = Vec::new();
    let size = container.read_u32_at(head_addr as u64)?;
    let link = container.read_u32_at(head_addr as u64 + 4)?;
    let payload_start = head_payload_start(head_addr, mode);
    let header_len = payload_start - head_addr;
    spans.push(BlockSpan {
        addr: head_addr,
        payload_start,
        capacity: size - header_len,
        link,
    });
    let mut cur = link;
    while cur != 0 {
        let size = container.read_u32_at(cur as u64)?;
        let link = container.read_u32_at(cur as u64 + 4)?;
        spans.push(BlockSpan {
            addr: cur,
            payload_start: cur + CONT_PAYLOAD_OFFSET,
            capacity: size - CONT_PAYLOAD_OFFSET,
            link,
        });
        cur = link;
    }
    Ok(spans)
}

/// Locates the block and in-block byte position holding logical byte
/// `file_offset` of a regular file's payload.
///
/// `file_offset` may equal the total payload capacity of the chain (the
/// position just past the last written byte); it may not exceed it.
pub fn locate_offset(
    container: &Container,
    head_addr: u32,
    mode: u16,
    file_offset: u64,
) -> Result<(BlockSpan, u32)> {
    let spans = iterate_blocks(container, head_addr, mode)?;
    let mut base = 0u64;
    for span in &spans {
        let cap = span.capacity as u64;
        if file_offset < base + cap || span.link == 0 {
            return Ok((*span, (file_offset - base) as u32));
        }
        base += cap;
    }
    Err(Error::Invalid)
}

/// Zero-fills the logical byte range `[start, end)` of a node's payload,
/// scattering the fill across however many blocks of `spans` that range
/// touches. Used by the truncate-grow path to clear spare capacity already
/// sitting in the chain before (or instead of) appending new blocks.
pub fn zero_logical_range(
    container: &Container,
    spans: &[BlockSpan],
    start: u64,
    end: u64,
) -> Result<()> {
    let mut base = 0u64;
    for span in spans {
        let cap = span.capacity as u64;
        let span_start = base;
        let span_end = base + cap;
        if end <= span_start {
            break;
        }
        if start < span_end {
            let local_start = start.max(span_start) - span_start;
            let local_end = end.min(span_end) - span_start;
            if local_end > local_start {
                container.zero_fill(
                    span.payload_start as u64 + local_start,
                    (local_end - local_start) as u32,
                )?;
            }
        }
        base = span_end;
        if base >= end {
            break;
        }
    }
    Ok(())
}
