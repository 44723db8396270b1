//! Container lifecycle: formatting a fresh backing file and opening an
//! existing one for mounting (spec §4.8).

use std::fs::{File, OpenOptions};
use std::path::Path;

use log::info;

use crate::consts::*;
use crate::container::Container;
use crate::dir;
use crate::error::{Error, Result};
use crate::node;
use crate::time::now_secs;

/// Formats a brand new container file at `path` with the given total
/// `capacity` in bytes: a superblock, an empty root directory, and a
/// single free block covering everything left over.
pub fn create_container(path: &Path, capacity: u64) -> Result<()> {
    if capacity > u32::MAX as u64 {
        return Err(Error::Overflow);
    }
    let root_addr = SUPERBLOCK_SIZE as u32;
    let root_end = root_addr as u64 + DIR_BLOCK_SIZE as u64;
    if capacity < root_end {
        return Err(Error::Invalid);
    }
    let leftover = capacity - root_end;
    if leftover != 0 && leftover < BLOCK_HEADER_SIZE as u64 {
        return Err(Error::Invalid);
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(capacity)?;
    let container = Container::new(file);

    let free_head = if leftover == 0 { 0 } else { root_end as u32 };
    container.write_u32_at(SB_ROOT_ADDR, root_addr)?;
    container.write_u32_at(SB_FREE_HEAD, free_head)?;

    container.write_u32_at(root_addr as u64, DIR_BLOCK_SIZE)?;
    container.write_u32_at(root_addr as u64 + 4, 0)?;
    node::init_head(&container, root_addr, now_secs(), 2, TYPE_DIRECTORY | 0o777, 0)?;
    let payload_start = node::head_payload_start(root_addr, TYPE_DIRECTORY);
    container.write_u32_at(payload_start as u64, 0)?;
    // The root's `..` points at itself (spec §3).
    let root_spans = node::iterate_blocks(&container, root_addr, TYPE_DIRECTORY)?;
    dir::insert_entry(&container, &root_spans, b".", root_addr).map_err(Error::from)?;
    dir::insert_entry(&container, &root_spans, b"..", root_addr).map_err(Error::from)?;

    if free_head != 0 {
        container.write_u32_at(free_head as u64, leftover as u32)?;
        container.write_u32_at(free_head as u64 + 4, 0)?;
    }

    container.sync()?;
    info!("formatted {} ({capacity} bytes, root at {root_addr})", path.display());
    Ok(())
}

/// Opens an existing container file for mounting.
pub fn open_container(path: &Path, read_only: bool) -> Result<File> {
    let file = OpenOptions::new().read(true).write(!read_only).open(path)?;
    Ok(file)
}
