//! Directory payload engine (spec §4.4).
//!
//! A directory's payload is a sequence of `(child_addr: u32, name_len: u8,
//! name: [u8; name_len])` entries, terminated by a lone `child_addr == 0`
//! (no trailing `name_len`/`name` follow the terminator). The payload may
//! span several blocks of the node's chain; entries are never split across
//! a block boundary check here because reads/writes are done through a
//! logical, block-crossing byte cursor over the whole chain.

use crate::alloc;
use crate::consts::NAME_MAX;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::node::BlockSpan;

/// One directory entry as found in the payload.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub child_addr: u32,
    pub name: Vec<u8>,
    /// Logical offset, from the start of the payload, of this entry.
    pub offset: u64,
    /// Total encoded size of this entry (`4 + 1 + name.len()`).
    pub len: u32,
}

/// Failure of an insert that needs the caller to grow the directory's
/// chain before retrying.
pub enum DirError {
    Io(Error),
    NoRoom,
}

impl From<Error> for DirError {
    fn from(e: Error) -> Self {
        Self::Io(e)
    }
}

impl From<DirError> for Error {
    fn from(e: DirError) -> Self {
        match e {
            DirError::Io(e) => e,
            DirError::NoRoom => Error::NoSpace,
        }
    }
}

fn total_capacity(spans: &[BlockSpan]) -> u64 {
    spans.iter().map(|s| s.capacity as u64).sum()
}

/// Reads `buf.len()` logical payload bytes starting at `offset`, gathering
/// across block boundaries as needed.
fn read_logical(container: &Container, spans: &[BlockSpan], offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut base = 0u64;
    let mut done = 0usize;
    for span in spans {
        let cap = span.capacity as u64;
        let span_start = base;
        let span_end = base + cap;
        let want_start = offset + done as u64;
        let want_end = offset + buf.len() as u64;
        if want_end <= span_start {
            break;
        }
        if want_start < span_end {
            let local_start = want_start.max(span_start) - span_start;
            let local_end = want_end.min(span_end) - span_start;
            let n = (local_end - local_start) as usize;
            container.read_at(
                span.payload_start as u64 + local_start,
                &mut buf[done..done + n],
            )?;
            done += n;
        }
        base = span_end;
        if done >= buf.len() {
            break;
        }
    }
    if done < buf.len() {
        return Err(Error::Invalid);
    }
    Ok(())
}

/// Writes `buf` to logical payload bytes starting at `offset`, scattering
/// across block boundaries as needed.
fn write_logical(container: &Container, spans: &[BlockSpan], offset: u64, buf: &[u8]) -> Result<()> {
    let mut base = 0u64;
    let mut done = 0usize;
    for span in spans {
        let cap = span.capacity as u64;
        let span_start = base;
        let span_end = base + cap;
        let want_start = offset + done as u64;
        let want_end = offset + buf.len() as u64;
        if want_end <= span_start {
            break;
        }
        if want_start < span_end {
            let local_start = want_start.max(span_start) - span_start;
            let local_end = want_end.min(span_end) - span_start;
            let n = (local_end - local_start) as usize;
            container.write_at(
                span.payload_start as u64 + local_start,
                &buf[done..done + n],
            )?;
            done += n;
        }
        base = span_end;
        if done >= buf.len() {
            break;
        }
    }
    if done < buf.len() {
        return Err(Error::Invalid);
    }
    Ok(())
}

/// Reads one entry (or the terminator) at logical `offset`. Returns `None`
/// at the terminator.
fn read_entry_at(container: &Container, spans: &[BlockSpan], offset: u64) -> Result<Option<DirEntry>> {
    let mut head = [0u8; 4];
    read_logical(container, spans, offset, &mut head)?;
    let child_addr = u32::from_be_bytes(head);
    if child_addr == 0 {
        return Ok(None);
    }
    let mut name_len_buf = [0u8; 1];
    read_logical(container, spans, offset + 4, &mut name_len_buf)?;
    let name_len = name_len_buf[0] as usize;
    let mut name = vec![0u8; name_len];
    if name_len > 0 {
        read_logical(container, spans, offset + 5, &mut name)?;
    }
    Ok(Some(DirEntry {
        child_addr,
        name,
        offset,
        len: 4 + 1 + name_len as u32,
    }))
}

/// Lists every live entry in the directory, in on-disk order.
pub fn list_entries(container: &Container, spans: &[BlockSpan]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0u64;
    while let Some(entry) = read_entry_at(container, spans, offset)? {
        offset += entry.len as u64;
        entries.push(entry);
    }
    Ok(entries)
}

/// Looks up `name` in the directory, returning its child address if found.
pub fn lookup(container: &Container, spans: &[BlockSpan], name: &[u8]) -> Result<Option<u32>> {
    let mut offset = 0u64;
    while let Some(entry) = read_entry_at(container, spans, offset)? {
        if entry.name == name {
            return Ok(Some(entry.child_addr));
        }
        offset += entry.len as u64;
    }
    Ok(None)
}

/// Returns `true` if the directory holds no entries beyond `.` and `..`
/// (spec §4.4: "enforce emptiness (only `.` and `..` present)").
pub fn is_empty(container: &Container, spans: &[BlockSpan]) -> Result<bool> {
    Ok(list_entries(container, spans)?.len() <= 2)
}

/// Finds the logical offset of the terminator (the first `child_addr == 0`
/// word encountered).
fn find_terminator(container: &Container, spans: &[BlockSpan]) -> Result<u64> {
    let mut offset = 0u64;
    while let Some(entry) = read_entry_at(container, spans, offset)? {
        offset += entry.len as u64;
    }
    Ok(offset)
}

/// Appends a new `(child_addr, name)` entry just before the terminator,
/// writing a fresh terminator after it.
///
/// Fails with `DirError::NoRoom` if the chain's current capacity cannot
/// hold the new entry plus its terminator; the caller is expected to grow
/// the directory's block chain and retry.
pub fn insert_entry(
    container: &Container,
    spans: &[BlockSpan],
    name: &[u8],
    child_addr: u32,
) -> std::result::Result<(), DirError> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(Error::Invalid.into());
    }
    let terminator_offset = find_terminator(container, spans)?;
    let entry_len = 4 + 1 + name.len() as u64;
    let needed_end = terminator_offset + entry_len + 4;
    if needed_end > total_capacity(spans) {
        return Err(DirError::NoRoom);
    }

    let mut buf = Vec::with_capacity(entry_len as usize);
    buf.extend_from_slice(&child_addr.to_be_bytes());
    buf.push(name.len() as u8);
    buf.extend_from_slice(name);
    write_logical(container, spans, terminator_offset, &buf)?;
    write_logical(container, spans, terminator_offset + entry_len, &0u32.to_be_bytes())?;
    Ok(())
}

/// Removes the entry named `name`, compacting every entry after it (and
/// the terminator) leftward by the removed entry's encoded size, then
/// frees any continuation block that compaction left entirely unused
/// (spec §4.4 Delete step 3: "If, after compaction, the block becomes
/// empty and is not the directory's head, unlink it from the continuation
/// chain and free it").
pub fn remove_entry(
    container: &Container,
    free_head: &mut u32,
    spans: &[BlockSpan],
    name: &[u8],
) -> Result<()> {
    let mut offset = 0u64;
    let removed = loop {
        match read_entry_at(container, spans, offset)? {
            None => return Err(Error::NoSuchEntry),
            Some(entry) => {
                if entry.name == name {
                    break entry;
                }
                offset += entry.len as u64;
            }
        }
    };
    let tail_start = removed.offset + removed.len as u64;
    let terminator_offset = find_terminator_from(container, spans, tail_start)?;
    let tail_len = (terminator_offset + 4) - tail_start;

    let mut tail = vec![0u8; tail_len as usize];
    read_logical(container, spans, tail_start, &mut tail)?;
    write_logical(container, spans, removed.offset, &tail)?;

    let live_end = removed.offset + tail_len;
    free_trailing_continuation_blocks(container, free_head, spans, live_end)
}

/// Frees every continuation block (never the head, per spec §4.4) that
/// lies entirely beyond `live_end`, the logical offset just past the
/// terminator of the entries still live after compaction. The block that
/// straddles `live_end` keeps whatever spare capacity it has; only blocks
/// that are wholly unreachable past it get unlinked and freed.
fn free_trailing_continuation_blocks(
    container: &Container,
    free_head: &mut u32,
    spans: &[BlockSpan],
    live_end: u64,
) -> Result<()> {
    let mut base = 0u64;
    for span in spans {
        let cap = span.capacity as u64;
        if live_end <= base + cap {
            if span.link != 0 {
                container.write_u32_at(span.addr as u64 + 4, 0)?;
                alloc::free_chain(container, free_head, span.link)?;
            }
            return Ok(());
        }
        base += cap;
    }
    Ok(())
}

/// Like [`find_terminator`] but starting the scan from a known entry
/// boundary, used while compacting after a removal.
fn find_terminator_from(container: &Container, spans: &[BlockSpan], mut offset: u64) -> Result<u64> {
    while let Some(entry) = read_entry_at(container, spans, offset)? {
        offset += entry.len as u64;
    }
    Ok(offset)
}

#[cfg(test)]
pub fn entry_count(container: &Container, spans: &[BlockSpan]) -> Result<usize> {
    Ok(list_entries(container, spans)?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::*;
    use crate::node;

    fn scratch_container(size: u64) -> Container {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        Container::new(file)
    }

    fn make_dir_spans(container: &Container, addr: u32, block_size: u32) -> Vec<BlockSpan> {
        container.write_u32_at(addr as u64, block_size).unwrap();
        container.write_u32_at(addr as u64 + 4, 0).unwrap();
        node::init_head(container, addr, 0, 2, TYPE_DIRECTORY, 0).unwrap();
        container
            .write_u32_at((addr + node::head_payload_start(addr, TYPE_DIRECTORY)) as u64, 0)
            .unwrap();
        node::iterate_blocks(container, addr, TYPE_DIRECTORY).unwrap()
    }

    #[test]
    fn insert_lookup_remove_roundtrip() {
        let container = scratch_container(1 << 20);
        let spans = make_dir_spans(&container, 0, DIR_BLOCK_SIZE);

        insert_entry(&container, &spans, b"alpha", 1000).unwrap();
        insert_entry(&container, &spans, b"beta", 2000).unwrap();
        insert_entry(&container, &spans, b"gamma", 3000).unwrap();

        assert_eq!(lookup(&container, &spans, b"beta").unwrap(), Some(2000));
        assert_eq!(entry_count(&container, &spans).unwrap(), 3);

        let mut free_head = 0u32;
        remove_entry(&container, &mut free_head, &spans, b"beta").unwrap();
        assert_eq!(lookup(&container, &spans, b"beta").unwrap(), None);
        assert_eq!(lookup(&container, &spans, b"alpha").unwrap(), Some(1000));
        assert_eq!(lookup(&container, &spans, b"gamma").unwrap(), Some(3000));
        assert_eq!(entry_count(&container, &spans).unwrap(), 2);
    }

    #[test]
    fn empty_directory_reports_empty() {
        let container = scratch_container(1 << 20);
        let spans = make_dir_spans(&container, 0, DIR_BLOCK_SIZE);
        assert!(is_empty(&container, &spans).unwrap());
        insert_entry(&container, &spans, b".", 0).unwrap();
        insert_entry(&container, &spans, b"..", 0).unwrap();
        assert!(is_empty(&container, &spans).unwrap());
        insert_entry(&container, &spans, b"x", 42).unwrap();
        assert!(!is_empty(&container, &spans).unwrap());
    }

    /// Inserts entries into a directory head block until at least two
    /// continuation blocks exist, growing the chain the same way
    /// `ops::Core::insert_with_growth` does, then removes every entry in
    /// random order -- checking, after each removal, that the free list
    /// stays well-formed and that the directory's own block chain is still
    /// walkable. By the end every continuation block must have been
    /// reclaimed back to the free list (spec §4.4 Delete step 3 / §9(e)).
    #[test]
    fn random_insert_remove_across_continuation_blocks_reclaims_free_space() {
        use rand::rngs::StdRng;
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let capacity = 1u64 << 20;
        let container = scratch_container(capacity);
        let head_addr = SUPERBLOCK_SIZE as u32;
        container.write_u32_at(head_addr as u64, DIR_BLOCK_SIZE).unwrap();
        container.write_u32_at(head_addr as u64 + 4, 0).unwrap();
        node::init_head(&container, head_addr, 0, 2, TYPE_DIRECTORY, 0).unwrap();
        let payload_start = node::head_payload_start(head_addr, TYPE_DIRECTORY);
        container.write_u32_at(payload_start as u64, 0).unwrap();

        let free_region = head_addr + DIR_BLOCK_SIZE;
        let free_size = capacity as u32 - free_region;
        container.write_u32_at(free_region as u64, free_size).unwrap();
        container.write_u32_at(free_region as u64 + 4, 0).unwrap();
        let mut free_head = free_region;

        let insert_with_growth = |container: &Container, free_head: &mut u32, name: &[u8]| {
            loop {
                let spans = node::iterate_blocks(container, head_addr, TYPE_DIRECTORY).unwrap();
                match insert_entry(container, &spans, name, 0xABCD) {
                    Ok(()) => return,
                    Err(DirError::NoRoom) => {
                        let last = *spans.last().unwrap();
                        let new_block = alloc::allocate(container, free_head, DIR_BLOCK_SIZE)
                            .unwrap_or_else(|_| panic!("ran out of room growing test directory"));
                        container.write_u32_at(last.addr as u64 + 4, new_block).unwrap();
                    }
                    Err(DirError::Io(e)) => panic!("io error: {e:?}"),
                }
            }
        };

        let names: Vec<String> = (0..200).map(|i| format!("entry-{i:04}")).collect();
        for name in &names {
            insert_with_growth(&container, &mut free_head, name.as_bytes());
        }

        let spans = node::iterate_blocks(&container, head_addr, TYPE_DIRECTORY).unwrap();
        assert!(
            spans.len() > 2,
            "test setup should force at least two continuation blocks, got {}",
            spans.len()
        );

        let mut order = names.clone();
        order.shuffle(&mut StdRng::seed_from_u64(0xD1A5_EED));
        for name in &order {
            let spans = node::iterate_blocks(&container, head_addr, TYPE_DIRECTORY).unwrap();
            remove_entry(&container, &mut free_head, &spans, name.as_bytes()).unwrap();
            assert_free_list_sorted_and_non_adjacent(&container, free_head);
            // The directory's own chain must still be walkable after every
            // removal, proving no dangling `link` was left behind.
            node::iterate_blocks(&container, head_addr, TYPE_DIRECTORY).unwrap();
        }

        let spans = node::iterate_blocks(&container, head_addr, TYPE_DIRECTORY).unwrap();
        assert_eq!(
            spans.len(),
            1,
            "every continuation block should be reclaimed once all entries are gone"
        );
        assert_eq!(entry_count(&container, &spans).unwrap(), 0);
    }

    fn assert_free_list_sorted_and_non_adjacent(container: &Container, free_head: u32) {
        let mut cur = free_head;
        let mut prev_end: Option<u32> = None;
        while cur != 0 {
            if let Some(end) = prev_end {
                assert!(cur >= end, "free list out of order or overlapping at {cur}");
            }
            let size = container.read_u32_at(cur as u64).unwrap();
            prev_end = Some(cur + size);
            cur = container.read_u32_at(cur as u64 + 4).unwrap();
        }
    }
}
