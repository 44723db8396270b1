//! First-fit block allocator with adjacent-coalescing free (spec §4.2).
//!
//! The free list is rooted at the superblock's `free_head` field and is
//! always kept strictly address-sorted with no two free blocks adjacent
//! (invariant 1).

use log::debug;

use crate::consts::{MIN_BLOCK_SIZE, SB_FREE_HEAD};
use crate::container::Container;
use crate::error::Error;

/// Failure of an allocation attempt, carrying the size of the largest free
/// block seen so a caller (the truncate grow path) can retry with it.
pub enum AllocError {
    Io(Error),
    NoSpace { largest_free: u32 },
}

impl From<Error> for AllocError {
    fn from(e: Error) -> Self {
        Self::Io(e)
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::Io(e) => e,
            AllocError::NoSpace { .. } => Error::NoSpace,
        }
    }
}

/// Allocates a block of at least `requested_size` bytes (header included).
///
/// Walks the free list from `free_head`, splitting the tail of the first
/// block found that is at least `requested_size + MIN_BLOCK_SIZE`, or
/// splicing out the whole block on an exact-ish fit.
pub fn allocate(
    container: &Container,
    free_head: &mut u32,
    requested_size: u32,
) -> Result<u32, AllocError> {
    let mut largest_free = 0u32;
    let mut pred_is_head = true;
    let mut pred_addr: u32 = 0;
    let mut cur = *free_head;
    while cur != 0 {
        let size = container.read_u32_at(cur as u64)?;
        let link = container.read_u32_at(cur as u64 + 4)?;
        largest_free = largest_free.max(size);
        if size >= requested_size {
            if size >= requested_size + MIN_BLOCK_SIZE {
                // Split: shrink the found block's head, carve the
                // allocation out of its tail. The free list linkage at
                // `cur` is untouched.
                let new_free_size = size - requested_size;
                container.write_u32_at(cur as u64, new_free_size)?;
                let alloc_addr = cur + new_free_size;
                container.write_u32_at(alloc_addr as u64, requested_size)?;
                container.write_u32_at(alloc_addr as u64 + 4, 0)?;
                debug!(
                    "allocate: split free block at {cur} (size {size}) -> alloc {alloc_addr} (size {requested_size})"
                );
                return Ok(alloc_addr);
            } else {
                // Exact-ish fit: splice the whole block out of the list.
                if pred_is_head {
                    *free_head = link;
                    container.write_u32_at(SB_FREE_HEAD, link)?;
                } else {
                    container.write_u32_at(pred_addr as u64 + 4, link)?;
                }
                container.write_u32_at(cur as u64 + 4, 0)?;
                debug!("allocate: exact-fit block at {cur} (size {size})");
                return Ok(cur);
            }
        }
        pred_is_head = false;
        pred_addr = cur;
        cur = link;
    }
    Err(AllocError::NoSpace { largest_free })
}

/// Frees the block at `address`, inserting it back into the sorted free
/// list and coalescing with either neighbor that turns out to be adjacent.
pub fn free(container: &Container, free_head: &mut u32, address: u32) -> Result<(), Error> {
    let size = container.read_u32_at(address as u64)?;

    // Find the predecessor (last free block below `address`) and the
    // successor (first free block at or above `address`).
    let mut pred_is_head = true;
    let mut pred_addr: u32 = 0;
    let mut cur = *free_head;
    while cur != 0 && cur < address {
        pred_is_head = false;
        pred_addr = cur;
        cur = container.read_u32_at(cur as u64 + 4)?;
    }
    let succ = cur;

    let merge_pred = if !pred_is_head {
        let pred_size = container.read_u32_at(pred_addr as u64)?;
        pred_addr + pred_size == address
    } else {
        false
    };

    let (base_addr, mut new_size) = if merge_pred {
        (pred_addr, container.read_u32_at(pred_addr as u64)? + size)
    } else {
        (address, size)
    };

    let mut next_link = succ;
    if succ != 0 && base_addr + new_size == succ {
        let succ_size = container.read_u32_at(succ as u64)?;
        let succ_link = container.read_u32_at(succ as u64 + 4)?;
        new_size += succ_size;
        next_link = succ_link;
    }

    container.write_u32_at(base_addr as u64, new_size)?;
    if merge_pred {
        if next_link != succ {
            container.write_u32_at(base_addr as u64 + 4, next_link)?;
        }
    } else {
        container.write_u32_at(base_addr as u64 + 4, next_link)?;
        if pred_is_head {
            *free_head = base_addr;
            container.write_u32_at(SB_FREE_HEAD, base_addr)?;
        } else {
            container.write_u32_at(pred_addr as u64 + 4, base_addr)?;
        }
    }
    debug!("free: block at {address} (size {size}) -> free region at {base_addr} (size {new_size})");
    Ok(())
}

/// Frees every block of a chain starting at `head_addr`, following `link`
/// fields forward.
pub fn free_chain(container: &Container, free_head: &mut u32, head_addr: u32) -> Result<(), Error> {
    let mut cur = head_addr;
    while cur != 0 {
        let next = container.read_u32_at(cur as u64 + 4)?;
        free(container, free_head, cur)?;
        cur = next;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::SUPERBLOCK_SIZE;

    fn scratch(size: u64) -> Container {
        let file = tempfile::tempfile().unwrap();
        file.set_len(size).unwrap();
        Container::new(file)
    }

    fn seed_free_block(container: &Container, addr: u32, size: u32, link: u32) {
        container.write_u32_at(addr as u64, size).unwrap();
        container.write_u32_at(addr as u64 + 4, link).unwrap();
    }

    #[test]
    fn split_leaves_shrunken_free_block_in_place() {
        let container = scratch(SUPERBLOCK_SIZE + 4096);
        let base = SUPERBLOCK_SIZE as u32;
        seed_free_block(&container, base, 4096, 0);
        container.write_u32_at(SB_FREE_HEAD, base).unwrap();
        let mut free_head = base;

        let addr = match allocate(&container, &mut free_head, 1024) {
            Ok(addr) => addr,
            Err(_) => panic!("expected split allocation to succeed"),
        };
        assert_eq!(addr, base + (4096 - 1024));
        assert_eq!(free_head, base);
        assert_eq!(container.read_u32_at(base as u64).unwrap(), 4096 - 1024);
    }

    #[test]
    fn exact_fit_splices_block_out_of_list() {
        let container = scratch(SUPERBLOCK_SIZE + 2048);
        let base = SUPERBLOCK_SIZE as u32;
        seed_free_block(&container, base, 1024, 0);
        container.write_u32_at(SB_FREE_HEAD, base).unwrap();
        let mut free_head = base;

        let addr = match allocate(&container, &mut free_head, 1024) {
            Ok(addr) => addr,
            Err(_) => panic!("expected exact-fit allocation to succeed"),
        };
        assert_eq!(addr, base);
        assert_eq!(free_head, 0);
        assert_eq!(container.read_u32_at(SB_FREE_HEAD).unwrap(), 0);
    }

    #[test]
    fn no_space_reports_largest_free_block() {
        let container = scratch(SUPERBLOCK_SIZE + 512);
        let base = SUPERBLOCK_SIZE as u32;
        seed_free_block(&container, base, 256, 0);
        container.write_u32_at(SB_FREE_HEAD, base).unwrap();
        let mut free_head = base;

        match allocate(&container, &mut free_head, 4096) {
            Err(AllocError::NoSpace { largest_free }) => assert_eq!(largest_free, 256),
            _ => panic!("expected NoSpace"),
        }
    }

    #[test]
    fn free_coalesces_with_both_neighbors() {
        // Three adjacent blocks of 256 bytes each; free the middle one,
        // having already freed the outer two, and the whole region
        // should collapse back into a single 768-byte free block.
        let container = scratch(SUPERBLOCK_SIZE + 1024);
        let base = SUPERBLOCK_SIZE as u32;
        let (a, b, c) = (base, base + 256, base + 512);

        // `a` and `c` start out free; `b` is the block being returned.
        seed_free_block(&container, a, 256, c);
        seed_free_block(&container, c, 256, 0);
        container.write_u32_at(SB_FREE_HEAD, a).unwrap();
        let mut free_head = a;

        seed_free_block(&container, b, 256, 0);
        free(&container, &mut free_head, b).unwrap();

        assert_eq!(free_head, a);
        assert_eq!(container.read_u32_at(a as u64).unwrap(), 768);
        assert_eq!(container.read_u32_at(a as u64 + 4).unwrap(), 0);
    }

    #[test]
    fn free_chain_returns_every_block_to_the_list() {
        let container = scratch(SUPERBLOCK_SIZE + 4096);
        let base = SUPERBLOCK_SIZE as u32;
        // A two-block node chain, with no free list yet.
        let head = base;
        let cont = base + 1024;
        seed_free_block(&container, head, 1024, cont);
        seed_free_block(&container, cont, 1024, 0);
        container.write_u32_at(SB_FREE_HEAD, 0).unwrap();
        let mut free_head = 0u32;

        free_chain(&container, &mut free_head, head).unwrap();
        assert_eq!(free_head, head);
        // Adjacent blocks freed back to back coalesce into one span.
        assert_eq!(container.read_u32_at(head as u64).unwrap(), 2048);
    }

    /// Drives a long random sequence of allocate/free calls and checks, after
    /// every step, that invariant 1 (no two free blocks adjacent) still holds
    /// and that the free list stays address-sorted.
    #[test]
    fn random_allocate_free_sequence_preserves_invariants() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let base = SUPERBLOCK_SIZE as u32;
        let total = 64 * 1024u32;
        let container = scratch(base as u64 + total as u64);
        seed_free_block(&container, base, total, 0);
        container.write_u32_at(SB_FREE_HEAD, base).unwrap();
        let mut free_head = base;

        let mut rng = StdRng::seed_from_u64(0xB0FF_5EED);
        let mut live = Vec::new();
        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = MIN_BLOCK_SIZE + (rng.gen_range(0..8) * 256);
                if let Ok(addr) = allocate(&container, &mut free_head, size) {
                    live.push(addr);
                }
            } else {
                let idx = rng.gen_range(0..live.len());
                let addr = live.swap_remove(idx);
                free(&container, &mut free_head, addr).unwrap();
            }
            assert_free_list_sorted_and_non_adjacent(&container, free_head);
        }
        for addr in live {
            free(&container, &mut free_head, addr).unwrap();
        }
        assert_free_list_sorted_and_non_adjacent(&container, free_head);
    }

    fn assert_free_list_sorted_and_non_adjacent(container: &Container, free_head: u32) {
        let mut cur = free_head;
        let mut prev_end: Option<u32> = None;
        while cur != 0 {
            if let Some(end) = prev_end {
                assert!(cur > end, "free list out of order or overlapping at {cur}");
                assert!(cur != end, "adjacent free blocks at {end} and {cur} were not coalesced");
            }
            let size = container.read_u32_at(cur as u64).unwrap();
            prev_end = Some(cur + size);
            cur = container.read_u32_at(cur as u64 + 4).unwrap();
        }
    }
}
