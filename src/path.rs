//! Path resolution with a small invalidate-on-mutation cache (spec §4.5).
//!
//! Resolution walks the tree component by component from the root. A
//! resolved path is cached as `path -> node address`; any mutation that
//! changes what a path names (create, remove, link, rename were it
//! supported) drops the affected cache entries rather than leaving them to
//! go stale.

use std::collections::HashMap;

use crate::consts::{is_dir_mode, TYPE_DIRECTORY};
use crate::container::Container;
use crate::dir;
use crate::error::{Error, Result};
use crate::node;

/// Splits an absolute path into its `/`-separated components, rejecting
/// empty components (`//`) and components over `NAME_MAX` bytes, which
/// [`dir::insert_entry`] would reject anyway.
pub fn split_components(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(Error::Invalid);
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        if part.is_empty() {
            continue;
        }
        parts.push(part);
    }
    Ok(parts)
}

/// Caches resolved absolute paths to their node address.
#[derive(Default)]
pub struct PathCache {
    entries: HashMap<String, u32>,
}

impl PathCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<u32> {
        self.entries.get(path).copied()
    }

    pub fn insert(&mut self, path: String, addr: u32) {
        self.entries.insert(path, addr);
    }

    /// Drops the cache entry for `path` and every entry naming a
    /// descendant of it, since a mutation at `path` (or within it) may
    /// change what those names resolve to.
    pub fn invalidate_subtree(&mut self, path: &str) {
        let prefix = if path == "/" {
            String::new()
        } else {
            format!("{path}/")
        };
        self.entries
            .retain(|k, _| k != path && !k.starts_with(&prefix));
    }

    /// Drops every cached entry. Used on unmount and after operations whose
    /// blast radius is hard to characterize precisely.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Resolves `path` to a node address, consulting and populating `cache`.
///
/// Resolution always walks from the root; the cache only short-circuits
/// the final lookup of a full, previously-seen path. A cache hit is
/// trusted without re-validating the parent chain, which is sound only
/// because every mutating operation invalidates the subtree it touches.
pub fn resolve(
    container: &Container,
    cache: &mut PathCache,
    root_addr: u32,
    path: &str,
) -> Result<u32> {
    if path == "/" {
        return Ok(root_addr);
    }
    if let Some(addr) = cache.get(path) {
        return Ok(addr);
    }
    let components = split_components(path)?;
    let mut current = root_addr;
    let mut built = String::new();
    for comp in &components {
        built.push('/');
        built.push_str(comp);
        if let Some(addr) = cache.get(&built) {
            current = addr;
            continue;
        }
        let header = node::read_header(container, current)?;
        if !is_dir_mode(header.mode) {
            return Err(Error::NotDir);
        }
        if header.mode & 0o100 == 0 {
            return Err(Error::PermissionDenied);
        }
        let spans = node::iterate_blocks(container, current, TYPE_DIRECTORY)?;
        let child = dir::lookup(container, &spans, comp.as_bytes())?.ok_or(Error::NoSuchEntry)?;
        cache.insert(built.clone(), child);
        current = child;
    }
    Ok(current)
}

/// Splits `path` into its parent path and final component name, e.g.
/// `/a/b/c` -> (`/a/b`, `c`).
pub fn split_parent(path: &str) -> Result<(String, &str)> {
    let components = split_components(path)?;
    let name = components.last().copied().ok_or(Error::Invalid)?;
    let parent = if components.len() == 1 {
        "/".to_string()
    } else {
        format!("/{}", components[..components.len() - 1].join("/"))
    };
    Ok((parent, name))
}
