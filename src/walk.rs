//! Indirect-block walker.
//!
//! Translates a file byte offset into a data sector, allocating direct,
//! single-indirect, and double-indirect pointers lazily on write.
//! Outer- and inner-indirect steps are always distinct calls against
//! distinct locals (see Open Question 1: the source conflated them by
//! reusing one index variable across both levels).

use crate::bio::{Bcache, Buf};
use crate::freemap::FreeMap;
use crate::param::{BLOCKS_PER_SECTOR, DIRECT_BLOCKS, NO_SECTOR, SECTOR_SIZE};

/// Result of resolving one logical block index to a data sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The data sector exists (already allocated, or just allocated).
    Present(u32),
    /// The data sector does not exist and allocation was not requested.
    Hole,
    /// Allocation was requested but the free map is exhausted.
    AllocFailed,
}

impl Resolution {
    /// Collapses `Present`/`Hole` to a sector number, treating a hole as
    /// sector 0 (the reads-as-zero sentinel), and signals allocation
    /// failure with [`NO_SECTOR`] for callers that loop until they see
    /// it (spec §4.2).
    pub fn sector_or_sentinel(self) -> u32 {
        match self {
            Resolution::Present(s) => s,
            Resolution::Hole => 0,
            Resolution::AllocFailed => NO_SECTOR,
        }
    }
}

fn read_u32(buf: &Buf<'_>, slot: usize) -> u32 {
    let mut bytes = [0u8; 4];
    buf.read_range(slot * 4, &mut bytes);
    u32::from_le_bytes(bytes)
}

fn write_u32(buf: &mut Buf<'_>, slot: usize, value: u32) {
    buf.write_range(slot * 4, |dst| dst[..4].copy_from_slice(&value.to_le_bytes()));
}

/// Resolves logical block `idx` of a file whose inode pointer fields
/// are `direct`, `single_indirect`, and `double_indirect`. When
/// `allocate` is true, missing pointers (including intermediate
/// indirect sectors) are allocated and zero-filled on demand.
#[allow(clippy::too_many_arguments)]
pub fn walk(
    cache: &Bcache,
    free_map: &FreeMap,
    direct: &mut [u32; DIRECT_BLOCKS],
    single_indirect: &mut u32,
    double_indirect: &mut u32,
    idx: usize,
    allocate: bool,
) -> Resolution {
    if idx < DIRECT_BLOCKS {
        return resolve_direct(free_map, &mut direct[idx], allocate);
    }

    let idx = idx - DIRECT_BLOCKS;
    if idx < BLOCKS_PER_SECTOR {
        return walk_single_indirect(cache, free_map, single_indirect, idx, allocate);
    }

    let k = idx - BLOCKS_PER_SECTOR;
    let outer_idx = k / BLOCKS_PER_SECTOR;
    let inner_idx = k % BLOCKS_PER_SECTOR;
    walk_double_indirect(cache, free_map, double_indirect, outer_idx, inner_idx, allocate)
}

fn resolve_direct(free_map: &FreeMap, ptr: &mut u32, allocate: bool) -> Resolution {
    if *ptr != 0 {
        return Resolution::Present(*ptr);
    }
    if !allocate {
        return Resolution::Hole;
    }
    match free_map.allocate(1) {
        Some(s) => {
            *ptr = s;
            Resolution::Present(s)
        }
        None => Resolution::AllocFailed,
    }
}

/// Ensures `*ptr` names an allocated, zero-filled indirect sector.
/// Returns `false` (leaving `*ptr` untouched) when allocation was
/// needed but the free map is exhausted.
fn ensure_indirect_sector(cache: &Bcache, free_map: &FreeMap, ptr: &mut u32, allocate: bool) -> bool {
    if *ptr != 0 {
        return true;
    }
    if !allocate {
        return false;
    }
    match free_map.allocate(1) {
        Some(s) => {
            // Zero-fill through the cache before any pointer inside it
            // is ever read back out (spec §4.2).
            let _ = cache.acquire_zeroed(s);
            *ptr = s;
            true
        }
        None => false,
    }
}

fn walk_single_indirect(
    cache: &Bcache,
    free_map: &FreeMap,
    single_indirect: &mut u32,
    inner_idx: usize,
    allocate: bool,
) -> Resolution {
    if !ensure_indirect_sector(cache, free_map, single_indirect, allocate) {
        return if allocate {
            Resolution::AllocFailed
        } else {
            Resolution::Hole
        };
    }

    let mut buf = cache.acquire(*single_indirect);
    let existing = read_u32(&buf, inner_idx);
    if existing != 0 {
        return Resolution::Present(existing);
    }
    if !allocate {
        return Resolution::Hole;
    }
    match free_map.allocate(1) {
        Some(s) => {
            write_u32(&mut buf, inner_idx, s);
            Resolution::Present(s)
        }
        None => Resolution::AllocFailed,
    }
}

fn walk_double_indirect(
    cache: &Bcache,
    free_map: &FreeMap,
    double_indirect: &mut u32,
    outer_idx: usize,
    inner_idx: usize,
    allocate: bool,
) -> Resolution {
    if !ensure_indirect_sector(cache, free_map, double_indirect, allocate) {
        return if allocate {
            Resolution::AllocFailed
        } else {
            Resolution::Hole
        };
    }

    // Outer step: find (or allocate) the second-level indirect sector.
    let mut inner_sector;
    {
        let mut outer_buf = cache.acquire(*double_indirect);
        inner_sector = read_u32(&outer_buf, outer_idx);
        if inner_sector == 0 {
            if !allocate {
                return Resolution::Hole;
            }
            match free_map.allocate(1) {
                Some(s) => {
                    drop(outer_buf);
                    let _ = cache.acquire_zeroed(s);
                    outer_buf = cache.acquire(*double_indirect);
                    write_u32(&mut outer_buf, outer_idx, s);
                    inner_sector = s;
                }
                None => return Resolution::AllocFailed,
            }
        }
    } // outer slot released here, as a distinct step from the inner walk.

    // Inner step: find (or allocate) the data sector, entirely separate
    // from the outer-index arithmetic above.
    let mut inner_buf = cache.acquire(inner_sector);
    let data_sector = read_u32(&inner_buf, inner_idx);
    if data_sector != 0 {
        return Resolution::Present(data_sector);
    }
    if !allocate {
        return Resolution::Hole;
    }
    match free_map.allocate(1) {
        Some(s) => {
            write_u32(&mut inner_buf, inner_idx, s);
            Resolution::Present(s)
        }
        None => Resolution::AllocFailed,
    }
}

pub const fn block_index(offset: u64) -> usize {
    (offset / SECTOR_SIZE as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use std::sync::Arc;

    fn setup() -> (Arc<Bcache>, FreeMap) {
        let dev = Arc::new(MemBlockDevice::new(4000));
        let cache = Bcache::new(dev);
        let fm = FreeMap::format(4000);
        (cache, fm)
    }

    #[test]
    fn direct_block_allocates_lazily() {
        let (cache, fm) = setup();
        let mut direct = [0u32; DIRECT_BLOCKS];
        let mut single = 0u32;
        let mut double = 0u32;
        assert_eq!(
            walk(&cache, &fm, &mut direct, &mut single, &mut double, 0, false),
            Resolution::Hole
        );
        let r = walk(&cache, &fm, &mut direct, &mut single, &mut double, 0, true);
        assert!(matches!(r, Resolution::Present(_)));
        assert_ne!(direct[0], 0);
        cache.shutdown();
    }

    #[test]
    fn single_indirect_boundary_allocates_indirect_sector_once() {
        let (cache, fm) = setup();
        let mut direct = [0u32; DIRECT_BLOCKS];
        let mut single = 0u32;
        let mut double = 0u32;
        let r = walk(
            &cache,
            &fm,
            &mut direct,
            &mut single,
            &mut double,
            DIRECT_BLOCKS,
            true,
        );
        assert!(matches!(r, Resolution::Present(_)));
        assert_ne!(single, 0);
        assert!(direct.iter().all(|&d| d == 0));
        cache.shutdown();
    }

    #[test]
    fn double_indirect_boundary_allocates_both_levels() {
        let (cache, fm) = setup();
        let mut direct = [0u32; DIRECT_BLOCKS];
        let mut single = 0u32;
        let mut double = 0u32;
        let idx = DIRECT_BLOCKS + BLOCKS_PER_SECTOR;
        let r = walk(&cache, &fm, &mut direct, &mut single, &mut double, idx, true);
        assert!(matches!(r, Resolution::Present(_)));
        assert_ne!(double, 0);
        assert_eq!(single, 0);
        cache.shutdown();
    }

    #[test]
    fn read_without_allocate_never_mutates_pointers() {
        let (cache, fm) = setup();
        let mut direct = [0u32; DIRECT_BLOCKS];
        let mut single = 0u32;
        let mut double = 0u32;
        let idx = DIRECT_BLOCKS + BLOCKS_PER_SECTOR + 3;
        assert_eq!(
            walk(&cache, &fm, &mut direct, &mut single, &mut double, idx, false),
            Resolution::Hole
        );
        assert_eq!(single, 0);
        assert_eq!(double, 0);
        cache.shutdown();
    }

    #[test]
    fn exhausted_free_map_reports_alloc_failed() {
        let dev = Arc::new(MemBlockDevice::new(2));
        let cache = Bcache::new(dev);
        let fm = FreeMap::format(2); // only sector 0 reserved, sector 1 free
        let mut direct = [0u32; DIRECT_BLOCKS];
        let mut single = 0u32;
        let mut double = 0u32;
        assert!(matches!(
            walk(&cache, &fm, &mut direct, &mut single, &mut double, 0, true),
            Resolution::Present(_)
        ));
        assert_eq!(
            walk(&cache, &fm, &mut direct, &mut single, &mut double, 1, true),
            Resolution::AllocFailed
        );
        cache.shutdown();
    }
}
