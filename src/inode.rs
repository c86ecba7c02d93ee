//! Inode layer: indexed allocation over direct, single-indirect, and
//! double-indirect block pointers, with an open-inode table enforcing
//! "at most one in-memory inode per on-disk sector" (spec §8, property
//! 3).

use std::sync::{Arc, Mutex};

use log::debug;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::Bcache;
use crate::freemap::FreeMap;
use crate::param::{
    BLOCKS_PER_SECTOR, DIRECT_BLOCKS, DOUBLE_INDIRECT, MAX_FILE_SIZE, NO_SECTOR, NUM_SECTOR_SLOTS,
    SECTOR_SIZE, SINGLE_INDIRECT,
};
use crate::walk::{self, Resolution};

/// On-disk inode record. Exactly `SECTOR_SIZE` bytes.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct Dinode {
    length: i32,
    is_dir: u32,
    sectors: [u32; NUM_SECTOR_SLOTS],
}

const_assert_eq!(std::mem::size_of::<Dinode>(), SECTOR_SIZE);

impl Dinode {
    fn zeroed(length: i32, is_dir: bool) -> Self {
        Self {
            length,
            is_dir: is_dir as u32,
            sectors: [0; NUM_SECTOR_SLOTS],
        }
    }

    fn to_bytes(self) -> [u8; SECTOR_SIZE] {
        let mut out = [0u8; SECTOR_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; SECTOR_SIZE]) -> Self {
        Self::read_from(bytes.as_slice()).expect("Dinode is exactly one sector wide")
    }
}

pub(crate) struct InodeState {
    record: Dinode,
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
}

/// A held per-inode lock, letting callers run several `read`/`write`
/// steps as one atomic unit — e.g. directory "look up, then add if
/// absent" (spec §4.4/§4.5: directory-entry mutations are serialized by
/// the owning inode's lock).
pub(crate) struct InodeLock<'a> {
    sector: u32,
    guard: std::sync::MutexGuard<'a, InodeState>,
}

impl InodeLock<'_> {
    pub fn length(&self) -> u64 {
        self.guard.record.length as u64
    }

    pub fn is_dir(&self) -> bool {
        self.guard.record.is_dir != 0
    }

    pub fn is_removed(&self) -> bool {
        self.guard.removed
    }

    pub fn read(&mut self, cache: &Bcache, free_map: &FreeMap, out: &mut [u8], off: u64) -> usize {
        read_within(&mut self.guard, cache, free_map, out, off)
    }

    pub fn write(&mut self, cache: &Bcache, free_map: &FreeMap, buf: &[u8], off: u64) -> usize {
        let n = write_within(&mut self.guard, cache, free_map, buf, off);
        let record = self.guard.record;
        persist_record(cache, self.sector, record);
        n
    }
}

/// A live in-memory inode. Exactly one exists per on-disk sector at a
/// time (enforced by [`InodeTable`]).
pub struct Inode {
    pub sector: u32,
    state: Mutex<InodeState>,
}

impl Inode {
    /// Locks this inode's state for the duration of a compound
    /// operation (e.g. a directory add/remove that must look up an
    /// entry and then mutate it without another thread interleaving).
    pub(crate) fn lock(&self) -> InodeLock<'_> {
        InodeLock {
            sector: self.sector,
            guard: self.state.lock().unwrap(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.state.lock().unwrap().record.is_dir != 0
    }

    pub fn length(&self) -> u64 {
        self.state.lock().unwrap().record.length as u64
    }

    pub fn deny_write(&self) {
        let mut st = self.state.lock().unwrap();
        st.deny_write_count += 1;
        assert!(
            st.deny_write_count <= st.open_count,
            "deny_write_count must never exceed open_count"
        );
    }

    pub fn allow_write(&self) {
        let mut st = self.state.lock().unwrap();
        assert!(st.deny_write_count > 0, "allow_write without a matching deny_write");
        st.deny_write_count -= 1;
    }

    pub fn mark_removed(&self) {
        self.state.lock().unwrap().removed = true;
    }

    pub fn is_removed(&self) -> bool {
        self.state.lock().unwrap().removed
    }

    /// Reads up to `n` bytes starting at `off` into `out`. Returns the
    /// number of bytes actually read: `min(n, max(0, length - off))`
    /// when every intervening sector is present (spec §8, property 1).
    ///
    /// `free_map` is never mutated here (`walk` only consults it when
    /// asked to allocate); it is threaded through purely to keep one
    /// walker signature shared between reads and writes.
    pub fn read_at(&self, cache: &Bcache, free_map: &FreeMap, out: &mut [u8], off: u64) -> usize {
        let mut st = self.state.lock().unwrap();
        read_within(&mut st, cache, free_map, out, off)
    }

    /// Writes `buf` at offset `off`, allocating sectors on demand.
    /// Returns the number of bytes actually written; refuses (`0`)
    /// while `deny_write_count > 0` (spec §4.3, §7).
    pub fn write_at(&self, cache: &Bcache, free_map: &FreeMap, buf: &[u8], off: u64) -> usize {
        let mut st = self.state.lock().unwrap();
        let total = write_within(&mut st, cache, free_map, buf, off);
        let record = st.record;
        drop(st);
        persist_record(cache, self.sector, record);
        total
    }
}

fn persist_record(cache: &Bcache, sector: u32, record: Dinode) {
    let mut buf = cache.acquire(sector);
    buf.write(&record.to_bytes());
}

/// Core of [`Inode::read_at`], operating on an already-locked state so
/// [`InodeLock`] can run it as one step of a larger critical section.
fn read_within(st: &mut InodeState, cache: &Bcache, free_map: &FreeMap, out: &mut [u8], off: u64) -> usize {
    let n = out.len();
    let length = st.record.length as u64;
    if off >= length {
        return 0;
    }
    let n = n.min((length - off) as usize);

    let mut total = 0usize;
    while total < n {
        let pos = off + total as u64;
        let idx = walk::block_index(pos);
        let mut direct: [u32; DIRECT_BLOCKS] = st.record.sectors[..DIRECT_BLOCKS].try_into().unwrap();
        let mut single = st.record.sectors[SINGLE_INDIRECT];
        let mut double = st.record.sectors[DOUBLE_INDIRECT];
        let resolution = walk::walk(cache, free_map, &mut direct, &mut single, &mut double, idx, false);
        let in_sector = (pos % SECTOR_SIZE as u64) as usize;
        let chunk = (SECTOR_SIZE - in_sector).min(n - total);
        match resolution {
            Resolution::Present(sector) => {
                let buf = cache.acquire(sector);
                buf.read_range(in_sector, &mut out[total..total + chunk]);
            }
            Resolution::Hole => {
                out[total..total + chunk].fill(0);
            }
            Resolution::AllocFailed => break,
        }
        total += chunk;
    }

    // Nominate the next sequential sector for read-ahead when another
    // full sector still lies within the file's length.
    let next_pos = off + total as u64;
    if next_pos < length {
        let idx = walk::block_index(next_pos);
        let mut direct: [u32; DIRECT_BLOCKS] = st.record.sectors[..DIRECT_BLOCKS].try_into().unwrap();
        let mut single = st.record.sectors[SINGLE_INDIRECT];
        let mut double = st.record.sectors[DOUBLE_INDIRECT];
        if let Resolution::Present(sector) =
            walk::walk(cache, free_map, &mut direct, &mut single, &mut double, idx, false)
        {
            cache.nominate_read_ahead(sector);
        }
    }

    total
}

/// Core of [`Inode::write_at`], operating on an already-locked state.
/// Leaves the updated record in `st` for the caller to persist — a
/// caller running several writes back to back (directory growth, say)
/// persists once after the whole sequence instead of after each step.
fn write_within(st: &mut InodeState, cache: &Bcache, free_map: &FreeMap, buf: &[u8], off: u64) -> usize {
    if st.deny_write_count > 0 {
        return 0;
    }

    let n = buf.len();
    let mut total = 0usize;
    while total < n {
        let pos = off + total as u64;
        if pos >= MAX_FILE_SIZE {
            break;
        }
        let idx = walk::block_index(pos);
        let mut direct: [u32; DIRECT_BLOCKS] = st.record.sectors[..DIRECT_BLOCKS].try_into().unwrap();
        let mut single = st.record.sectors[SINGLE_INDIRECT];
        let mut double = st.record.sectors[DOUBLE_INDIRECT];
        let resolution = walk::walk(cache, free_map, &mut direct, &mut single, &mut double, idx, true);
        st.record.sectors[..DIRECT_BLOCKS].copy_from_slice(&direct);
        st.record.sectors[SINGLE_INDIRECT] = single;
        st.record.sectors[DOUBLE_INDIRECT] = double;

        let data_sector = resolution.sector_or_sentinel();
        if data_sector == NO_SECTOR {
            break;
        }

        let in_sector = (pos % SECTOR_SIZE as u64) as usize;
        let remaining_in_file = (MAX_FILE_SIZE - pos) as usize;
        let chunk = (SECTOR_SIZE - in_sector).min(n - total).min(remaining_in_file);
        let mut data_buf = cache.acquire(data_sector);
        data_buf.write_range(in_sector, |dst| {
            dst[..chunk].copy_from_slice(&buf[total..total + chunk]);
        });
        total += chunk;
    }

    let final_off = off + total as u64;
    if final_off > st.record.length as u64 {
        st.record.length = final_off as i32;
    }
    total
}

/// Process-wide table of live in-memory inodes, keyed by sector.
pub struct InodeTable {
    table: Mutex<Vec<Arc<Inode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Vec::new()),
        }
    }

    /// Builds a zero-initialized on-disk record for a newly allocated
    /// inode sector and writes it through the cache (spec §4.3,
    /// "Create").
    pub fn init_on_disk(&self, cache: &Bcache, sector: u32, length: i32, is_dir: bool) {
        let record = Dinode::zeroed(length, is_dir);
        let mut buf = cache.acquire(sector);
        buf.write(&record.to_bytes());
    }

    /// Finds or opens the in-memory inode for `sector`.
    pub fn open(&self, cache: &Bcache, sector: u32) -> Arc<Inode> {
        let mut table = self.table.lock().unwrap();
        if let Some(existing) = table.iter().find(|i| i.sector == sector) {
            existing.state.lock().unwrap().open_count += 1;
            return Arc::clone(existing);
        }
        let bytes = cache.acquire(sector).data();
        let record = Dinode::from_bytes(&bytes);
        let inode = Arc::new(Inode {
            sector,
            state: Mutex::new(InodeState {
                record,
                open_count: 1,
                removed: false,
                deny_write_count: 0,
            }),
        });
        table.push(Arc::clone(&inode));
        inode
    }

    /// Bumps `open_count` on an already-open inode.
    pub fn reopen(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        inode.state.lock().unwrap().open_count += 1;
        Arc::clone(inode)
    }

    /// Drops one reference. When the last reference closes, the inode
    /// leaves the table; if it was marked removed, every sector it
    /// owned (direct, indirect, and the inode sector itself) is
    /// released to `free_map`.
    ///
    /// Holds `self.table`'s lock across the open_count decrement and
    /// the table removal, the same ordering `open`/`reopen` use, so a
    /// concurrent `open` can never observe the entry still in the
    /// table after its open_count has already dropped to zero here.
    pub fn close(&self, cache: &Bcache, free_map: &FreeMap, inode: Arc<Inode>) {
        let mut table = self.table.lock().unwrap();
        let (removed, record) = {
            let mut st = inode.state.lock().unwrap();
            st.open_count -= 1;
            if st.open_count != 0 {
                return;
            }
            (st.removed, st.record)
        };
        table.retain(|i| i.sector != inode.sector);
        drop(table);
        if removed {
            release_owned_sectors(cache, free_map, &record);
            free_map.release(inode.sector, 1);
            debug!("inode: released sector {} on final close", inode.sector);
        }
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

fn release_owned_sectors(cache: &Bcache, free_map: &FreeMap, record: &Dinode) {
    for &s in &record.sectors[..DIRECT_BLOCKS] {
        if s != 0 {
            free_map.release(s, 1);
        }
    }

    let single = record.sectors[SINGLE_INDIRECT];
    if single != 0 {
        for i in 0..BLOCKS_PER_SECTOR {
            let ptr = read_pointer(cache, single, i);
            if ptr != 0 {
                free_map.release(ptr, 1);
            }
        }
        free_map.release(single, 1);
    }

    let double = record.sectors[DOUBLE_INDIRECT];
    if double != 0 {
        for outer in 0..BLOCKS_PER_SECTOR {
            let inner_sector = read_pointer(cache, double, outer);
            if inner_sector == 0 {
                continue;
            }
            for inner in 0..BLOCKS_PER_SECTOR {
                let ptr = read_pointer(cache, inner_sector, inner);
                if ptr != 0 {
                    free_map.release(ptr, 1);
                }
            }
            free_map.release(inner_sector, 1);
        }
        free_map.release(double, 1);
    }
}

fn read_pointer(cache: &Bcache, sector: u32, slot: usize) -> u32 {
    let buf = cache.acquire(sector);
    let mut bytes = [0u8; 4];
    buf.read_range(slot * 4, &mut bytes);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use std::sync::Arc;

    fn setup() -> (Arc<Bcache>, FreeMap, InodeTable) {
        let dev = Arc::new(MemBlockDevice::new(4000));
        let cache = Bcache::new(dev);
        let fm = FreeMap::format(4000);
        (cache, fm, InodeTable::new())
    }

    #[test]
    fn dinode_is_exactly_one_sector() {
        assert_eq!(std::mem::size_of::<Dinode>(), SECTOR_SIZE);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (cache, fm, table) = setup();
        let sector = fm.allocate(1).unwrap();
        table.init_on_disk(&cache, sector, 0, false);
        let inode = table.open(&cache, sector);

        let written = inode.write_at(&cache, &fm, b"hello", 0);
        assert_eq!(written, 5);
        assert_eq!(inode.length(), 5);

        let mut out = [0u8; 5];
        let read = inode.read_at(&cache, &fm, &mut out, 0);
        assert_eq!(read, 5);
        assert_eq!(&out, b"hello");
        cache.shutdown();
    }

    #[test]
    fn deny_write_blocks_writes() {
        let (cache, fm, table) = setup();
        let sector = fm.allocate(1).unwrap();
        table.init_on_disk(&cache, sector, 0, false);
        let inode = table.open(&cache, sector);
        inode.deny_write();
        assert_eq!(inode.write_at(&cache, &fm, b"x", 0), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(&cache, &fm, b"x", 0), 1);
        cache.shutdown();
    }

    #[test]
    fn size_ceiling_truncates_writes() {
        let (cache, fm, table) = setup();
        let sector = fm.allocate(1).unwrap();
        table.init_on_disk(&cache, sector, 0, false);
        let inode = table.open(&cache, sector);
        let payload = vec![1u8; 100];
        let written = inode.write_at(&cache, &fm, &payload, MAX_FILE_SIZE - 50);
        assert_eq!(written, 50);
        assert_eq!(inode.length(), MAX_FILE_SIZE);
        assert_eq!(inode.write_at(&cache, &fm, &[1u8], MAX_FILE_SIZE), 0);
        cache.shutdown();
    }

    #[test]
    fn open_then_reopen_shares_one_in_memory_inode() {
        let (cache, fm, table) = setup();
        let sector = fm.allocate(1).unwrap();
        table.init_on_disk(&cache, sector, 0, false);
        let a = table.open(&cache, sector);
        let b = table.open(&cache, sector);
        assert!(Arc::ptr_eq(&a, &b));
        cache.shutdown();
    }

    #[test]
    fn close_of_removed_inode_frees_its_sectors() {
        let (cache, fm, table) = setup();
        let sector = fm.allocate(1).unwrap();
        table.init_on_disk(&cache, sector, 0, false);
        let inode = table.open(&cache, sector);
        inode.write_at(&cache, &fm, &[1u8; 2000], 0); // spans several direct blocks
        inode.mark_removed();
        table.close(&cache, &fm, inode);

        // Every sector the inode owned (including its own) must now be
        // allocatable again.
        let mut allocated = Vec::new();
        while let Some(s) = fm.allocate(1) {
            allocated.push(s);
        }
        assert!(allocated.contains(&sector));
        cache.shutdown();
    }
}
