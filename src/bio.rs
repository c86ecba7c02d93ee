//! Buffer cache.
//!
//! A fixed pool of `CACHE_SIZE` slots mediates every sector access.
//! Slots are kept in a single ordering list (LRU-ish: `release` moves a
//! slot to the tail); eviction is a clock-style sweep over that same
//! order, clearing `accessed` bits until an unpinned, unreferenced slot
//! turns up. A dedicated read-ahead thread prefetches one nominated
//! sector at a time; a dedicated write-back thread periodically flushes
//! dirty slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::trace;

use std::ops::{Deref, DerefMut};

use crate::device::BlockDevice;
use crate::param::{CACHE_SIZE, SECTOR_SIZE, WRITE_INTERVAL_MS};

/// A sector's worth of bytes. Kept as a distinct type rather than a
/// bare `[u8; SECTOR_SIZE]` so any future requirement on interpreting
/// the bytes as, say, a `u32` pointer array (the indirect-block
/// pointers) has one place to attach an alignment requirement.
#[derive(Clone, Copy)]
#[repr(align(4))]
struct BufData {
    inner: [u8; SECTOR_SIZE],
}

impl BufData {
    const fn zeroed() -> Self {
        Self {
            inner: [0u8; SECTOR_SIZE],
        }
    }
}

impl Deref for BufData {
    type Target = [u8; SECTOR_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

struct Slot {
    sector: Option<u32>,
    data: BufData,
    accessed: bool,
    dirty: bool,
    pin_count: u32,
}

impl Slot {
    const fn empty() -> Self {
        Self {
            sector: None,
            data: BufData::zeroed(),
            accessed: false,
            dirty: false,
            pin_count: 0,
        }
    }
}

/// What one sweep of the clock hand found.
enum Scan {
    /// The sector is already cached at this slot index.
    Match(usize),
    /// This slot index is free to evict (and reuse) for the sector.
    Victim(usize),
    /// Every slot is pinned; the caller must wait and retry.
    NoneAvailable,
}

struct CacheInner {
    slots: Vec<Slot>,
    /// Slot indices from least- to most-recently released.
    order: Vec<usize>,
}

impl CacheInner {
    fn touch_mru(&mut self, idx: usize) {
        self.order.retain(|&i| i != idx);
        self.order.push(idx);
    }

    /// One clock sweep. May need to be called twice: the first pass
    /// clears `accessed` bits, the second finds a cleared victim.
    fn scan(&mut self, sector: u32) -> Scan {
        loop {
            for &idx in &self.order {
                if self.slots[idx].sector == Some(sector) {
                    return Scan::Match(idx);
                }
            }

            let mut victim = None;
            let mut any_unpinned = false;
            for &idx in &self.order {
                let slot = &mut self.slots[idx];
                if slot.pin_count > 0 {
                    continue;
                }
                any_unpinned = true;
                if slot.sector.is_none() {
                    victim = Some(idx);
                    break;
                }
                if slot.accessed {
                    slot.accessed = false;
                    continue;
                }
                victim = Some(idx);
                break;
            }
            if let Some(v) = victim {
                return Scan::Victim(v);
            }
            if !any_unpinned {
                return Scan::NoneAvailable;
            }
            // Every unpinned slot had its `accessed` bit set and is now
            // cleared; loop again to find one to evict.
        }
    }
}

pub struct Bcache {
    device: Arc<dyn BlockDevice>,
    inner: Mutex<CacheInner>,
    avail: Condvar,
    read_ahead_pending: Mutex<Option<u32>>,
    read_ahead_cond: Condvar,
    shutting_down: AtomicBool,
    read_ahead_thread: Mutex<Option<JoinHandle<()>>>,
    write_back_thread: Mutex<Option<JoinHandle<()>>>,
}

/// A pinned slot. The caller may read/write `data()`/`data_mut()` only
/// while holding this guard; dropping it unpins the slot.
pub struct Buf<'a> {
    cache: &'a Bcache,
    idx: usize,
    dirty: bool,
}

impl Buf<'_> {
    pub fn sector(&self) -> u32 {
        self.cache.inner.lock().unwrap().slots[self.idx]
            .sector
            .expect("pinned slot always has a sector")
    }

    pub fn data(&self) -> [u8; SECTOR_SIZE] {
        self.cache.inner.lock().unwrap().slots[self.idx].data.inner
    }

    pub fn write(&mut self, bytes: &[u8; SECTOR_SIZE]) {
        self.cache.inner.lock().unwrap().slots[self.idx].data = BufData { inner: *bytes };
        self.dirty = true;
    }

    pub fn zero(&mut self) {
        self.cache.inner.lock().unwrap().slots[self.idx].data = BufData::zeroed();
        self.dirty = true;
    }

    /// Mutates a byte range `[offset, offset+len)` via `f`, marking the
    /// slot dirty.
    pub fn write_range(&mut self, offset: usize, f: impl FnOnce(&mut [u8])) {
        let mut guard = self.cache.inner.lock().unwrap();
        f(&mut guard.slots[self.idx].data.inner[offset..]);
        drop(guard);
        self.dirty = true;
    }

    pub fn read_range(&self, offset: usize, out: &mut [u8]) {
        let guard = self.cache.inner.lock().unwrap();
        out.copy_from_slice(&guard.slots[self.idx].data.inner[offset..offset + out.len()]);
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        self.cache.release(self.idx, self.dirty);
    }
}

impl Bcache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let inner = CacheInner {
            slots: (0..CACHE_SIZE).map(|_| Slot::empty()).collect(),
            order: (0..CACHE_SIZE).collect(),
        };
        let cache = Arc::new(Self {
            device,
            inner: Mutex::new(inner),
            avail: Condvar::new(),
            read_ahead_pending: Mutex::new(None),
            read_ahead_cond: Condvar::new(),
            shutting_down: AtomicBool::new(false),
            read_ahead_thread: Mutex::new(None),
            write_back_thread: Mutex::new(None),
        });
        cache.spawn_background_threads();
        cache
    }

    fn spawn_background_threads(self: &Arc<Self>) {
        let read_ahead_cache = Arc::clone(self);
        let read_ahead = thread::Builder::new()
            .name("read-ahead".into())
            .spawn(move || read_ahead_cache.read_ahead_loop())
            .expect("spawn read-ahead thread");
        *self.read_ahead_thread.lock().unwrap() = Some(read_ahead);

        let write_back_cache = Arc::clone(self);
        let write_back = thread::Builder::new()
            .name("write-back".into())
            .spawn(move || write_back_cache.write_back_loop())
            .expect("spawn write-back thread");
        *self.write_back_thread.lock().unwrap() = Some(write_back);
    }

    /// The underlying device, for collaborators (like the free map)
    /// that persist their own state outside the cache's slot pool.
    pub fn device(&self) -> &dyn BlockDevice {
        self.device.as_ref()
    }

    /// Returns a pinned slot holding `sector`'s current contents.
    pub fn acquire(&self, sector: u32) -> Buf<'_> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            match guard.scan(sector) {
                Scan::Match(idx) => {
                    guard.slots[idx].pin_count += 1;
                    guard.slots[idx].accessed = true;
                    guard.touch_mru(idx);
                    trace!("bcache: hit sector {sector} at slot {idx}");
                    return Buf {
                        cache: self,
                        idx,
                        dirty: false,
                    };
                }
                Scan::Victim(idx) => {
                    guard.slots[idx].pin_count += 1;
                    if guard.slots[idx].dirty {
                        let old_sector = guard.slots[idx].sector.expect("dirty slot has a sector");
                        let data = guard.slots[idx].data;
                        // Device I/O occurs with the slot pinned; the
                        // monitor lock may be held across it (spec §4.1).
                        self.device.block_write(old_sector, &data.inner);
                        guard.slots[idx].dirty = false;
                    }
                    let mut data = BufData::zeroed();
                    self.device.block_read(sector, &mut data.inner);
                    guard.slots[idx].sector = Some(sector);
                    guard.slots[idx].data = data;
                    guard.slots[idx].accessed = true;
                    guard.touch_mru(idx);
                    trace!("bcache: loaded sector {sector} into slot {idx}");
                    return Buf {
                        cache: self,
                        idx,
                        dirty: false,
                    };
                }
                Scan::NoneAvailable => {
                    guard = self.avail.wait(guard).unwrap();
                }
            }
        }
    }

    /// Returns a pinned slot with its contents zeroed, without reading
    /// the device first.
    pub fn acquire_zeroed(&self, sector: u32) -> Buf<'_> {
        let mut buf = self.acquire(sector);
        buf.zero();
        buf
    }

    fn release(&self, idx: usize, dirty: bool) {
        let mut guard = self.inner.lock().unwrap();
        if dirty {
            guard.slots[idx].dirty = true;
        }
        guard.slots[idx].pin_count -= 1;
        guard.slots[idx].accessed = true;
        guard.touch_mru(idx);
        self.avail.notify_all();
    }

    /// Sets the single pending read-ahead hint and wakes the read-ahead
    /// thread. A new nomination overwrites any pending one.
    pub fn nominate_read_ahead(&self, sector: u32) {
        *self.read_ahead_pending.lock().unwrap() = Some(sector);
        self.read_ahead_cond.notify_one();
    }

    fn read_ahead_loop(&self) {
        loop {
            let mut pending = self.read_ahead_pending.lock().unwrap();
            while pending.is_none() && !self.shutting_down.load(Ordering::Acquire) {
                pending = self.read_ahead_cond.wait(pending).unwrap();
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            let sector = pending.take().expect("nominated sector");
            drop(pending);
            let _ = self.acquire(sector);
        }
    }

    fn write_back_loop(&self) {
        loop {
            let (shutdown, _) = self.sleep_or_shutdown(Duration::from_millis(WRITE_INTERVAL_MS));
            self.write_back_pass();
            if shutdown {
                return;
            }
        }
    }

    fn sleep_or_shutdown(&self, d: Duration) -> (bool, ()) {
        thread::sleep(d);
        (self.shutting_down.load(Ordering::Acquire), ())
    }

    /// Walks the pool writing back every dirty, unpinned slot. Restarts
    /// from the head whenever it finds a pinned slot, so it never skips
    /// an entry that becomes free partway through the walk.
    pub fn write_back_pass(&self) {
        let mut guard = self.inner.lock().unwrap();
        let mut i = 0;
        while i < guard.slots.len() {
            if guard.slots[i].pin_count > 0 {
                guard = self.avail.wait(guard).unwrap();
                i = 0;
                continue;
            }
            if guard.slots[i].dirty {
                let sector = guard.slots[i].sector.expect("dirty slot has a sector");
                let data = guard.slots[i].data;
                guard.slots[i].pin_count += 1;
                self.device.block_write(sector, &data.inner);
                guard.slots[i].pin_count -= 1;
                guard.slots[i].dirty = false;
                trace!("bcache: wrote back sector {sector}");
                self.avail.notify_all();
            }
            i += 1;
        }
    }

    pub fn flush_all_dirty(&self) {
        self.write_back_pass();
    }

    /// Stops the background threads and flushes all dirty slots.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.read_ahead_cond.notify_all();
        if let Some(h) = self.read_ahead_thread.lock().unwrap().take() {
            h.join().expect("join read-ahead thread");
        }
        if let Some(h) = self.write_back_thread.lock().unwrap().take() {
            h.join().expect("join write-back thread");
        }
        self.flush_all_dirty();
    }

    #[cfg(test)]
    fn populated_sectors(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .slots
            .iter()
            .filter(|s| s.sector.is_some())
            .count()
    }
}
