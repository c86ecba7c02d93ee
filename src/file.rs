//! Open-file-descriptor layer.
//!
//! Out of this core's scope per design: only `dir_readdir` is part of
//! the contract the core makes with a real file-handle type (spec §3).
//! This gives that contract a minimal, concrete handle so the crate is
//! directly usable without a caller supplying its own.

use std::sync::{Arc, Mutex};

use crate::bio::Bcache;
use crate::dir;
use crate::freemap::FreeMap;
use crate::inode::{Inode, InodeTable};

/// An open reference to an inode plus a byte cursor.
///
/// Holds everything `InodeTable::close` needs so `Drop` can return the
/// inode's open count to the table without the caller ever having to
/// remember to close it explicitly — the same RAII shape `Buf`'s
/// `Drop` uses to release a cache slot back to `Bcache`.
pub struct OpenFile {
    inode: Option<Arc<Inode>>,
    cache: Arc<Bcache>,
    free_map: Arc<FreeMap>,
    table: Arc<InodeTable>,
    pos: Mutex<u64>,
}

impl OpenFile {
    pub fn new(inode: Arc<Inode>, cache: Arc<Bcache>, free_map: Arc<FreeMap>, table: Arc<InodeTable>) -> Self {
        Self {
            inode: Some(inode),
            cache,
            free_map,
            table,
            pos: Mutex::new(0),
        }
    }

    /// The underlying inode. Only `None` after `drop`, so this never
    /// panics on a live handle.
    pub fn inode(&self) -> &Arc<Inode> {
        self.inode.as_ref().expect("inode only taken on drop")
    }

    /// Reads into `out` at the current cursor, advancing it by the
    /// number of bytes actually read.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let mut pos = self.pos.lock().unwrap();
        let n = self.inode().read_at(&self.cache, &self.free_map, out, *pos);
        *pos += n as u64;
        n
    }

    /// Writes `buf` at the current cursor, advancing it by the number
    /// of bytes actually written.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock().unwrap();
        let n = self.inode().write_at(&self.cache, &self.free_map, buf, *pos);
        *pos += n as u64;
        n
    }

    /// Yields the next directory entry name, advancing past `.`/`..`
    /// and unused slots (spec §3's "Only `dir_readdir` is part of this
    /// core's contract").
    pub fn readdir(&self) -> Option<String> {
        let mut pos = self.pos.lock().unwrap();
        dir::dir_readdir(self.inode(), &self.cache, &self.free_map, &mut pos)
    }

    pub fn seek(&self, pos: u64) {
        *self.pos.lock().unwrap() = pos;
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if let Some(inode) = self.inode.take() {
            self.table.close(&self.cache, &self.free_map, inode);
        }
    }
}
