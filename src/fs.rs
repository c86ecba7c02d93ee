//! File system entry points: `create`, `open`, `remove`, `init`,
//! `shutdown` (spec §4.5), composing the buffer cache, free map,
//! inode table, and directory layer.

use std::cell::Cell;
use std::sync::Arc;

use log::info;

use crate::bio::Bcache;
use crate::device::BlockDevice;
use crate::dir;
use crate::error::FsError;
use crate::file::OpenFile;
use crate::freemap::FreeMap;
use crate::inode::InodeTable;
use crate::param::ROOT_DIR_SECTOR;
use crate::path;

thread_local! {
    /// The calling thread's current-directory sector (spec §9: "the
    /// core reads a `current_dir_sector` from the calling thread").
    static CURRENT_DIR: Cell<u32> = const { Cell::new(ROOT_DIR_SECTOR) };
}

pub struct FileSystem {
    cache: Arc<Bcache>,
    free_map: Arc<FreeMap>,
    table: Arc<InodeTable>,
}

impl FileSystem {
    /// Probes `device`, initializing the buffer cache, free map, and
    /// inode table. When `format` is set, rebuilds the free map and
    /// root directory from scratch; otherwise reloads the free map
    /// persisted by a prior [`FileSystem::shutdown`].
    pub fn init(device: Arc<dyn BlockDevice>, format: bool) -> Self {
        let cache = Bcache::new(Arc::clone(&device));
        let free_map = Arc::new(if format {
            FreeMap::format(device.num_sectors())
        } else {
            FreeMap::load(device.as_ref())
        });
        let table = Arc::new(InodeTable::new());

        if format {
            let root_sector = free_map
                .allocate(1)
                .expect("formatting always has room for the root inode");
            assert_eq!(root_sector, ROOT_DIR_SECTOR, "root directory must live at ROOT_DIR_SECTOR");
            table.init_on_disk(&cache, root_sector, 0, true);
            let root = table.open(&cache, root_sector);
            dir::init_dir_entries(&root, &cache, &free_map, root_sector);
            table.close(&cache, &free_map, root);
            info!("fs: formatted and initialized root directory");
        }

        Self { cache, free_map, table }
    }

    /// Sets this thread's current directory, used to resolve relative
    /// paths (spec §4.4's resolve, step 2).
    pub fn set_current_dir(&self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve(path, false)?;
        if !resolved.dir.is_dir() {
            self.table.close(&self.cache, &self.free_map, resolved.dir);
            return Err(FsError::NotADirectory);
        }
        let sector = resolved.dir.sector;
        self.table.close(&self.cache, &self.free_map, resolved.dir);
        CURRENT_DIR.with(|c| c.set(sector));
        Ok(())
    }

    fn resolve(&self, path: &str, want_parent: bool) -> Result<dir::Resolved, FsError> {
        let root = dir::open_root(&self.cache, &self.table);
        let cwd_sector = CURRENT_DIR.with(|c| c.get());
        let cwd = self.table.open(&self.cache, cwd_sector);
        let result = dir::resolve(&self.table, &self.cache, &self.free_map, &root, &cwd, path, want_parent);
        self.table.close(&self.cache, &self.free_map, cwd);
        self.table.close(&self.cache, &self.free_map, root);
        result
    }

    /// Resolves `path`'s parent, allocates a new inode sector, builds
    /// the on-disk record, and adds the directory entry. On any
    /// failure after allocation, returns the sector to the free map
    /// (spec §4.5's "create").
    fn create_entry(&self, path: &str, is_dir: bool) -> Result<Arc<crate::inode::Inode>, FsError> {
        let resolved = self.resolve(path, true)?;
        let parent = resolved.dir;
        let name = resolved.leaf_name.expect("want_parent always yields a leaf name");

        let outcome = (|| {
            let sector = self.free_map.allocate(1).ok_or(FsError::OutOfSectors)?;
            self.table.init_on_disk(&self.cache, sector, 0, is_dir);
            match dir::dir_add(&parent, &self.cache, &self.free_map, &name, sector) {
                Ok(()) => Ok(sector),
                Err(e) => {
                    self.free_map.release(sector, 1);
                    Err(e)
                }
            }
        })();

        let sector = match outcome {
            Ok(sector) => sector,
            Err(e) => {
                self.table.close(&self.cache, &self.free_map, parent);
                return Err(e);
            }
        };

        let inode = self.table.open(&self.cache, sector);
        if is_dir {
            dir::init_dir_entries(&inode, &self.cache, &self.free_map, parent.sector);
        }
        self.table.close(&self.cache, &self.free_map, parent);
        Ok(inode)
    }

    /// Creates a regular file at `path` with `initial_length` (spec
    /// §4.5). A fresh file always starts at length 0 on disk; the
    /// parameter exists for contract parity and is asserted here
    /// rather than silently ignored.
    pub fn create(&self, path: &str, initial_length: u32) -> Result<(), FsError> {
        debug_assert_eq!(initial_length, 0, "this core only creates empty files");
        let inode = self.create_entry(path, false)?;
        self.table.close(&self.cache, &self.free_map, inode);
        Ok(())
    }

    /// Creates a directory at `path`, with `.`/`..` already populated.
    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let inode = self.create_entry(path, true)?;
        self.table.close(&self.cache, &self.free_map, inode);
        Ok(())
    }

    /// Resolves `path` to its leaf inode and returns a new file
    /// handle. Rejects a path ending in `/` that does not name a
    /// directory (spec §4.4's trailing-slash policy).
    pub fn open(&self, path: &str) -> Result<OpenFile, FsError> {
        let trailing_slash = path::has_trailing_slash(path);
        let resolved = self.resolve(path, false)?;
        if trailing_slash && !resolved.dir.is_dir() {
            self.table.close(&self.cache, &self.free_map, resolved.dir);
            return Err(FsError::NotADirectory);
        }
        Ok(OpenFile::new(
            resolved.dir,
            Arc::clone(&self.cache),
            Arc::clone(&self.free_map),
            Arc::clone(&self.table),
        ))
    }

    /// Reads into `out` at `file`'s cursor, advancing it.
    pub fn read(&self, file: &OpenFile, out: &mut [u8]) -> usize {
        file.read(out)
    }

    /// Writes `buf` at `file`'s cursor, advancing it.
    pub fn write(&self, file: &OpenFile, buf: &[u8]) -> usize {
        file.write(buf)
    }

    /// Yields `file`'s next directory entry name, or `None` once
    /// exhausted.
    pub fn readdir(&self, file: &OpenFile) -> Option<String> {
        file.readdir()
    }

    /// Resolves `path`'s parent, looks up the entry, refuses removal
    /// of a non-empty directory, clears the entry, and marks the
    /// target inode for deletion on final close (spec §4.5's
    /// "remove").
    pub fn remove(&self, path: &str) -> Result<(), FsError> {
        let resolved = self.resolve(path, true)?;
        let parent = resolved.dir;
        let name = resolved.leaf_name.expect("want_parent always yields a leaf name");

        let target = match dir::dir_lookup(&parent, &self.cache, &self.free_map, &self.table, &name) {
            Some(t) => t,
            None => {
                self.table.close(&self.cache, &self.free_map, parent);
                return Err(FsError::NotFound);
            }
        };

        if target.is_dir() && !dir::is_empty(&target, &self.cache, &self.free_map) {
            self.table.close(&self.cache, &self.free_map, parent);
            self.table.close(&self.cache, &self.free_map, target);
            return Err(FsError::NotEmpty);
        }

        dir::dir_remove(&parent, &self.cache, &self.free_map, &name)?;
        target.mark_removed();
        self.table.close(&self.cache, &self.free_map, parent);
        self.table.close(&self.cache, &self.free_map, target);
        Ok(())
    }

    /// Flushes every dirty cache slot and persists the free map.
    pub fn shutdown(&self) {
        self.cache.shutdown();
        self.free_map.persist(self.cache_device());
        info!("fs: shutdown complete");
    }

    fn cache_device(&self) -> &dyn BlockDevice {
        // `Bcache` owns the device; there is no other seam to persist
        // the free map through but a fresh read/write against sector 0,
        // so route through the cache's own device handle.
        self.cache.device()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn fresh() -> (Arc<MemBlockDevice>, FileSystem) {
        let dev = Arc::new(MemBlockDevice::new(4000));
        let fs = FileSystem::init(dev.clone(), true);
        (dev, fs)
    }

    #[test]
    fn direct_block_write_scenario() {
        let (_dev, fs) = fresh();
        fs.create("/a", 0).unwrap();
        let h = fs.open("/a").unwrap();
        let written = h.write(b"hello");
        assert_eq!(written, 5);
        assert_eq!(h.inode().length(), 5);

        let h2 = fs.open("/a").unwrap();
        let mut out = [0u8; 5];
        assert_eq!(h2.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        fs.shutdown();
    }

    #[test]
    fn directory_lifecycle_scenario() {
        let (_dev, fs) = fresh();
        fs.mkdir("/d").unwrap();
        fs.create("/d/x", 0).unwrap();
        assert_eq!(fs.remove("/d"), Err(FsError::NotEmpty));
        fs.remove("/d/x").unwrap();
        fs.remove("/d").unwrap();
        fs.shutdown();
    }

    #[test]
    fn create_rejects_duplicate_names() {
        let (_dev, fs) = fresh();
        fs.create("/a", 0).unwrap();
        assert_eq!(fs.create("/a", 0), Err(FsError::Exists));
        fs.shutdown();
    }

    #[test]
    fn open_rejects_trailing_slash_on_a_file() {
        let (_dev, fs) = fresh();
        fs.create("/a", 0).unwrap();
        match fs.open("/a/") {
            Err(FsError::NotADirectory) => {}
            other => panic!("expected NotADirectory, got {}", other.is_ok()),
        }
        fs.shutdown();
    }

    #[test]
    fn concurrent_opens_share_one_inode() {
        let (_dev, fs) = fresh();
        fs.create("/a", 0).unwrap();
        let a = fs.open("/a").unwrap();
        let b = fs.open("/a").unwrap();
        assert!(Arc::ptr_eq(a.inode(), b.inode()));
        fs.shutdown();
    }
}
