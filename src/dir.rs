//! Directory layer: directories are inodes whose data is a packed
//! array of fixed-size [`Dirent`] records (spec §3, §4.4).

use std::sync::Arc;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::bio::Bcache;
use crate::error::FsError;
use crate::freemap::FreeMap;
use crate::inode::{Inode, InodeLock, InodeTable};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};
use crate::path;

/// One directory entry. Fixed size so entries can be located by
/// `index * DIRENT_SIZE` and reused in place once freed.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct Dirent {
    in_use: u32,
    name: [u8; NAME_MAX + 1],
    _reserved: u8,
    inode_sector: u32,
}

const_assert_eq!(std::mem::size_of::<Dirent>(), 24);

pub const DIRENT_SIZE: u64 = std::mem::size_of::<Dirent>() as u64;

/// The two reserved slots every directory starts with.
const RESERVED_ENTRIES: u64 = 2;

impl Dirent {
    fn empty() -> Self {
        Self {
            in_use: 0,
            name: [0; NAME_MAX + 1],
            _reserved: 0,
            inode_sector: 0,
        }
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        let bytes = name.as_bytes();
        self.name[..bytes.len()].copy_from_slice(bytes);
        self.name[bytes.len()] = 0;
    }

    fn to_bytes(self) -> [u8; DIRENT_SIZE as usize] {
        let mut out = [0u8; DIRENT_SIZE as usize];
        out.copy_from_slice(self.as_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; DIRENT_SIZE as usize]) -> Self {
        Self::read_from(bytes.as_slice()).expect("Dirent is exactly DIRENT_SIZE bytes")
    }
}

fn read_entry(lock: &mut InodeLock<'_>, cache: &Bcache, free_map: &FreeMap, offset: u64) -> Dirent {
    let mut bytes = [0u8; DIRENT_SIZE as usize];
    let n = lock.read(cache, free_map, &mut bytes, offset);
    if n < bytes.len() {
        return Dirent::empty();
    }
    Dirent::from_bytes(&bytes)
}

fn write_entry(lock: &mut InodeLock<'_>, cache: &Bcache, free_map: &FreeMap, offset: u64, entry: Dirent) {
    let bytes = entry.to_bytes();
    let written = lock.write(cache, free_map, &bytes, offset);
    assert_eq!(written, bytes.len(), "directory entry write was short");
}

fn entry_count(lock: &InodeLock<'_>) -> u64 {
    lock.length() / DIRENT_SIZE
}

/// Linear scan for an entry named `name`; spec: "first entry with
/// `in_use && name == target` wins".
fn lookup_locked(lock: &mut InodeLock<'_>, cache: &Bcache, free_map: &FreeMap, name: &str) -> Option<(Dirent, u64)> {
    let count = entry_count(lock);
    for i in 0..count {
        let offset = i * DIRENT_SIZE;
        let entry = read_entry(lock, cache, free_map, offset);
        if entry.in_use != 0 && entry.name_str() == name {
            return Some((entry, offset));
        }
    }
    None
}

/// Finds or opens the inode a directory entry names, using `table` so
/// the open-inode table's single-instance-per-sector invariant holds.
pub fn dir_lookup(dir: &Inode, cache: &Bcache, free_map: &FreeMap, table: &InodeTable, name: &str) -> Option<Arc<Inode>> {
    let mut lock = dir.lock();
    let (entry, _) = lookup_locked(&mut lock, cache, free_map, name)?;
    drop(lock);
    Some(table.open(cache, entry.inode_sector))
}

/// Adds `name -> inode_sector`, reusing the first free slot or
/// appending. Rejects empty/too-long names and duplicates (spec
/// §4.4's "Add").
fn add_locked(
    lock: &mut InodeLock<'_>,
    cache: &Bcache,
    free_map: &FreeMap,
    name: &str,
    inode_sector: u32,
) -> Result<(), FsError> {
    debug_assert!(lock.is_dir() && !lock.is_removed(), "directory entries only live in a live directory inode");
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    if lookup_locked(lock, cache, free_map, name).is_some() {
        return Err(FsError::Exists);
    }

    let count = entry_count(lock);
    let mut free_offset = None;
    for i in 0..count {
        let offset = i * DIRENT_SIZE;
        if read_entry(lock, cache, free_map, offset).in_use == 0 {
            free_offset = Some(offset);
            break;
        }
    }
    let offset = free_offset.unwrap_or(count * DIRENT_SIZE);

    let mut entry = Dirent::empty();
    entry.in_use = 1;
    entry.inode_sector = inode_sector;
    entry.set_name(name);
    write_entry(lock, cache, free_map, offset, entry);
    Ok(())
}

pub fn dir_add(dir: &Inode, cache: &Bcache, free_map: &FreeMap, name: &str, inode_sector: u32) -> Result<(), FsError> {
    let mut lock = dir.lock();
    add_locked(&mut lock, cache, free_map, name, inode_sector)
}

/// Clears `name`'s slot and marks the target inode removed so its
/// sectors are released at final close (spec §4.4's "Remove"). Does
/// not itself check emptiness of a directory target — that is the
/// caller's responsibility (`FileSystem::remove`), since only the
/// caller has the target inode open to inspect.
fn remove_locked(lock: &mut InodeLock<'_>, cache: &Bcache, free_map: &FreeMap, name: &str) -> Result<u32, FsError> {
    debug_assert!(lock.is_dir(), "directory entries only live in a directory inode");
    let (mut entry, offset) = lookup_locked(lock, cache, free_map, name).ok_or(FsError::NotFound)?;
    let sector = entry.inode_sector;
    entry.in_use = 0;
    write_entry(lock, cache, free_map, offset, entry);
    Ok(sector)
}

pub fn dir_remove(dir: &Inode, cache: &Bcache, free_map: &FreeMap, name: &str) -> Result<u32, FsError> {
    let mut lock = dir.lock();
    remove_locked(&mut lock, cache, free_map, name)
}

/// True iff no `in_use` entry exists beyond the reserved `.`/`..`
/// slots (spec §8, property 8).
pub fn is_empty(dir: &Inode, cache: &Bcache, free_map: &FreeMap) -> bool {
    let mut lock = dir.lock();
    let count = entry_count(&lock);
    for i in RESERVED_ENTRIES..count {
        let offset = i * DIRENT_SIZE;
        if read_entry(&mut lock, cache, free_map, offset).in_use != 0 {
            return false;
        }
    }
    true
}

/// Stateful readdir: advances `*pos` past one entry per call, skipping
/// `.`/`..` and unused slots, returning the next live entry's name.
pub fn dir_readdir(dir: &Inode, cache: &Bcache, free_map: &FreeMap, pos: &mut u64) -> Option<String> {
    let mut lock = dir.lock();
    if *pos < RESERVED_ENTRIES * DIRENT_SIZE {
        *pos = RESERVED_ENTRIES * DIRENT_SIZE;
    }
    let count = entry_count(&lock);
    loop {
        let i = *pos / DIRENT_SIZE;
        if i >= count {
            return None;
        }
        let entry = read_entry(&mut lock, cache, free_map, *pos);
        *pos += DIRENT_SIZE;
        if entry.in_use != 0 {
            return Some(entry.name_str().to_string());
        }
    }
}

/// Adds `.` and `..`, both pointing at `dir`'s own sector (spec §4.4's
/// "Root directory init"; also used for any freshly created
/// subdirectory, which needs the same two reserved entries).
pub fn init_dir_entries(dir: &Inode, cache: &Bcache, free_map: &FreeMap, parent_sector: u32) {
    let mut lock = dir.lock();
    add_locked(&mut lock, cache, free_map, ".", dir.sector).expect("fresh directory has no entries yet");
    add_locked(&mut lock, cache, free_map, "..", parent_sector).expect("fresh directory has no entries yet");
}

/// Outcome of [`resolve`]: either the final inode (when `want_parent`
/// is false) or the parent directory plus the leaf component name.
pub struct Resolved {
    pub dir: Arc<Inode>,
    pub leaf_name: Option<String>,
}

/// Walks `path` component by component against `root`/`start` (spec
/// §4.4's `resolve(path, out_leaf_name, want_parent)`, steps 1-8).
///
/// `start` is the inode to resolve relative paths against (the calling
/// thread's current directory); `root` anchors absolute paths. Both
/// are borrowed, not consumed — `resolve` opens its own references to
/// intermediate directories and closes each one before advancing to
/// the next (spec §5: "path resolution releases each directory's inode
/// reference before acquiring the next").
pub fn resolve(
    table: &InodeTable,
    cache: &Bcache,
    free_map: &FreeMap,
    root: &Arc<Inode>,
    start: &Arc<Inode>,
    path: &str,
    want_parent: bool,
) -> Result<Resolved, FsError> {
    if path.is_empty() {
        return Err(FsError::NotFound);
    }

    let mut current = if path::is_absolute(path) {
        table.reopen(root)
    } else {
        table.reopen(start)
    };
    let mut rest = path;

    loop {
        let Some((name, after)) = path::skip_elem(rest) else {
            if want_parent {
                // No component at all after trimming slashes: there is
                // no leaf to split off.
                table.close(cache, free_map, current);
                return Err(FsError::NotFound);
            }
            return Ok(Resolved {
                dir: current,
                leaf_name: None,
            });
        };
        rest = after;

        if name.len() > NAME_MAX {
            table.close(cache, free_map, current);
            return Err(FsError::NameTooLong);
        }
        if current.is_removed() {
            table.close(cache, free_map, current);
            return Err(FsError::NotFound);
        }

        if !current.is_dir() {
            table.close(cache, free_map, current);
            return Err(FsError::NotADirectory);
        }

        let is_last = rest.is_empty();
        if want_parent && is_last {
            return Ok(Resolved {
                dir: current,
                leaf_name: Some(name.to_string()),
            });
        }

        let next = match dir_lookup(&current, cache, free_map, table, name) {
            Some(next) => next,
            None => {
                table.close(cache, free_map, current);
                return Err(FsError::NotFound);
            }
        };
        table.close(cache, free_map, current);
        current = next;

        if is_last && !want_parent {
            return Ok(Resolved {
                dir: current,
                leaf_name: None,
            });
        }
    }
}

/// Opens the root directory's inode (reserved [`ROOT_DIR_SECTOR`]).
pub fn open_root(cache: &Bcache, table: &InodeTable) -> Arc<Inode> {
    table.open(cache, ROOT_DIR_SECTOR)
}
