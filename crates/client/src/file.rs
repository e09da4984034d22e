//! Local file table: path to fid mapping plus per-fid metadata.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gustfs_proto::{FileAttr, Gfid, MODE_DIR};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::seg_tree::SegTree;

/// Local file id. Small, recycled on unlink, meaningless outside this
/// process; the delegator only ever sees the [`Gfid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fid(pub(crate) usize);

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fid:{}", self.0)
    }
}

/// Per-fid metadata record.
///
/// `local_size <= log_size` always holds for flat files. Once `is_laminated`
/// is set nothing changes any more except that `global_size` was fixed at
/// the transition.
#[derive(Debug)]
pub(crate) struct FileMeta {
    pub path: String,
    pub gfid: Gfid,
    /// Permission bits only; directory-ness is `is_dir`.
    pub mode: u32,
    pub is_dir: bool,
    pub is_laminated: bool,
    /// True iff the segment tree or index buffer holds unsynced entries
    /// for this file.
    pub needs_sync: bool,
    /// Highest byte written locally, plus one.
    pub local_size: u64,
    /// Bytes this file has appended to the log store.
    pub log_size: u64,
    /// Authoritative size; valid only once laminated.
    pub global_size: u64,
    pub tree: Arc<SegTree>,
}

impl FileMeta {
    pub fn new(path: String, gfid: Gfid, mode: u32, is_dir: bool) -> Self {
        Self {
            path,
            gfid,
            mode,
            is_dir,
            is_laminated: false,
            needs_sync: false,
            local_size: 0,
            log_size: 0,
            global_size: 0,
            tree: Arc::new(SegTree::new()),
        }
    }

    /// Build the record from a global attribute fetch, for files this
    /// process has never written.
    pub fn from_attr(path: String, attr: &FileAttr) -> Self {
        let mut meta = Self::new(path, attr.gfid, attr.mode & !MODE_DIR, attr.is_dir());
        meta.is_laminated = attr.is_laminated;
        if attr.is_laminated {
            meta.global_size = attr.size;
        }
        meta
    }

    /// The size visible to seeks and laminated reads.
    pub fn logical_size(&self) -> u64 {
        if self.is_laminated {
            self.global_size
        } else {
            self.local_size
        }
    }

    /// Global metadata record to push to the delegator.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            gfid: self.gfid,
            mode: self.mode | if self.is_dir { MODE_DIR } else { 0 },
            size: if self.is_laminated { self.global_size } else { 0 },
            is_laminated: self.is_laminated,
        }
    }
}

#[derive(Default)]
struct Inner {
    by_path: HashMap<String, Fid>,
    slots: Vec<Option<FileMeta>>,
    free: Vec<usize>,
}

/// The table itself: fixed number of fid slots recycled through a freelist.
pub(crate) struct FileTable {
    inner: Mutex<Inner>,
    max_files: usize,
}

impl FileTable {
    pub fn new(max_files: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_files,
        }
    }

    pub fn lookup(&self, path: &str) -> Option<Fid> {
        self.inner.lock().by_path.get(path).copied()
    }

    /// Insert a fresh record, failing if the path is taken or the table is
    /// out of slots.
    pub fn create(&self, meta: FileMeta) -> Result<Fid> {
        let mut inner = self.inner.lock();
        if inner.by_path.contains_key(&meta.path) {
            return Err(Error::Exists);
        }
        let slot = match inner.free.pop() {
            Some(slot) => slot,
            None if inner.slots.len() < self.max_files => {
                inner.slots.push(None);
                inner.slots.len() - 1
            }
            None => return Err(Error::OutOfMemory),
        };
        let fid = Fid(slot);
        inner.by_path.insert(meta.path.clone(), fid);
        inner.slots[slot] = Some(meta);
        Ok(fid)
    }

    /// Drop the record, returning it so the caller can release what it owns.
    pub fn remove(&self, fid: Fid) -> Option<FileMeta> {
        let mut inner = self.inner.lock();
        let meta = inner.slots.get_mut(fid.0)?.take()?;
        inner.by_path.remove(&meta.path);
        inner.free.push(fid.0);
        Some(meta)
    }

    pub fn get<R>(&self, fid: Fid, f: impl FnOnce(&FileMeta) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.slots.get(fid.0)?.as_ref().map(f)
    }

    pub fn update<R>(&self, fid: Fid, f: impl FnOnce(&mut FileMeta) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.slots.get_mut(fid.0)?.as_mut().map(f)
    }

    /// Rebind `fid` to a new path, recomputing its key in the path map.
    pub fn rename(&self, fid: Fid, new_path: String, new_gfid: Gfid) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.by_path.contains_key(&new_path) {
            return Err(Error::Exists);
        }
        let Some(meta) = inner.slots.get_mut(fid.0).and_then(Option::as_mut) else {
            return Err(Error::NotFound);
        };
        let old_path = std::mem::replace(&mut meta.path, new_path.clone());
        meta.gfid = new_gfid;
        inner.by_path.remove(&old_path);
        inner.by_path.insert(new_path, fid);
        Ok(())
    }

    /// Whether any entry lives directly or transitively under `dir_path`.
    pub fn has_children(&self, dir_path: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .by_path
            .keys()
            .any(|p| p.len() > dir_path.len() && p.starts_with(dir_path) && p.as_bytes()[dir_path.len()] == b'/')
    }

    pub fn dirty_fids(&self) -> Vec<Fid> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.as_ref().is_some_and(|m| m.needs_sync))
            .map(|(i, _)| Fid(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(path: &str) -> FileMeta {
        FileMeta::new(path.to_owned(), Gfid::from_path(path), 0o644, false)
    }

    #[test]
    fn create_lookup_remove() {
        let table = FileTable::new(4);
        let fid = table.create(meta("/gust/a")).unwrap();
        assert_eq!(table.lookup("/gust/a"), Some(fid));
        assert!(matches!(table.create(meta("/gust/a")), Err(Error::Exists)));

        let removed = table.remove(fid).unwrap();
        assert_eq!(removed.path, "/gust/a");
        assert_eq!(table.lookup("/gust/a"), None);
        assert!(table.remove(fid).is_none());
    }

    #[test]
    fn slots_recycle() {
        let table = FileTable::new(2);
        let a = table.create(meta("/gust/a")).unwrap();
        let _b = table.create(meta("/gust/b")).unwrap();
        assert!(matches!(table.create(meta("/gust/c")), Err(Error::OutOfMemory)));

        table.remove(a).unwrap();
        let c = table.create(meta("/gust/c")).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn children_detection_is_component_wise() {
        let table = FileTable::new(8);
        table.create(meta("/gust/dir/file")).unwrap();
        assert!(table.has_children("/gust/dir"));
        // A sibling whose name shares the prefix is not a child.
        assert!(!table.has_children("/gust/di"));
    }
}
