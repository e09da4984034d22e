//! The index buffer: the flat batch of written extents shipped to the
//! delegator on sync.

use gustfs_proto::{Gfid, IndexEntry};
use itertools::Itertools;
use parking_lot::{Mutex, MutexGuard};

use crate::seg_tree::SegTree;

pub(crate) struct IndexBuffer {
    entries: Mutex<Vec<IndexEntry>>,
    capacity: usize,
}

impl IndexBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.lock().len() >= self.capacity
    }

    /// Append one entry; `false` means the buffer is full and the caller
    /// must flush before retrying.
    pub fn push(&self, entry: IndexEntry) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return false;
        }
        entries.push(entry);
        true
    }

    /// Exclusive access for the sync path, which sorts, ships, and clears
    /// in one critical section.
    pub fn lock(&self) -> MutexGuard<'_, Vec<IndexEntry>> {
        self.entries.lock()
    }

    /// Drop pending entries of an unlinked file.
    pub fn remove_gfid(&self, gfid: Gfid) {
        self.entries.lock().retain(|e| e.gfid != gfid);
    }

    /// Drop or clip pending entries past a truncation point.
    pub fn truncate_gfid(&self, gfid: Gfid, len: u64) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.gfid != gfid || e.file_offset < len);
        for e in entries.iter_mut() {
            if e.gfid == gfid && e.file_offset + e.length > len {
                e.length = len - e.file_offset;
            }
        }
    }
}

/// Re-derive a file's index entries from its segment tree, one entry per
/// segment, merging neighbours that are contiguous in both the file and the
/// log. This is what flatten-writes mode ships instead of the raw write
/// history.
pub(crate) fn flatten(gfid: Gfid, tree: &SegTree) -> Vec<IndexEntry> {
    tree.read()
        .iter()
        .map(|seg| IndexEntry {
            gfid,
            file_offset: seg.start,
            log_offset: seg.ptr,
            length: seg.len(),
        })
        .coalesce(|a, b| {
            if a.file_offset + a.length == b.file_offset && a.log_offset + a.length == b.log_offset {
                Ok(IndexEntry {
                    length: a.length + b.length,
                    ..a
                })
            } else {
                Err((a, b))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn push_honors_capacity() {
        let buf = IndexBuffer::new(2);
        let entry = IndexEntry {
            gfid: Gfid::from_raw(1),
            file_offset: 0,
            log_offset: 0,
            length: 4,
        };
        assert!(buf.push(entry));
        assert!(buf.push(entry));
        assert!(buf.is_full());
        assert!(!buf.push(entry));
        buf.lock().clear();
        assert!(buf.push(entry));
    }

    #[test]
    fn flatten_merges_contiguous_segments() {
        let gfid = Gfid::from_raw(9);
        let tree = SegTree::new();
        // Two writes that are contiguous in both file and log, then a gap,
        // then one that is file-contiguous but log-disjoint.
        tree.add(0, 9, 100);
        tree.add(10, 19, 110);
        tree.add(40, 49, 200);
        tree.add(50, 59, 400);

        assert_eq!(
            flatten(gfid, &tree),
            vec![
                IndexEntry { gfid, file_offset: 0, log_offset: 100, length: 20 },
                IndexEntry { gfid, file_offset: 40, log_offset: 200, length: 10 },
                IndexEntry { gfid, file_offset: 50, log_offset: 400, length: 10 },
            ]
        );
    }

    #[test]
    fn truncate_gfid_clips_straddlers() {
        let gfid = Gfid::from_raw(3);
        let other = Gfid::from_raw(4);
        let buf = IndexBuffer::new(8);
        for (offset, length) in [(0, 10), (20, 10)] {
            buf.push(IndexEntry { gfid, file_offset: offset, log_offset: offset, length });
        }
        buf.push(IndexEntry { gfid: other, file_offset: 100, log_offset: 50, length: 10 });

        buf.truncate_gfid(gfid, 25);
        let entries = buf.lock().clone();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].length, 5);
        assert_eq!(entries[2].gfid, other);
    }
}
