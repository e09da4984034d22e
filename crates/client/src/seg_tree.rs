//! Per-file extent index: ordered, non-overlapping segments mapping a
//! logical byte range to its position in the log store.
//!
//! Segments coalesce a file's writes between syncs. A newer `add` wins over
//! whatever it overlaps: fully covered older segments are deleted, partially
//! covered ones are shrunk to their non-overlapping remainder (possibly one
//! on each side). The log itself is never rewritten; a right-hand remainder
//! advances its log pointer by however many bytes were cut off its front.

use std::collections::BTreeMap;

use parking_lot::{RwLock, RwLockReadGuard};

/// One extent: the inclusive logical range `[start, end]` backed by log
/// bytes starting at `ptr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
    pub ptr: u64,
}

#[allow(clippy::len_without_is_empty)]
impl Segment {
    /// Number of bytes covered. Bounds are inclusive, so never zero.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Thread-safe segment tree. One reader-writer lock per tree; `add`,
/// `clear`, and `truncate` take the writer side internally, iteration goes
/// through the borrowing cursor returned by [`SegTree::read`].
#[derive(Debug, Default)]
pub struct SegTree {
    // Keyed by segment start; disjointness makes the key unique.
    inner: RwLock<BTreeMap<u64, Segment>>,
}

impl SegTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[start, end] -> ptr`, evicting or shrinking every older
    /// segment it overlaps.
    pub fn add(&self, start: u64, end: u64, ptr: u64) {
        debug_assert!(start <= end);
        let mut tree = self.inner.write();

        // Only a contiguous run of segments can overlap [start, end]: the
        // predecessor of `start`, plus everything starting within the range.
        let scan_from = tree
            .range(..=start)
            .next_back()
            .filter(|(_, seg)| seg.end >= start)
            .map(|(&k, _)| k)
            .unwrap_or(start);

        let mut evicted = Vec::new();
        let mut remainders = Vec::new();
        for (&key, seg) in tree.range(scan_from..=end) {
            if seg.end < start {
                // The predecessor candidate that turned out not to overlap.
                continue;
            }
            evicted.push(key);
            if seg.start < start {
                remainders.push(Segment {
                    start: seg.start,
                    end: start - 1,
                    ptr: seg.ptr,
                });
            }
            if seg.end > end {
                remainders.push(Segment {
                    start: end + 1,
                    end: seg.end,
                    ptr: seg.ptr + (end + 1 - seg.start),
                });
            }
        }

        for key in evicted {
            tree.remove(&key);
        }
        for seg in remainders {
            tree.insert(seg.start, seg);
        }
        tree.insert(start, Segment { start, end, ptr });
    }

    /// Borrowing cursor for in-order traversal. The read lock is held for
    /// the lifetime of the returned guard; the sequence is not restartable
    /// across mutations.
    pub fn read(&self) -> TreeReader<'_> {
        TreeReader(self.inner.read())
    }

    /// Drop every segment, keeping the tree usable.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Drop or clip segments so that nothing extends at or beyond `len`.
    pub fn truncate(&self, len: u64) {
        let mut tree = self.inner.write();
        if len == 0 {
            tree.clear();
            return;
        }
        let split: Vec<u64> = tree.range(len..).map(|(&k, _)| k).collect();
        for key in split {
            tree.remove(&key);
        }
        // One straddling segment may remain; clip it.
        if let Some((_, seg)) = tree.range_mut(..len).next_back()
            && seg.end >= len
        {
            seg.end = len - 1;
        }
    }
}

/// Read-locked view of a [`SegTree`].
pub struct TreeReader<'a>(RwLockReadGuard<'a, BTreeMap<u64, Segment>>);

impl TreeReader<'_> {
    pub fn iter(&self) -> impl Iterator<Item = &Segment> + '_ {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn segments(tree: &SegTree) -> Vec<Segment> {
        tree.read().iter().copied().collect()
    }

    #[test]
    fn disjoint_adds_coexist() {
        let tree = SegTree::new();
        tree.add(10, 19, 100);
        tree.add(30, 39, 200);
        tree.add(0, 5, 300);
        assert_eq!(
            segments(&tree),
            vec![
                Segment { start: 0, end: 5, ptr: 300 },
                Segment { start: 10, end: 19, ptr: 100 },
                Segment { start: 30, end: 39, ptr: 200 },
            ]
        );
    }

    #[test]
    fn covered_segment_is_evicted() {
        let tree = SegTree::new();
        tree.add(5, 10, 0);
        tree.add(0, 20, 50);
        assert_eq!(segments(&tree), vec![Segment { start: 0, end: 20, ptr: 50 }]);
    }

    #[test]
    fn left_remainder_keeps_ptr() {
        let tree = SegTree::new();
        tree.add(0, 9, 100);
        tree.add(5, 15, 200);
        assert_eq!(
            segments(&tree),
            vec![
                Segment { start: 0, end: 4, ptr: 100 },
                Segment { start: 5, end: 15, ptr: 200 },
            ]
        );
    }

    #[test]
    fn right_remainder_advances_ptr() {
        let tree = SegTree::new();
        tree.add(0, 9, 100);
        tree.add(0, 3, 200);
        assert_eq!(
            segments(&tree),
            vec![
                Segment { start: 0, end: 3, ptr: 200 },
                // bytes 4..=9 still live at their original log position
                Segment { start: 4, end: 9, ptr: 104 },
            ]
        );
    }

    #[test]
    fn interior_add_splits_both_sides() {
        let tree = SegTree::new();
        tree.add(0, 9, 100);
        tree.add(3, 6, 200);
        assert_eq!(
            segments(&tree),
            vec![
                Segment { start: 0, end: 2, ptr: 100 },
                Segment { start: 3, end: 6, ptr: 200 },
                Segment { start: 7, end: 9, ptr: 107 },
            ]
        );
    }

    #[test]
    fn add_spanning_many_segments() {
        let tree = SegTree::new();
        tree.add(0, 9, 0);
        tree.add(20, 29, 10);
        tree.add(40, 49, 20);
        tree.add(5, 44, 1000);
        assert_eq!(
            segments(&tree),
            vec![
                Segment { start: 0, end: 4, ptr: 0 },
                Segment { start: 5, end: 44, ptr: 1000 },
                Segment { start: 45, end: 49, ptr: 25 },
            ]
        );
    }

    #[test]
    fn truncate_clips_and_drops() {
        let tree = SegTree::new();
        tree.add(0, 9, 0);
        tree.add(20, 29, 10);
        tree.truncate(25);
        assert_eq!(
            segments(&tree),
            vec![
                Segment { start: 0, end: 9, ptr: 0 },
                Segment { start: 20, end: 24, ptr: 10 },
            ]
        );
        tree.truncate(0);
        assert!(tree.read().is_empty());
    }

    #[test]
    fn clear_empties_the_tree() {
        let tree = SegTree::new();
        tree.add(0, 9, 0);
        tree.clear();
        assert!(tree.read().is_empty());
        tree.add(1, 2, 3);
        assert_eq!(tree.read().len(), 1);
    }

    proptest! {
        /// After an arbitrary add sequence the stored segments are pairwise
        /// disjoint and sorted, their union equals the union of all added
        /// ranges, and every covered byte resolves to the log position the
        /// most recent covering add would give it.
        #[test]
        fn adds_stay_disjoint_and_last_writer_wins(
            ops in proptest::collection::vec((0u64..500, 1u64..64), 1..40)
        ) {
            let tree = SegTree::new();
            let mut log_ptr = 0;
            let mut adds = Vec::new();
            for &(start, len) in &ops {
                let end = start + len - 1;
                tree.add(start, end, log_ptr);
                adds.push((start, end, log_ptr));
                log_ptr += len;
            }

            let stored = segments(&tree);
            for pair in stored.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }

            let resolve = |p: u64| {
                stored
                    .iter()
                    .find(|s| s.start <= p && p <= s.end)
                    .map(|s| s.ptr + (p - s.start))
            };
            for p in 0..600 {
                let expected = adds
                    .iter()
                    .rev()
                    .find(|&&(s, e, _)| s <= p && p <= e)
                    .map(|&(s, _, ptr)| ptr + (p - s));
                prop_assert_eq!(resolve(p), expected, "byte {}", p);
            }
        }
    }
}
