//! Contracts shared between a GustFS client and its co-located delegator.
//!
//! The delegator is an external process: it maintains the global extent index
//! and serves cross-node reads. Everything the two sides agree on lives here,
//! so that neither links against the other's internals: global file ids and
//! attributes, the extent-vector serialization used by multi-extent read
//! requests, and the shared-memory region through which read replies flow
//! back to the client.

use std::fmt;

mod delegator;
pub mod extent;
pub mod shm;

pub use delegator::Delegator;
pub use extent::Extent;

/// Global file id: a deterministic hash of the normalized absolute path.
///
/// Stable across processes and nodes, which is what allows the delegator to
/// key its index without ever seeing the client's local file table. The
/// wire representation is a non-negative `i32`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gfid(i32);

impl Gfid {
    /// Derive the gfid for `path`.
    ///
    /// The caller is responsible for normalizing the path first; two spellings
    /// of the same file must hash identically.
    pub fn from_path(path: &str) -> Self {
        let digest = blake3::hash(path.as_bytes());
        let b = digest.as_bytes();
        let raw = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        // Mask the sign bit so the id survives languages that treat it as signed.
        Self(raw & i32::MAX)
    }

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gfid:{}", self.0)
    }
}

/// Directory bit within [`FileAttr::mode`], matching `S_IFDIR`.
pub const MODE_DIR: u32 = 0o040000;
/// The three write permission bits. Clearing all of them on a writable file
/// is the lamination trigger.
pub const MODE_WRITE_BITS: u32 = 0o222;
/// Mask of the permission bits proper.
pub const MODE_PERM_MASK: u32 = 0o777;

/// Global metadata record for one file, as stored by the delegator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileAttr {
    pub gfid: Gfid,
    /// Type and permission bits (`MODE_DIR` | rwx).
    pub mode: u32,
    /// Authoritative size. Only meaningful once `is_laminated` is set;
    /// non-laminated files have no trustworthy global size.
    pub size: u64,
    pub is_laminated: bool,
}

impl FileAttr {
    pub fn is_dir(&self) -> bool {
        self.mode & MODE_DIR != 0
    }
}

/// One written extent, as shipped to the delegator on sync.
///
/// `log_offset` points into the client's log store; the delegator reads the
/// payload bytes from there when serving the extent to another node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub gfid: Gfid,
    /// Logical offset within the file.
    pub file_offset: u64,
    /// Offset of the payload within the client's log store.
    pub log_offset: u64,
    pub length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gfid_is_deterministic_and_non_negative() {
        let a = Gfid::from_path("/gust/data/checkpoint.0");
        let b = Gfid::from_path("/gust/data/checkpoint.0");
        assert_eq!(a, b);
        assert!(a.as_i32() >= 0);
        assert_ne!(a, Gfid::from_path("/gust/data/checkpoint.1"));
    }
}
