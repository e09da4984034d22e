use std::io;

use crate::{FileAttr, Gfid, IndexEntry};

/// The RPC surface the delegator offers to a client.
///
/// This is a seam, not an implementation: deployments back it with the real
/// RPC stubs, tests with an in-process double. Errors use [`io::Result`] with
/// the usual [`io::ErrorKind`] conventions; in particular a lookup of an
/// unknown gfid must return [`io::ErrorKind::NotFound`].
///
/// `read` and `mread` only *initiate* a read: the data itself arrives through
/// the shared-memory [`ReplyRegion`](crate::shm::ReplyRegion), possibly in
/// several batches and in any order.
pub trait Delegator: Send + Sync {
    /// Fetch the global metadata record for `gfid`.
    fn metaget(&self, gfid: Gfid) -> io::Result<FileAttr>;

    /// Fetch the authoritative global size of `gfid`.
    ///
    /// Called once per file, at the lamination transition.
    fn filesize(&self, gfid: Gfid) -> io::Result<u64>;

    /// Register the client's written extents with the global index.
    ///
    /// `entries` is the client's index buffer, sorted by `(gfid,
    /// file_offset)`. On success the client may reuse the buffer; on failure
    /// it must keep the entries for a later retry.
    fn sync(&self, gfid: Gfid, entries: &[IndexEntry]) -> io::Result<()>;

    /// Initiate a single-extent read.
    fn read(&self, gfid: Gfid, offset: u64, length: u64) -> io::Result<()>;

    /// Initiate a multi-extent read. `extents` is a length-prefixed extent
    /// vector as produced by [`extent::encode`](crate::extent::encode), with
    /// `count` entries.
    fn mread(&self, count: usize, extents: &[u8]) -> io::Result<()>;

    /// Upsert the global metadata record for `gfid`.
    fn set_meta(&self, gfid: Gfid, attr: &FileAttr) -> io::Result<()>;
}
