//! GustFS client: a user-space burst-buffer file system.
//!
//! File operations on paths under the configured mount prefix are routed to
//! an in-process log-structured store: an append-only byte log indexed by
//! per-file segment trees. A co-located delegator process keeps the
//! global extent index and serves reads across nodes. The interception shim
//! that rewrites POSIX symbols sits above this crate; here every operation
//! is a method on [`Client`] returning a structured [`Error`] that the shim
//! maps to `errno` via [`Error::errno`].
//!
//! Files are written locally, published with `fsync`, and frozen by
//! *lamination*: a `chmod` that clears all write bits fetches the
//! authoritative global size and makes the file permanently read-only.
//! Until lamination a file has no trustworthy global size.

use std::time::Duration;

mod client;
mod error;
mod fd;
mod file;
mod index;
pub mod seg_tree;
#[cfg(any(test, feature = "test"))]
pub mod testing;

pub use client::{Advice, Client, FileStatus, ListRead, OpenFlags, Whence};
pub use error::{Error, Result};
pub use fd::Fd;
pub use gustfs_proto::{Delegator, FileAttr, Gfid};

/// [`Client`] options.
#[derive(Clone, Debug)]
pub struct MountOptions {
    /// Path prefix under which operations are intercepted.
    ///
    /// Default: `/gust`
    pub mount_prefix: String,
    /// Descriptor bias: values handed out by the client start here, so they
    /// never collide with kernel descriptors below the limit.
    ///
    /// Default: 1024
    pub fd_limit: usize,
    /// Size of the descriptor pool.
    ///
    /// Default: 256
    pub max_fds: usize,
    /// Size of the local file table.
    ///
    /// Default: 512
    pub max_files: usize,
    /// Entries the index buffer holds before a write forces an inline sync.
    ///
    /// Default: 4096
    pub index_capacity: usize,
    /// Width of the delegator's key slices. Reads are split so that no
    /// sub-request crosses a slice boundary.
    ///
    /// Default: 1 MiB
    pub key_slice_width: u64,
    /// Maximum sub-requests a single read-list call may expand into.
    ///
    /// Default: 1024
    pub max_read_count: usize,
    /// Ship the coalesced segment trees on sync instead of the raw write
    /// history, and clear the trees afterwards.
    ///
    /// Default: true
    pub flatten_writes: bool,
    /// How long a read waits for the delegator to fill the reply region.
    ///
    /// Default: 5 s
    pub shm_timeout: Duration,
    /// Poll interval while waiting on the reply region's state flag.
    ///
    /// Default: 50 µs
    pub shm_poll: Duration,
    /// Body capacity of the reply region.
    ///
    /// Default: 4 MiB
    pub reply_capacity: usize,
    /// Log store configuration (memory tier size, spill file).
    pub log: gustfs_logstore::Options,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            mount_prefix: "/gust".to_owned(),
            fd_limit: 1024,
            max_fds: 256,
            max_files: 512,
            index_capacity: 4096,
            key_slice_width: 1 << 20,
            max_read_count: 1024,
            flatten_writes: true,
            shm_timeout: Duration::from_secs(5),
            shm_poll: Duration::from_micros(50),
            reply_capacity: 4 << 20,
            log: gustfs_logstore::Options::default(),
        }
    }
}
