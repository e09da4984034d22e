//! Descriptor table: a fixed pool of slots handed out from a free-stack.
//!
//! Returned descriptor values are biased by the configured `fd_limit` so
//! they can never collide with kernel descriptors the application also
//! holds; anything at or above the bias belongs to us.

use std::fmt;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::file::Fid;

/// A client file descriptor. The wrapped value is already biased.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fd(usize);

impl Fd {
    pub fn raw(self) -> usize {
        self.0
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// Per-descriptor state. `pos` is the user-visible file position; the
/// positional read/write variants leave it alone.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FileDesc {
    pub fid: Fid,
    pub pos: u64,
    pub read: bool,
    pub write: bool,
    /// Forces the effective position to the file's local size on each write.
    pub append: bool,
}

struct Slots {
    descs: Vec<Option<FileDesc>>,
    free: Vec<usize>,
}

pub(crate) struct FdTable {
    slots: Mutex<Slots>,
    fd_limit: usize,
}

impl FdTable {
    pub fn new(max_fds: usize, fd_limit: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                descs: vec![None; max_fds],
                // Stacked so that slot 0 pops first.
                free: (0..max_fds).rev().collect(),
            }),
            fd_limit,
        }
    }

    /// Whether a raw descriptor value belongs to this table.
    pub fn is_client_fd(&self, raw: usize) -> bool {
        raw >= self.fd_limit
    }

    fn slot(&self, fd: Fd) -> Result<usize> {
        fd.0.checked_sub(self.fd_limit).ok_or(Error::BadFd)
    }

    pub fn alloc(&self, desc: FileDesc) -> Result<Fd> {
        let mut slots = self.slots.lock();
        let slot = slots.free.pop().ok_or(Error::FdExhausted)?;
        slots.descs[slot] = Some(desc);
        Ok(Fd(slot + self.fd_limit))
    }

    pub fn free(&self, fd: Fd) -> Result<FileDesc> {
        let slot = self.slot(fd)?;
        let mut slots = self.slots.lock();
        let desc = slots
            .descs
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(Error::BadFd)?;
        slots.free.push(slot);
        Ok(desc)
    }

    pub fn get(&self, fd: Fd) -> Result<FileDesc> {
        let slot = self.slot(fd)?;
        self.slots
            .lock()
            .descs
            .get(slot)
            .copied()
            .flatten()
            .ok_or(Error::BadFd)
    }

    pub fn update<R>(&self, fd: Fd, f: impl FnOnce(&mut FileDesc) -> R) -> Result<R> {
        let slot = self.slot(fd)?;
        let mut slots = self.slots.lock();
        slots
            .descs
            .get_mut(slot)
            .and_then(Option::as_mut)
            .map(f)
            .ok_or(Error::BadFd)
    }
}
