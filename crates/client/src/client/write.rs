//! The log-structured write path: every write becomes a log append, a
//! segment-tree update, and an index-buffer entry.

use std::sync::Arc;

use gustfs_logstore::Store as _;
use gustfs_proto::IndexEntry;
use log::{debug, trace};

use super::Client;
use crate::error::{Error, Result};
use crate::fd::Fd;
use crate::file::Fid;

impl Client {
    /// Write at the descriptor position (or the end, for append-mode
    /// descriptors), advancing the position past the written bytes.
    pub fn write(&self, fd: Fd, buf: &[u8]) -> Result<usize> {
        let desc = self.fds.get(fd)?;
        if !desc.write {
            return Err(Error::BadFd);
        }
        let pos = if desc.append {
            self.files
                .get(desc.fid, |m| m.local_size)
                .ok_or(Error::BadFd)?
        } else {
            desc.pos
        };
        let written = self.write_fid(desc.fid, pos, buf)?;
        self.fds.update(fd, |d| d.pos = pos + written as u64)?;
        Ok(written)
    }

    /// Positional write; the descriptor position is untouched.
    pub fn pwrite(&self, fd: Fd, buf: &[u8], offset: u64) -> Result<usize> {
        let desc = self.fds.get(fd)?;
        if !desc.write {
            return Err(Error::BadFd);
        }
        self.write_fid(desc.fid, offset, buf)
    }

    /// Gathering write through the scalar path. A failure after some slices
    /// were written reports the bytes that made it.
    pub fn writev(&self, fd: Fd, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            match self.write(fd, buf) {
                Ok(n) => total += n,
                Err(e) if total == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(total)
    }

    fn write_fid(&self, fid: Fid, pos: u64, buf: &[u8]) -> Result<usize> {
        let count = buf.len() as u64;
        let (gfid, is_dir, is_laminated, tree) = self
            .files
            .get(fid, |m| (m.gfid, m.is_dir, m.is_laminated, Arc::clone(&m.tree)))
            .ok_or(Error::BadFd)?;
        if is_dir {
            return Err(Error::InvalidArg);
        }
        if is_laminated {
            return Err(Error::ReadOnly);
        }
        if count == 0 {
            return Ok(0);
        }
        // The file offset domain is the signed off_t range.
        let end = pos.checked_add(count).ok_or(Error::Overflow)?;
        if end > i64::MAX as u64 {
            return Err(Error::Overflow);
        }

        // Make room in the index buffer before touching the tree, so an
        // inline flush cannot double-ship the segment we are about to add.
        if self.index.is_full() {
            debug!("index buffer full, syncing inline for {fid}");
            self.sync_file(fid)?;
        }

        let log_offset = self.log.append(buf)?;
        tree.add(pos, end - 1, log_offset);
        if !self.index.push(IndexEntry {
            gfid,
            file_offset: pos,
            log_offset,
            length: count,
        }) {
            return Err(Error::OutOfMemory);
        }

        self.files
            .update(fid, |m| {
                m.local_size = m.local_size.max(end);
                m.log_size += count;
                m.needs_sync = true;
            })
            .ok_or(Error::BadFd)?;
        trace!("{fid} wrote [{pos}, {end}) at log {log_offset}");
        Ok(buf.len())
    }

    pub fn truncate(&self, path: &str, length: u64) -> Result<()> {
        let path = self.resolve(path)?;
        let fid = self.files.lookup(&path).ok_or(Error::NotFound)?;
        self.truncate_fid(fid, length)
    }

    /// `ftruncate` requires a writable descriptor.
    pub fn ftruncate(&self, fd: Fd, length: u64) -> Result<()> {
        let desc = self.fds.get(fd)?;
        if !desc.write {
            return Err(Error::BadFd);
        }
        self.truncate_fid(desc.fid, length)
    }

    pub(crate) fn truncate_fid(&self, fid: Fid, length: u64) -> Result<()> {
        let (gfid, is_dir, is_laminated, tree) = self
            .files
            .get(fid, |m| (m.gfid, m.is_dir, m.is_laminated, Arc::clone(&m.tree)))
            .ok_or(Error::BadFd)?;
        if is_dir {
            return Err(Error::IsDir);
        }
        if is_laminated {
            return Err(Error::ReadOnly);
        }
        // The log keeps the cut bytes; only the indexes forget them.
        tree.truncate(length);
        self.index.truncate_gfid(gfid, length);
        self.files
            .update(fid, |m| {
                m.local_size = length;
                m.needs_sync = true;
            })
            .ok_or(Error::BadFd)?;
        debug!("truncated {fid} to {length}");
        Ok(())
    }
}
