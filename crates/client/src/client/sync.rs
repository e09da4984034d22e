//! Sync and lamination: publishing written extents to the delegator, and
//! the one-way transition that freezes a file.

use std::sync::Arc;

use gustfs_logstore::Store as _;
use gustfs_proto::MODE_WRITE_BITS;
use log::{debug, info};

use super::Client;
use crate::error::{Error, Result};
use crate::fd::Fd;
use crate::file::Fid;
use crate::index;

impl Client {
    /// Register this descriptor's file, and whatever else the index buffer
    /// holds, with the delegator's global index.
    pub fn fsync(&self, fd: Fd) -> Result<()> {
        let desc = self.fds.get(fd)?;
        if self.index.is_empty() {
            // Nothing to sync.
            return Ok(());
        }
        let needs_sync = self
            .files
            .get(desc.fid, |m| m.needs_sync)
            .ok_or(Error::BadFd)?;
        if !needs_sync {
            return Ok(());
        }
        self.sync_file(desc.fid)
    }

    /// The sync sequence proper: spill fsync, optional flatten, sync RPC,
    /// buffer reset. On RPC failure the buffer is preserved so the
    /// application can retry.
    pub(crate) fn sync_file(&self, fid: Fid) -> Result<()> {
        let (gfid, tree) = self
            .files
            .get(fid, |m| (m.gfid, Arc::clone(&m.tree)))
            .ok_or(Error::BadFd)?;

        // Spill bytes must be durable before the delegator learns of them.
        self.log.sync()?;

        let mut entries = self.index.lock();
        if self.opts.flatten_writes {
            entries.retain(|e| e.gfid != gfid);
            entries.extend(index::flatten(gfid, &tree));
        }
        entries.sort_unstable_by_key(|e| (e.gfid, e.file_offset));
        debug!("sync {fid} ({gfid}): {} entries", entries.len());
        self.delegator.sync(gfid, &entries)?;

        // The delegator has consumed the batch.
        entries.clear();
        drop(entries);
        if self.opts.flatten_writes {
            tree.clear();
        }
        self.files.update(fid, |m| m.needs_sync = false);
        Ok(())
    }

    /// The shared tail of `chmod`/`fchmod`.
    ///
    /// A mode change that clears every write bit on a writable file is the
    /// lamination trigger: fetch the authoritative global size, freeze the
    /// file, then push the new metadata.
    pub(crate) fn chmod_fid(&self, fid: Fid, mode: u32) -> Result<()> {
        let (gfid, is_laminated, old_mode) = self
            .files
            .get(fid, |m| (m.gfid, m.is_laminated, m.mode))
            .ok_or(Error::NotFound)?;
        if is_laminated {
            return Err(Error::ReadOnly);
        }

        let laminating =
            (old_mode & MODE_WRITE_BITS) != 0 && (old_mode & MODE_WRITE_BITS & mode) == 0;
        if laminating {
            let size = self.delegator.filesize(gfid)?;
            self.files.update(fid, |m| {
                m.global_size = size;
                m.is_laminated = true;
            });
            info!("laminated {fid} ({gfid}) at size {size}");
        }

        let attr = self
            .files
            .update(fid, |m| {
                m.mode = (m.mode & !gustfs_proto::MODE_PERM_MASK)
                    | (mode & gustfs_proto::MODE_PERM_MASK);
                m.attr()
            })
            .ok_or(Error::NotFound)?;
        self.delegator.set_meta(gfid, &attr)?;
        Ok(())
    }
}
