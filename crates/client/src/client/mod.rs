//! The operation surface: everything the interception shim routes here.

use std::io;
use std::sync::Arc;

use bitflags::bitflags;
use gustfs_logstore::Log;
use gustfs_proto::shm::ReplyRegion;
use gustfs_proto::{Delegator, Gfid};
use log::{debug, info, warn};

use crate::MountOptions;
use crate::error::{Error, Result};
use crate::fd::{Fd, FdTable, FileDesc};
use crate::file::{FileMeta, FileTable};
use crate::index::IndexBuffer;

mod read;
mod sync;
mod write;

pub use read::ListRead;

/// Longest path the file table accepts.
pub(crate) const MAX_PATH_LEN: usize = 128;

bitflags! {
    /// Open flags the client understands; a subset of `open(2)`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 1 << 0;
        const RDWR   = 1 << 1;
        const CREAT  = 1 << 2;
        const EXCL   = 1 << 3;
        const TRUNC  = 1 << 4;
        const APPEND = 1 << 5;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        self.contains(Self::RDWR) || !self.contains(Self::WRONLY)
    }

    pub fn writable(self) -> bool {
        self.intersects(Self::WRONLY | Self::RDWR)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// `posix_fadvise` advice values. All accepted ones are no-ops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advice {
    Normal,
    Sequential,
    Random,
    NoReuse,
    WillNeed,
    DontNeed,
}

/// What `stat` reports.
///
/// Non-laminated files report `size == 0`: they have no authoritative
/// global size yet. `rdev` carries `(log_size << 32) | (local_size &
/// 0xFFFFFFFF)` for local debugging when this process has the file open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub gfid: Gfid,
    pub mode: u32,
    pub size: u64,
    pub is_laminated: bool,
    pub rdev: u64,
}

/// A mounted burst-buffer client.
///
/// One instance per process, created at mount time and torn down by
/// [`Client::unmount`]. All process-wide state (descriptor pool, file
/// table, log store, index buffer, reply region) hangs off it; methods
/// take `&self` and are callable from any application thread.
pub struct Client {
    opts: MountOptions,
    log: Arc<Log>,
    files: FileTable,
    fds: FdTable,
    index: IndexBuffer,
    shm: Arc<ReplyRegion>,
    delegator: Arc<dyn Delegator>,
}

/// Normalize an absolute path: collapse duplicate and trailing slashes,
/// drop `.` components. `..` is rejected; the namespace is flat.
fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::InvalidArg);
    }
    let mut out = String::with_capacity(path.len());
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => return Err(Error::InvalidArg),
            comp => {
                out.push('/');
                out.push_str(comp);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

impl Client {
    pub fn mount(opts: MountOptions, delegator: Arc<dyn Delegator>) -> Result<Self> {
        let mount_prefix = normalize(&opts.mount_prefix)?;
        if mount_prefix == "/" {
            return Err(Error::InvalidArg);
        }
        let log = Arc::new(Log::open(opts.log.clone())?);
        let shm = Arc::new(ReplyRegion::new(opts.reply_capacity)?);
        info!(
            "mounted {mount_prefix} (slice width {} bytes, fd bias {})",
            opts.key_slice_width, opts.fd_limit
        );
        Ok(Self {
            files: FileTable::new(opts.max_files),
            fds: FdTable::new(opts.max_fds, opts.fd_limit),
            index: IndexBuffer::new(opts.index_capacity),
            log,
            shm,
            delegator,
            opts: MountOptions { mount_prefix, ..opts },
        })
    }

    /// Push whatever is still dirty to the delegator and tear down.
    pub fn unmount(self) -> Result<()> {
        let mut result = Ok(());
        for fid in self.files.dirty_fids() {
            if let Err(e) = self.sync_file(fid) {
                warn!("unmount: sync of {fid} failed: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        info!("unmounted {}", self.opts.mount_prefix);
        result
    }

    pub fn mount_prefix(&self) -> &str {
        &self.opts.mount_prefix
    }

    /// The reply region the delegator must attach to.
    pub fn reply_region(&self) -> &Arc<ReplyRegion> {
        &self.shm
    }

    /// The log store the delegator reads synced extents from.
    pub fn log_store(&self) -> &Arc<Log> {
        &self.log
    }

    /// Whether a path routes to this mount.
    pub fn is_client_path(&self, path: &str) -> bool {
        normalize(path).is_ok_and(|p| self.in_mount(&p))
    }

    /// Whether a raw descriptor value belongs to this client.
    pub fn is_client_fd(&self, raw_fd: usize) -> bool {
        self.fds.is_client_fd(raw_fd)
    }

    fn in_mount(&self, normalized: &str) -> bool {
        let prefix = &self.opts.mount_prefix;
        normalized == prefix
            || (normalized.starts_with(prefix.as_str()) && normalized.as_bytes()[prefix.len()] == b'/')
    }

    /// Normalize and validate a caller path.
    fn resolve(&self, path: &str) -> Result<String> {
        let norm = normalize(path)?;
        if norm.len() > MAX_PATH_LEN {
            return Err(Error::NameTooLong);
        }
        if !self.in_mount(&norm) {
            return Err(Error::InvalidArg);
        }
        Ok(norm)
    }

    // ---------------------------------------
    // open / close / seek
    // ---------------------------------------

    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Fd> {
        let path = self.resolve(path)?;
        let write = flags.writable();

        let fid = match self.files.lookup(&path) {
            Some(fid) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(Error::Exists);
                }
                let (is_dir, is_laminated) = self
                    .files
                    .get(fid, |m| (m.is_dir, m.is_laminated))
                    .ok_or(Error::NotFound)?;
                if is_dir && write {
                    return Err(Error::IsDir);
                }
                if is_laminated && write {
                    return Err(Error::ReadOnly);
                }
                if write && flags.contains(OpenFlags::TRUNC) {
                    self.truncate_fid(fid, 0)?;
                }
                fid
            }
            None if flags.contains(OpenFlags::CREAT) => self.create_file(path.clone(), mode)?,
            None => {
                // Not in the local table; another node may have created it.
                let gfid = Gfid::from_path(&path);
                let attr = match self.delegator.metaget(gfid) {
                    Ok(attr) => attr,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound),
                    Err(e) => return Err(Error::Io(e)),
                };
                if attr.is_dir() && write {
                    return Err(Error::IsDir);
                }
                if attr.is_laminated && write {
                    return Err(Error::ReadOnly);
                }
                self.files.create(FileMeta::from_attr(path.clone(), &attr))?
            }
        };

        let pos = if flags.contains(OpenFlags::APPEND) {
            self.files.get(fid, |m| m.local_size).ok_or(Error::NotFound)?
        } else {
            0
        };
        let fd = self.fds.alloc(FileDesc {
            fid,
            pos,
            read: flags.readable(),
            write,
            append: flags.contains(OpenFlags::APPEND),
        })?;
        debug!("open {path} flags={flags:?} -> {fd} ({fid})");
        Ok(fd)
    }

    /// `open(path, O_WRONLY | O_CREAT | O_TRUNC, mode)`.
    pub fn creat(&self, path: &str, mode: u32) -> Result<Fd> {
        self.open(
            path,
            OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC,
            mode,
        )
    }

    /// Create a local record and publish it globally.
    fn create_file(&self, path: String, mode: u32) -> Result<crate::file::Fid> {
        let gfid = Gfid::from_path(&path);
        let meta = FileMeta::new(path, gfid, mode & gustfs_proto::MODE_PERM_MASK, false);
        let attr = meta.attr();
        let fid = self.files.create(meta)?;
        if let Err(e) = self.delegator.set_meta(gfid, &attr) {
            self.files.remove(fid);
            return Err(Error::Io(e));
        }
        Ok(fid)
    }

    pub fn close(&self, fd: Fd) -> Result<()> {
        let desc = self.fds.get(fd)?;
        // Writers get an implicit fsync on their way out.
        let sync_result = if desc.write { self.fsync(fd) } else { Ok(()) };
        self.fds.free(fd)?;
        debug!("closed {fd}");
        sync_result
    }

    pub fn lseek(&self, fd: Fd, offset: i64, whence: Whence) -> Result<u64> {
        let desc = self.fds.get(fd)?;
        let logical = self
            .files
            .get(desc.fid, |m| m.logical_size())
            .ok_or(Error::BadFd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => desc.pos,
            Whence::End => logical,
        };
        // Seeking past EOF is fine; a negative result is not.
        let pos = base.checked_add_signed(offset).ok_or(Error::InvalidArg)?;
        self.fds.update(fd, |d| d.pos = pos)?;
        Ok(pos)
    }

    // ---------------------------------------
    // directory & path operations
    // ---------------------------------------

    /// Existence check against the local table; permissions are not
    /// enforced.
    pub fn access(&self, path: &str) -> Result<()> {
        let path = self.resolve(path)?;
        self.files.lookup(&path).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Record a directory entry. Entries are flat: the parent need not
    /// exist, and nothing is created on other nodes until files appear.
    pub fn mkdir(&self, path: &str, mode: u32) -> Result<()> {
        let path = self.resolve(path)?;
        if self.files.lookup(&path).is_some() {
            return Err(Error::Exists);
        }
        let gfid = Gfid::from_path(&path);
        let meta = FileMeta::new(path, gfid, mode & gustfs_proto::MODE_PERM_MASK, true);
        let attr = meta.attr();
        let fid = self.files.create(meta)?;
        if let Err(e) = self.delegator.set_meta(gfid, &attr) {
            self.files.remove(fid);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let path = self.resolve(path)?;
        if path == self.opts.mount_prefix {
            return Err(Error::Busy);
        }
        let fid = self.files.lookup(&path).ok_or(Error::NotFound)?;
        if !self.files.get(fid, |m| m.is_dir).ok_or(Error::NotFound)? {
            return Err(Error::NotDir);
        }
        if self.files.has_children(&path) {
            return Err(Error::NotEmpty);
        }
        self.files.remove(fid);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let path = self.resolve(path)?;
        let fid = self.files.lookup(&path).ok_or(Error::NotFound)?;
        let (is_dir, is_laminated, gfid) = self
            .files
            .get(fid, |m| (m.is_dir, m.is_laminated, m.gfid))
            .ok_or(Error::NotFound)?;
        if is_dir {
            return Err(Error::IsDir);
        }
        if is_laminated {
            // Lamination is terminal; the global copy outlives us.
            return Err(Error::ReadOnly);
        }
        if let Some(meta) = self.files.remove(fid) {
            meta.tree.clear();
        }
        // Log bytes the file owned become garbage; the log never shrinks.
        self.index.remove_gfid(gfid);
        debug!("unlinked {path} ({fid})");
        Ok(())
    }

    /// `remove(3)`: `unlink` that refuses directories.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.unlink(path)
    }

    pub fn rename(&self, oldpath: &str, newpath: &str) -> Result<()> {
        let old_ours = self.is_client_path(oldpath);
        let new_ours = self.is_client_path(newpath);
        if !old_ours && !new_ours {
            return Err(Error::InvalidArg);
        }
        if old_ours != new_ours {
            return Err(Error::CrossDevice);
        }
        let old = self.resolve(oldpath)?;
        let new = self.resolve(newpath)?;
        let fid = self.files.lookup(&old).ok_or(Error::NotFound)?;
        if old == new {
            return Ok(());
        }
        // Renaming over an existing entry replaces it.
        if self.files.lookup(&new).is_some() {
            self.unlink(&new).map_err(|e| {
                warn!("rename: could not replace {new}: {e}");
                Error::Busy
            })?;
        }
        let gfid = Gfid::from_path(&new);
        self.files.rename(fid, new.clone(), gfid)?;
        let attr = self.files.get(fid, |m| m.attr()).ok_or(Error::NotFound)?;
        self.delegator.set_meta(gfid, &attr)?;
        debug!("renamed {old} -> {new}");
        Ok(())
    }

    // ---------------------------------------
    // stat & friends
    // ---------------------------------------

    pub fn stat(&self, path: &str) -> Result<FileStatus> {
        let path = self.resolve(path)?;
        self.stat_resolved(&path)
    }

    pub fn fstat(&self, fd: Fd) -> Result<FileStatus> {
        let desc = self.fds.get(fd)?;
        let path = self
            .files
            .get(desc.fid, |m| m.path.clone())
            .ok_or(Error::BadFd)?;
        self.stat_resolved(&path)
    }

    fn stat_resolved(&self, path: &str) -> Result<FileStatus> {
        let gfid = Gfid::from_path(path);
        let attr = match self.delegator.metaget(gfid) {
            Ok(attr) => attr,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::NotFound),
            Err(e) => return Err(Error::Io(e)),
        };
        let rdev = self
            .files
            .lookup(path)
            .and_then(|fid| {
                self.files
                    .get(fid, |m| (m.log_size << 32) | (m.local_size & 0xFFFF_FFFF))
            })
            .unwrap_or(0);
        Ok(FileStatus {
            gfid,
            mode: attr.mode,
            // Non-laminated files have no trustworthy global size.
            size: if attr.is_laminated { attr.size } else { 0 },
            is_laminated: attr.is_laminated,
            rdev,
        })
    }

    pub fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let path = self.resolve(path)?;
        let fid = self.files.lookup(&path).ok_or(Error::NotFound)?;
        self.chmod_fid(fid, mode)
    }

    pub fn fchmod(&self, fd: Fd, mode: u32) -> Result<()> {
        let desc = self.fds.get(fd)?;
        self.chmod_fid(desc.fid, mode)
    }

    // ---------------------------------------
    // accepted no-ops and unsupported calls
    // ---------------------------------------

    /// Advisory locking is not provided; the call succeeds without effect.
    pub fn flock(&self, fd: Fd, _operation: i32) -> Result<()> {
        self.fds.get(fd)?;
        Ok(())
    }

    pub fn posix_fadvise(&self, fd: Fd, _offset: u64, _len: u64, advice: Advice) -> Result<()> {
        self.fds.get(fd)?;
        match advice {
            Advice::Normal
            | Advice::Sequential
            | Advice::Random
            | Advice::NoReuse
            | Advice::WillNeed => Ok(()),
            Advice::DontNeed => Err(Error::Unsupported),
        }
    }

    pub fn fdatasync(&self, _fd: Fd) -> Result<()> {
        Err(Error::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_and_rejects() {
        assert_eq!(normalize("/gust//a/").unwrap(), "/gust/a");
        assert_eq!(normalize("/gust/./b").unwrap(), "/gust/b");
        assert_eq!(normalize("/").unwrap(), "/");
        assert!(matches!(normalize("relative"), Err(Error::InvalidArg)));
        assert!(matches!(normalize("/gust/../x"), Err(Error::InvalidArg)));
    }
}
