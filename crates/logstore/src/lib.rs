//! Append-only byte log with a single monotonically increasing offset.
//!
//! Writes land in a bounded in-memory region first; once an append no longer
//! fits there, the log freezes a watermark and routes all further bytes into
//! a spill file. Reads at `(offset, length)` are served transparently from
//! either tier, splitting at the watermark when a range straddles it.
//!
//! The log is never rewritten or compacted. Callers that stop referencing a
//! range simply leave it behind; that is the price of `append` being a
//! single offset bump.

use std::io;

use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;

mod mem;
mod spill;

pub use mem::Memory;
pub use spill::SpillFile;

/// A tier of the log: an appendable, randomly readable byte store.
pub trait Store {
    /// Append `buf`, returning the store-relative offset it was written at.
    fn append(&self, buf: &[u8]) -> Result<u64, Error>;

    /// Fill `buf` from `offset`. The full range must have been written.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Flush written bytes to stable storage.
    fn sync(&self) -> Result<(), Error>;

    /// Bytes appended so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("log store exhausted: {needed} bytes requested, {available} available")]
    Full { needed: u64, available: u64 },
    #[error("read of [{offset}, {offset}+{len}) past log end {end}")]
    OutOfBounds { offset: u64, len: u64, end: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// [`Log`] options.
#[derive(Clone, Debug)]
pub struct Options {
    /// Capacity of the in-memory tier.
    ///
    /// Default: 64 MiB
    pub memory_capacity: usize,
    /// Directory to create the spill file in, or `None` to run memory-only.
    ///
    /// Default: `None`
    pub spill_dir: Option<std::path::PathBuf>,
    /// Maximum size of the spill file.
    ///
    /// Default: 1 GiB
    pub spill_capacity: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            memory_capacity: 64 << 20,
            spill_dir: None,
            spill_capacity: 1 << 30,
        }
    }
}

#[derive(Debug)]
struct Head {
    /// Next log offset to hand out.
    len: u64,
    /// Log offset at which the memory tier was frozen; everything at or
    /// above it lives in the spill file. `None` while memory still accepts
    /// appends.
    watermark: Option<u64>,
}

/// The two-tier log.
///
/// Appends serialize on the head lock; reads only take the per-tier read
/// paths and may run concurrently with appends to other offsets.
#[derive(Debug)]
pub struct Log {
    mem: Memory,
    spill: Option<SpillFile>,
    head: Mutex<Head>,
}

impl Log {
    pub fn open(opts: Options) -> Result<Self, Error> {
        let spill = match &opts.spill_dir {
            Some(dir) => {
                info!("spill enabled in {} ({} bytes)", dir.display(), opts.spill_capacity);
                Some(SpillFile::create(dir, opts.spill_capacity)?)
            }
            None => None,
        };
        Ok(Self {
            mem: Memory::new(opts.memory_capacity),
            spill,
            head: Mutex::new(Head {
                len: 0,
                watermark: None,
            }),
        })
    }

    /// Log offset of the memory/spill boundary, if spilling has begun.
    pub fn watermark(&self) -> Option<u64> {
        self.head.lock().watermark
    }

    /// The spill tier. Only reachable once a watermark exists, which in turn
    /// requires the tier to have been configured.
    fn spill(&self) -> Result<&SpillFile, Error> {
        self.spill
            .as_ref()
            .ok_or_else(|| Error::Io(io::Error::other("watermark set but no spill tier")))
    }
}

impl Store for Log {
    fn append(&self, buf: &[u8]) -> Result<u64, Error> {
        let mut head = self.head.lock();
        let offset = head.len;

        match head.watermark {
            None => {
                if self.mem.fits(buf.len()) {
                    self.mem.append(buf)?;
                } else {
                    // Freeze the memory tier; this and all later appends go
                    // to spill. The watermark never moves again.
                    let spill = self.spill.as_ref().ok_or(Error::Full {
                        needed: buf.len() as u64,
                        available: self.mem.remaining() as u64,
                    })?;
                    debug!("memory tier exhausted, spilling from offset {offset}");
                    spill.append(buf)?;
                    head.watermark = Some(offset);
                }
            }
            Some(_) => {
                self.spill()?.append(buf)?;
            }
        }

        head.len += buf.len() as u64;
        Ok(offset)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let (len, watermark) = {
            let head = self.head.lock();
            (head.len, head.watermark)
        };
        let end = offset + buf.len() as u64;
        if end > len {
            return Err(Error::OutOfBounds {
                offset,
                len: buf.len() as u64,
                end: len,
            });
        }

        match watermark {
            None => self.mem.read_at(offset, buf),
            Some(w) if end <= w => self.mem.read_at(offset, buf),
            Some(w) if offset >= w => self.spill()?.read_at(offset - w, buf),
            Some(w) => {
                // Straddles the watermark.
                let head_len = (w - offset) as usize;
                let (front, back) = buf.split_at_mut(head_len);
                self.mem.read_at(offset, front)?;
                self.spill()?.read_at(0, back)
            }
        }
    }

    fn sync(&self) -> Result<(), Error> {
        // Only the spill tier has anything to make durable.
        match &self.spill {
            Some(spill) => spill.sync(),
            None => Ok(()),
        }
    }

    fn len(&self) -> u64 {
        self.head.lock().len
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn mem_only(capacity: usize) -> Log {
        Log::open(Options {
            memory_capacity: capacity,
            ..Options::default()
        })
        .unwrap()
    }

    #[test]
    fn append_returns_monotonic_offsets() {
        let log = mem_only(1024);
        assert_eq!(log.append(b"abc").unwrap(), 0);
        assert_eq!(log.append(b"defg").unwrap(), 3);
        assert_eq!(log.len(), 7);

        let mut buf = [0; 4];
        log.read_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"defg");
    }

    #[test]
    fn read_past_end_is_rejected() {
        let log = mem_only(1024);
        log.append(b"abc").unwrap();
        let mut buf = [0; 4];
        assert!(matches!(
            log.read_at(0, &mut buf),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn memory_exhaustion_without_spill_is_full() {
        let log = mem_only(8);
        log.append(b"12345678").unwrap();
        assert!(matches!(log.append(b"x"), Err(Error::Full { .. })));
    }

    #[test]
    fn appends_overflow_into_spill() {
        let dir = tempfile::tempdir().unwrap();
        let log = Log::open(Options {
            memory_capacity: 8,
            spill_dir: Some(dir.path().to_path_buf()),
            spill_capacity: 1024,
        })
        .unwrap();

        assert_eq!(log.append(b"abcdef").unwrap(), 0);
        // Would fit byte-wise only partially; goes to spill wholesale.
        assert_eq!(log.append(b"ghijkl").unwrap(), 6);
        assert_eq!(log.watermark(), Some(6));
        // Later small appends stay in spill even though memory has room.
        assert_eq!(log.append(b"mn").unwrap(), 12);

        let mut buf = [0; 14];
        log.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefghijklmn");

        // A read straddling the watermark.
        let mut buf = [0; 4];
        log.read_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"efgh");

        log.sync().unwrap();
    }
}
