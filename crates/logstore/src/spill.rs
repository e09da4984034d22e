use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;
use parking_lot::Mutex;

use crate::{Error, Store};

/// The spill tier: a bounded scratch file for bytes that no longer fit in
/// memory.
///
/// The file is an unlinked temporary in the configured spill directory, so
/// an aborted client leaves nothing behind. Reads use positional I/O and
/// never touch the write head.
#[derive(Debug)]
pub struct SpillFile {
    file: File,
    head: Mutex<u64>,
    capacity: u64,
}

impl SpillFile {
    pub fn create(dir: &Path, capacity: u64) -> Result<Self, Error> {
        let file = tempfile::tempfile_in(dir)?;
        debug!("created spill file in {} ({capacity} bytes)", dir.display());
        Ok(Self {
            file,
            head: Mutex::new(0),
            capacity,
        })
    }
}

impl Store for SpillFile {
    fn append(&self, buf: &[u8]) -> Result<u64, Error> {
        let mut head = self.head.lock();
        if *head + buf.len() as u64 > self.capacity {
            return Err(Error::Full {
                needed: buf.len() as u64,
                available: self.capacity - *head,
            });
        }
        self.file.write_all_at(buf, *head)?;
        let offset = *head;
        *head += buf.len() as u64;
        Ok(offset)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let written = *self.head.lock();
        if offset + buf.len() as u64 > written {
            return Err(Error::OutOfBounds {
                offset,
                len: buf.len() as u64,
                end: written,
            });
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> u64 {
        *self.head.lock()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn write_read_sync() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpillFile::create(dir.path(), 64).unwrap();

        assert_eq!(spill.append(b"hello ").unwrap(), 0);
        assert_eq!(spill.append(b"spill").unwrap(), 6);

        let mut buf = [0; 11];
        spill.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello spill");

        spill.sync().unwrap();
    }

    #[test]
    fn capacity_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let spill = SpillFile::create(dir.path(), 4).unwrap();
        assert!(matches!(spill.append(b"12345"), Err(Error::Full { .. })));
    }
}
