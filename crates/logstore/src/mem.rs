use parking_lot::RwLock;

use crate::{Error, Store};

/// The in-memory tier: a bounded, append-only byte buffer.
///
/// Appends take the write lock; reads of already-written ranges take the
/// read lock and may run while an append grows the buffer.
#[derive(Debug)]
pub struct Memory {
    buf: RwLock<Vec<u8>>,
    capacity: usize,
}

impl Memory {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub(crate) fn fits(&self, len: usize) -> bool {
        self.buf.read().len() + len <= self.capacity
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.buf.read().len()
    }
}

impl Store for Memory {
    fn append(&self, buf: &[u8]) -> Result<u64, Error> {
        let mut inner = self.buf.write();
        if inner.len() + buf.len() > self.capacity {
            return Err(Error::Full {
                needed: buf.len() as u64,
                available: (self.capacity - inner.len()) as u64,
            });
        }
        let offset = inner.len() as u64;
        inner.extend_from_slice(buf);
        Ok(offset)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        let inner = self.buf.read();
        let start = offset as usize;
        let Some(src) = inner.get(start..start + buf.len()) else {
            return Err(Error::OutOfBounds {
                offset,
                len: buf.len() as u64,
                end: inner.len() as u64,
            });
        };
        buf.copy_from_slice(src);
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buf.read().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_enforced() {
        let mem = Memory::new(4);
        mem.append(b"abc").unwrap();
        assert!(mem.fits(1));
        assert!(!mem.fits(2));
        assert!(matches!(mem.append(b"de"), Err(Error::Full { .. })));
        // The failed append must not have consumed anything.
        assert_eq!(mem.len(), 3);
        mem.append(b"d").unwrap();
    }
}
