//! Extent-vector serialization for multi-extent read requests.
//!
//! The vector is a flat, length-prefixed buffer: a `u32` count followed by
//! `count` tuples of `(gfid: i32, offset: u64, length: u64)`. Client and
//! delegator are co-resident, so fields use native endianness.

use thiserror::Error;

use crate::Gfid;

/// One sub-request of a sliced read: a byte range of a single file, bounded
/// within one server key slice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub gfid: Gfid,
    pub offset: u64,
    pub length: u64,
}

/// Serialized size of one extent tuple.
pub const EXTENT_LEN: usize = 4 + 8 + 8;
/// Serialized size of the count prefix.
pub const COUNT_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("extent vector truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("extent vector count {count} disagrees with buffer length {len}")]
    CountMismatch { count: usize, len: usize },
}

/// Serialize `extents` into a fresh length-prefixed buffer.
pub fn encode(extents: &[Extent]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(COUNT_LEN + extents.len() * EXTENT_LEN);
    buf.extend_from_slice(&(extents.len() as u32).to_ne_bytes());
    for e in extents {
        buf.extend_from_slice(&e.gfid.as_i32().to_ne_bytes());
        buf.extend_from_slice(&e.offset.to_ne_bytes());
        buf.extend_from_slice(&e.length.to_ne_bytes());
    }
    buf
}

/// Parse a buffer produced by [`encode`].
pub fn decode(buf: &[u8]) -> Result<Vec<Extent>, CodecError> {
    let Some(prefix) = buf.get(..COUNT_LEN) else {
        return Err(CodecError::Truncated {
            expected: COUNT_LEN,
            actual: buf.len(),
        });
    };
    let count = u32::from_ne_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    let body = &buf[COUNT_LEN..];
    if body.len() != count * EXTENT_LEN {
        return Err(CodecError::CountMismatch {
            count,
            len: body.len(),
        });
    }

    let mut extents = Vec::with_capacity(count);
    for tuple in body.chunks_exact(EXTENT_LEN) {
        let gfid = i32::from_ne_bytes([tuple[0], tuple[1], tuple[2], tuple[3]]);
        let mut offset = [0; 8];
        offset.copy_from_slice(&tuple[4..12]);
        let mut length = [0; 8];
        length.copy_from_slice(&tuple[12..20]);
        extents.push(Extent {
            gfid: Gfid::from_raw(gfid),
            offset: u64::from_ne_bytes(offset),
            length: u64::from_ne_bytes(length),
        });
    }
    Ok(extents)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trip() {
        let extents = vec![
            Extent {
                gfid: Gfid::from_raw(7),
                offset: 0,
                length: 512 << 10,
            },
            Extent {
                gfid: Gfid::from_raw(7),
                offset: 3 << 20,
                length: 1 << 20,
            },
        ];
        assert_eq!(extents, decode(&encode(&extents)).unwrap());
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(decode(&[]), Err(CodecError::Truncated { .. })));

        let mut buf = encode(&[Extent {
            gfid: Gfid::from_raw(1),
            offset: 0,
            length: 1,
        }]);
        buf.pop();
        assert!(matches!(decode(&buf), Err(CodecError::CountMismatch { .. })));
    }
}
