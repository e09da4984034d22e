//! The shared-memory read-reply region.
//!
//! Read replies do not travel over the RPC channel; the delegator writes them
//! into a fixed region both processes have mapped, and the client copies them
//! out into caller buffers. The region is a single-producer single-consumer
//! channel whose only synchronization word is the `state` flag:
//!
//! ```text
//! { state: u32, meta_count: u32 }
//! meta_count * { gfid: i32, offset: u64, length: u64, errcode: i32, payload[length] }
//! ```
//!
//! The producer fills the body, then publishes `FILLED` (or `DATA_COMPLETE`
//! for the final batch) with release ordering; the consumer observes the flag
//! with acquire ordering, drains the batch, and resets the flag to `EMPTY`.
//! The flag transition is therefore the fence that makes the delegator's
//! payload bytes visible to the client.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use thiserror::Error;

use crate::Gfid;

pub const STATE_EMPTY: u32 = 0;
pub const STATE_FILLED: u32 = 1;
pub const STATE_DATA_COMPLETE: u32 = 2;

/// Region header: `state` followed by `meta_count`, both `u32`.
pub const HEADER_LEN: usize = 8;
/// Serialized size of one [`ReplyHeader`].
pub const REPLY_HEADER_LEN: usize = 4 + 8 + 8 + 4;

/// `errcode` value of a successful reply.
pub const ERRCODE_OK: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Empty,
    Filled,
    /// Final batch: the delegator has no more data for the outstanding
    /// request after this one.
    DataComplete,
}

/// Header of one reply within the region body. The payload of `length`
/// bytes follows immediately, present even when `errcode` is non-zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyHeader {
    pub gfid: Gfid,
    pub offset: u64,
    pub length: u64,
    pub errcode: i32,
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("timed out waiting for the reply region to change state")]
    Timeout,
    #[error("reply region is not empty (state={0})")]
    Busy(u32),
    #[error("reply batch of {needed} bytes exceeds region capacity {capacity}")]
    Overflow { needed: usize, capacity: usize },
    #[error("malformed reply region contents: {0}")]
    Corrupt(&'static str),
}

/// An anonymous mapping holding the reply region.
///
/// In deployment the region lives in a named shared-memory segment created
/// by the mount launcher; an anonymous mapping has the identical layout and
/// serves a co-resident producer thread, which is all this crate needs to
/// promise. Producer and consumer both hold an `Arc` of the region; the
/// `state` protocol above keeps their access phases disjoint.
#[derive(Debug)]
pub struct ReplyRegion {
    ptr: *mut u8,
    len: usize,
    _map: MmapMut,
}

// Access is raw-pointer based and synchronized by the state flag protocol.
unsafe impl Send for ReplyRegion {}
unsafe impl Sync for ReplyRegion {}

impl ReplyRegion {
    /// Map a region with `capacity` bytes of reply body.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let len = HEADER_LEN + capacity;
        let mut map = MmapMut::map_anon(len)?;
        let ptr = map.as_mut_ptr();
        let region = Self { ptr, len, _map: map };
        region.state_word().store(STATE_EMPTY, Ordering::Release);
        Ok(region)
    }

    pub fn capacity(&self) -> usize {
        self.len - HEADER_LEN
    }

    fn state_word(&self) -> &AtomicU32 {
        // The mapping is page-aligned and outlives `self`.
        unsafe { AtomicU32::from_ptr(self.ptr.cast::<u32>()) }
    }

    fn count_word(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.ptr.add(4).cast::<u32>()) }
    }

    fn body(&self) -> *mut u8 {
        unsafe { self.ptr.add(HEADER_LEN) }
    }

    /// Hand the region back to the producer.
    ///
    /// The consumer must call this after draining every batch, and on every
    /// exit path out of a read call, or the producer will stall forever.
    pub fn set_empty(&self) {
        self.state_word().store(STATE_EMPTY, Ordering::Release);
    }

    /// Consumer side: block until the producer has published a batch.
    ///
    /// Polls the state word every `poll`, giving up after `timeout`.
    pub fn wait_filled(&self, timeout: Duration, poll: Duration) -> Result<RegionState, ShmError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state_word().load(Ordering::Acquire) {
                STATE_FILLED => return Ok(RegionState::Filled),
                STATE_DATA_COMPLETE => return Ok(RegionState::DataComplete),
                STATE_EMPTY => {
                    if Instant::now() >= deadline {
                        log::warn!("reply region still empty after {timeout:?}");
                        return Err(ShmError::Timeout);
                    }
                    thread::sleep(poll);
                }
                _ => return Err(ShmError::Corrupt("unknown state value")),
            }
        }
    }

    /// Producer side: block until the consumer has drained the last batch.
    pub fn wait_empty(&self, timeout: Duration, poll: Duration) -> Result<(), ShmError> {
        let deadline = Instant::now() + timeout;
        while self.state_word().load(Ordering::Acquire) != STATE_EMPTY {
            if Instant::now() >= deadline {
                return Err(ShmError::Timeout);
            }
            thread::sleep(poll);
        }
        Ok(())
    }

    /// Producer side: write one batch of replies and publish it.
    ///
    /// `complete` marks the final batch of the outstanding request. The
    /// region must be `EMPTY`; each reply's payload length must equal its
    /// header length (error replies carry a zero payload of that length).
    pub fn fill(&self, replies: &[(ReplyHeader, &[u8])], complete: bool) -> Result<(), ShmError> {
        let state = self.state_word().load(Ordering::Acquire);
        if state != STATE_EMPTY {
            return Err(ShmError::Busy(state));
        }

        let needed: usize = replies
            .iter()
            .map(|(h, _)| REPLY_HEADER_LEN + h.length as usize)
            .sum();
        if needed > self.capacity() {
            return Err(ShmError::Overflow {
                needed,
                capacity: self.capacity(),
            });
        }

        let mut cursor = 0;
        for (header, data) in replies {
            if data.len() != header.length as usize {
                return Err(ShmError::Corrupt("payload length disagrees with header"));
            }
            let mut buf = [0; REPLY_HEADER_LEN];
            buf[..4].copy_from_slice(&header.gfid.as_i32().to_ne_bytes());
            buf[4..12].copy_from_slice(&header.offset.to_ne_bytes());
            buf[12..20].copy_from_slice(&header.length.to_ne_bytes());
            buf[20..].copy_from_slice(&header.errcode.to_ne_bytes());
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), self.body().add(cursor), REPLY_HEADER_LEN);
                std::ptr::copy_nonoverlapping(data.as_ptr(), self.body().add(cursor + REPLY_HEADER_LEN), data.len());
            }
            cursor += REPLY_HEADER_LEN + data.len();
        }

        self.count_word().store(replies.len() as u32, Ordering::Relaxed);
        let state = if complete { STATE_DATA_COMPLETE } else { STATE_FILLED };
        self.state_word().store(state, Ordering::Release);
        Ok(())
    }

    /// Consumer side: iterate the replies of the current batch.
    ///
    /// Only valid between observing `FILLED`/`DATA_COMPLETE` and the next
    /// [`Self::set_empty`]; the borrow keeps the payload slices alive but it
    /// is the protocol, not the borrow checker, that keeps the producer out.
    pub fn replies(&self) -> Replies<'_> {
        Replies {
            region: self,
            remaining: self.count_word().load(Ordering::Relaxed) as usize,
            cursor: 0,
        }
    }
}

/// Borrowing cursor over one published batch.
pub struct Replies<'a> {
    region: &'a ReplyRegion,
    remaining: usize,
    cursor: usize,
}

impl<'a> Iterator for Replies<'a> {
    type Item = Result<(ReplyHeader, &'a [u8]), ShmError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let capacity = self.region.capacity();
        if self.cursor + REPLY_HEADER_LEN > capacity {
            self.remaining = 0;
            return Some(Err(ShmError::Corrupt("reply header past end of region")));
        }

        let mut buf = [0; REPLY_HEADER_LEN];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.body().add(self.cursor),
                buf.as_mut_ptr(),
                REPLY_HEADER_LEN,
            );
        }
        let mut offset = [0; 8];
        offset.copy_from_slice(&buf[4..12]);
        let mut length = [0; 8];
        length.copy_from_slice(&buf[12..20]);
        let header = ReplyHeader {
            gfid: Gfid::from_raw(i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])),
            offset: u64::from_ne_bytes(offset),
            length: u64::from_ne_bytes(length),
            errcode: i32::from_ne_bytes([buf[20], buf[21], buf[22], buf[23]]),
        };

        let payload_start = self.cursor + REPLY_HEADER_LEN;
        let payload_end = payload_start + header.length as usize;
        if payload_end > capacity {
            self.remaining = 0;
            return Some(Err(ShmError::Corrupt("reply payload past end of region")));
        }
        let payload = unsafe {
            std::slice::from_raw_parts(self.region.body().add(payload_start), header.length as usize)
        };
        self.cursor = payload_end;

        Some(Ok((header, payload)))
    }
}
