//! The range-based read path.
//!
//! A read-list call goes through five steps: canonical ordering, splitting
//! at server key-slice boundaries, RPC dispatch, draining the shared-memory
//! reply region, and matching each reply back onto the user requests it
//! covers. Replies arrive in any order and in any batching; the only
//! guarantee is that each byte is delivered at most once.

use std::io;

use gustfs_proto::Gfid;
use gustfs_proto::extent::{self, Extent};
use gustfs_proto::shm::{ERRCODE_OK, RegionState, ReplyHeader};
use log::{trace, warn};
use scopeguard::defer;

use super::Client;
use crate::error::{Error, Result};
use crate::fd::{Fd, FileDesc};

/// One entry of a list read (the `lio_listio` surface): fill `buf` from
/// `offset` of the file behind `fd`.
pub struct ListRead<'a> {
    pub fd: Fd,
    pub offset: u64,
    pub buf: &'a mut [u8],
}

/// In-flight user request. Lives for one read call.
struct ReadReq<'a> {
    gfid: Gfid,
    offset: u64,
    length: u64,
    errcode: i32,
    buf: &'a mut [u8],
}

impl ReadReq<'_> {
    /// Inclusive end offset.
    fn end(&self) -> u64 {
        self.offset + self.length - 1
    }
}

impl Client {
    /// Read at the descriptor position, advancing it by the bytes returned.
    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> Result<usize> {
        let desc = self.fds.get(fd)?;
        let n = self.read_desc(&desc, desc.pos, buf)?;
        self.fds.update(fd, |d| d.pos += n as u64)?;
        Ok(n)
    }

    /// Positional read; the descriptor position is untouched.
    pub fn pread(&self, fd: Fd, buf: &mut [u8], offset: u64) -> Result<usize> {
        let desc = self.fds.get(fd)?;
        self.read_desc(&desc, offset, buf)
    }

    /// Scattering read through the scalar path; stops at the first short
    /// read. A failure after some slices were filled reports the bytes that
    /// made it.
    pub fn readv(&self, fd: Fd, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs.iter_mut() {
            match self.read(fd, buf) {
                Ok(n) => {
                    total += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if total == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(total)
    }

    fn read_desc(&self, desc: &FileDesc, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if !desc.read {
            return Err(Error::BadFd);
        }
        let (gfid, is_dir, is_laminated, global_size) = self
            .files
            .get(desc.fid, |m| {
                (m.gfid, m.is_dir, m.is_laminated, m.global_size)
            })
            .ok_or(Error::BadFd)?;
        if is_dir {
            return Err(Error::IsDir);
        }
        if pos.checked_add(buf.len() as u64).is_none_or(|e| e > i64::MAX as u64) {
            return Err(Error::Overflow);
        }

        let mut count = buf.len() as u64;
        if is_laminated {
            // Laminated files have a trustworthy size; clamp at EOF. For
            // everything else the request goes out as-is and EOF is
            // best-effort.
            count = count.min(global_size.saturating_sub(pos));
        }
        if count == 0 {
            return Ok(0);
        }

        let mut req = ReadReq {
            gfid,
            offset: pos,
            length: count,
            errcode: ERRCODE_OK,
            buf: &mut buf[..count as usize],
        };
        match self.read_many(std::slice::from_mut(&mut req))? {
            true => Ok(count as usize),
            false if req.errcode != ERRCODE_OK => Err(Error::Io(io::Error::other(format!(
                "delegator read failed (errcode {})",
                req.errcode
            )))),
            // Nothing came back but nothing failed outright: treat as EOF,
            // which is the best a non-laminated file can offer.
            false => Ok(0),
        }
    }

    /// Read many ranges in one delegator round trip.
    pub fn read_list(&self, list: &mut [ListRead<'_>]) -> Result<()> {
        let mut reqs = Vec::with_capacity(list.len());
        for entry in list.iter_mut() {
            let desc = self.fds.get(entry.fd)?;
            if !desc.read {
                return Err(Error::BadFd);
            }
            let (gfid, is_dir, is_laminated, global_size) = self
                .files
                .get(desc.fid, |m| {
                    (m.gfid, m.is_dir, m.is_laminated, m.global_size)
                })
                .ok_or(Error::BadFd)?;
            if is_dir {
                return Err(Error::IsDir);
            }
            let len = entry.buf.len() as u64;
            if entry.offset.checked_add(len).is_none_or(|e| e > i64::MAX as u64) {
                return Err(Error::Overflow);
            }
            let count = if is_laminated {
                len.min(global_size.saturating_sub(entry.offset))
            } else {
                len
            };
            if count == 0 {
                continue;
            }
            reqs.push(ReadReq {
                gfid,
                offset: entry.offset,
                length: count,
                errcode: ERRCODE_OK,
                buf: &mut entry.buf[..count as usize],
            });
        }
        match self.read_many(&mut reqs)? {
            true => Ok(()),
            false => Err(Error::Io(io::Error::other("one or more list reads failed"))),
        }
    }

    /// The read-list engine. Returns whether every reply applied cleanly;
    /// per-request failures are recorded in the requests' `errcode`.
    fn read_many(&self, reqs: &mut [ReadReq<'_>]) -> Result<bool> {
        if reqs.is_empty() {
            return Ok(true);
        }

        // Step A: canonical order, (gfid, offset) ascending.
        reqs.sort_by_key(|r| (r.gfid, r.offset));

        // Step B: split at key-slice boundaries.
        let mut subs = Vec::new();
        for r in reqs.iter() {
            split_request(
                r.gfid,
                r.offset,
                r.length,
                self.opts.key_slice_width,
                self.opts.max_read_count,
                &mut subs,
            )?;
        }
        trace!("read-list: {} requests -> {} sub-requests", reqs.len(), subs.len());

        // Step C: dispatch. Hand the region to the producer first, and make
        // sure it is handed back on every exit path below.
        self.shm.set_empty();
        defer! {
            self.shm.set_empty();
        }
        if let [only] = subs.as_slice() {
            self.delegator.read(only.gfid, only.offset, only.length)?;
        } else {
            let encoded = extent::encode(&subs);
            self.delegator.mread(subs.len(), &encoded)?;
        }

        // Step D: drain reply batches until the delegator says it is done.
        let mut clean = true;
        loop {
            let state = self
                .shm
                .wait_filled(self.opts.shm_timeout, self.opts.shm_poll)?;
            for reply in self.shm.replies() {
                match reply {
                    Ok((hdr, payload)) => {
                        if hdr.errcode != ERRCODE_OK {
                            clean = false;
                        }
                        let payload = (hdr.errcode == ERRCODE_OK).then_some(payload);
                        if let Err(e) = match_reply(reqs, &hdr, payload) {
                            warn!(
                                "dropping reply [{}, {}+{}) of {}: {e}",
                                hdr.offset, hdr.offset, hdr.length, hdr.gfid
                            );
                            clean = false;
                        }
                    }
                    Err(e) => {
                        warn!("corrupt reply region: {e}");
                        clean = false;
                    }
                }
            }
            let done = state == RegionState::DataComplete;
            self.shm.set_empty();
            if done {
                break;
            }
        }
        Ok(clean)
    }
}

/// Split `[offset, offset+length)` of `gfid` at every multiple of
/// `slice_width` it crosses, appending the pieces to `out`. Fails without
/// partial dispatch if `out` would exceed `max`.
fn split_request(
    gfid: Gfid,
    mut offset: u64,
    length: u64,
    slice_width: u64,
    max: usize,
    out: &mut Vec<Extent>,
) -> Result<()> {
    let mut remaining = length;
    while remaining > 0 {
        let slice_end = (offset / slice_width + 1) * slice_width;
        let take = remaining.min(slice_end - offset);
        if out.len() >= max {
            return Err(Error::Overflow);
        }
        out.push(Extent {
            gfid,
            offset,
            length: take,
        });
        offset += take;
        remaining -= take;
    }
    Ok(())
}

/// Index of the request whose `(gfid, offset)` is the greatest not above
/// the target, or `None` if the target sorts before everything.
fn locate(reqs: &[ReadReq<'_>], gfid: Gfid, offset: u64) -> Option<usize> {
    reqs.partition_point(|r| (r.gfid, r.offset) <= (gfid, offset))
        .checked_sub(1)
}

/// Apply one reply to the sorted request list.
///
/// `payload` is `None` for replies carrying an error code, in which case
/// the code is propagated to every request the reply touches and nothing is
/// copied. Fails with [`Error::MatchMiss`] when no request contains the
/// reply and [`Error::MatchGap`] when it spans requests that are not
/// byte-contiguous.
fn match_reply(reqs: &mut [ReadReq<'_>], hdr: &ReplyHeader, payload: Option<&[u8]>) -> Result<()> {
    if hdr.length == 0 {
        return Ok(());
    }
    let end_off = hdr.offset + hdr.length - 1;

    let start_pos = locate(reqs, hdr.gfid, hdr.offset).ok_or(Error::MatchMiss)?;
    if reqs[start_pos].gfid != hdr.gfid || hdr.offset > reqs[start_pos].end() {
        return Err(Error::MatchMiss);
    }

    // Reply fully inside a single request.
    if end_off <= reqs[start_pos].end() {
        let first = &mut reqs[start_pos];
        match payload {
            Some(data) => {
                let dst = (hdr.offset - first.offset) as usize;
                first.buf[dst..dst + data.len()].copy_from_slice(data);
            }
            None => first.errcode = hdr.errcode,
        }
        return Ok(());
    }

    // Reply spans several requests; they must form a contiguous byte range.
    let end_pos = locate(reqs, hdr.gfid, end_off).ok_or(Error::MatchMiss)?;
    if reqs[end_pos].gfid != hdr.gfid || end_off > reqs[end_pos].end() {
        return Err(Error::MatchMiss);
    }
    for i in start_pos + 1..=end_pos {
        if reqs[i].gfid != hdr.gfid || reqs[i - 1].offset + reqs[i - 1].length != reqs[i].offset {
            return Err(Error::MatchGap);
        }
    }

    match payload {
        None => {
            for r in &mut reqs[start_pos..=end_pos] {
                r.errcode = hdr.errcode;
            }
        }
        Some(data) => {
            let mut src = 0;
            // Head bytes land mid-way into the first request.
            let first = &mut reqs[start_pos];
            let dst = (hdr.offset - first.offset) as usize;
            let head = (first.end() - hdr.offset + 1) as usize;
            first.buf[dst..dst + head].copy_from_slice(&data[..head]);
            src += head;
            // Whole middle requests.
            for r in &mut reqs[start_pos + 1..end_pos] {
                let n = r.length as usize;
                r.buf[..n].copy_from_slice(&data[src..src + n]);
                src += n;
            }
            // Tail bytes start exactly at the last request's offset.
            let last = &mut reqs[end_pos];
            let tail = (end_off - last.offset + 1) as usize;
            last.buf[..tail].copy_from_slice(&data[src..src + tail]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const MIB: u64 = 1 << 20;

    fn gfid(n: i32) -> Gfid {
        Gfid::from_raw(n)
    }

    fn split(gfid_: i32, offset: u64, length: u64, width: u64) -> Vec<Extent> {
        let mut out = Vec::new();
        split_request(gfid(gfid_), offset, length, width, 1024, &mut out).unwrap();
        out
    }

    #[test]
    fn split_within_one_slice_is_identity() {
        let subs = split(1, 100, 200, MIB);
        assert_eq!(
            subs,
            vec![Extent {
                gfid: gfid(1),
                offset: 100,
                length: 200
            }]
        );
    }

    #[test]
    fn split_at_slice_boundaries() {
        // [(A, 0, 512K), (A, 1.5M, 1M), (B, 0, 3M)] with 1 MiB slices
        // yields 1 + 2 + 3 = 6 sub-requests.
        let mut subs = split(1, 0, 512 << 10, MIB);
        subs.extend(split(1, 3 * MIB / 2, MIB, MIB));
        subs.extend(split(2, 0, 3 * MIB, MIB));
        assert_eq!(subs.len(), 6);
        assert_eq!(
            subs[1..3],
            [
                Extent { gfid: gfid(1), offset: 3 * MIB / 2, length: MIB / 2 },
                Extent { gfid: gfid(1), offset: 2 * MIB, length: MIB / 2 },
            ]
        );
        for sub in &subs {
            assert!(sub.offset / MIB == (sub.offset + sub.length - 1) / MIB);
        }
    }

    #[test]
    fn split_overflow_fails_whole_call() {
        let mut out = Vec::new();
        let err = split_request(gfid(1), 0, 10 * MIB, MIB, 4, &mut out).unwrap_err();
        assert!(matches!(err, Error::Overflow));
    }

    proptest! {
        #[test]
        fn split_is_idempotent_on_aligned_lists(
            offset in 0u64..(8 << 20),
            length in 1u64..(8 << 20),
            width_pow in 12u32..22,
        ) {
            let width = 1u64 << width_pow;
            let first = split(3, offset, length, width);
            let again: Vec<Extent> = first
                .iter()
                .flat_map(|e| split(3, e.offset, e.length, width))
                .collect();
            prop_assert_eq!(first, again);
        }
    }

    fn reqs_for<'a>(ranges: &[(i32, u64)], bufs: &'a mut [Vec<u8>]) -> Vec<ReadReq<'a>> {
        ranges
            .iter()
            .zip(bufs.iter_mut())
            .map(|(&(g, offset), buf)| ReadReq {
                gfid: gfid(g),
                offset,
                length: buf.len() as u64,
                errcode: ERRCODE_OK,
                buf: buf.as_mut_slice(),
            })
            .collect()
    }

    fn hdr(g: i32, offset: u64, length: u64) -> ReplyHeader {
        ReplyHeader {
            gfid: gfid(g),
            offset,
            length,
            errcode: ERRCODE_OK,
        }
    }

    #[test]
    fn reply_inside_single_request() {
        let mut bufs = vec![vec![0; 10]];
        let mut reqs = reqs_for(&[(1, 100)], &mut bufs);
        match_reply(&mut reqs, &hdr(1, 103, 4), Some(b"WXYZ")).unwrap();
        drop(reqs);
        assert_eq!(&bufs[0], b"\0\0\0WXYZ\0\0\0");
    }

    #[test]
    fn reply_spanning_contiguous_requests() {
        let mut bufs = vec![vec![0; 4], vec![0; 4], vec![0; 4]];
        let mut reqs = reqs_for(&[(1, 0), (1, 4), (1, 8)], &mut bufs);
        // Covers the tail of the first, all of the second, the head of the
        // third.
        match_reply(&mut reqs, &hdr(1, 2, 8), Some(b"abcdefgh")).unwrap();
        drop(reqs);
        assert_eq!(&bufs[0], b"\0\0ab");
        assert_eq!(&bufs[1], b"cdef");
        assert_eq!(&bufs[2], b"gh\0\0");
    }

    #[test]
    fn reply_across_gap_is_rejected() {
        let mut bufs = vec![vec![0; 4], vec![0; 4]];
        let mut reqs = reqs_for(&[(1, 0), (1, 8)], &mut bufs);
        let err = match_reply(&mut reqs, &hdr(1, 2, 8), Some(&[0; 8])).unwrap_err();
        assert!(matches!(err, Error::MatchGap));
        drop(reqs);
        assert_eq!(&bufs[0], &[0; 4], "no partial copy on a gap");
    }

    #[test]
    fn unmatched_reply_is_a_miss() {
        let mut bufs = vec![vec![0; 4]];
        let mut reqs = reqs_for(&[(1, 100)], &mut bufs);
        assert!(matches!(
            match_reply(&mut reqs, &hdr(1, 0, 4), Some(&[0; 4])),
            Err(Error::MatchMiss)
        ));
        assert!(matches!(
            match_reply(&mut reqs, &hdr(2, 100, 4), Some(&[0; 4])),
            Err(Error::MatchMiss)
        ));
    }

    #[test]
    fn error_reply_poisons_touched_requests_only() {
        let mut bufs = vec![vec![0; 4], vec![0; 4], vec![0; 4]];
        let mut reqs = reqs_for(&[(1, 0), (1, 4), (1, 8)], &mut bufs);
        let reply = ReplyHeader {
            errcode: 5,
            ..hdr(1, 0, 8)
        };
        match_reply(&mut reqs, &reply, None).unwrap();
        assert_eq!(reqs[0].errcode, 5);
        assert_eq!(reqs[1].errcode, 5);
        assert_eq!(reqs[2].errcode, ERRCODE_OK);
    }
}
