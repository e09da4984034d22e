//! Types + impls useful for testing.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use gustfs_logstore::{Log, Store as _};
use gustfs_proto::shm::{ERRCODE_OK, ReplyHeader, ReplyRegion};
use gustfs_proto::{Delegator, Extent, FileAttr, Gfid, IndexEntry, extent};
use parking_lot::Mutex;

use crate::Client;

/// `errcode` the double reports for a gfid it has no extents for.
pub const ERRCODE_NOENT: i32 = 2;

pub fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

#[derive(Default)]
struct State {
    attrs: HashMap<Gfid, FileAttr>,
    /// Synced extents per file, in arrival order; later entries win.
    extents: HashMap<Gfid, Vec<IndexEntry>>,
    region: Option<Arc<ReplyRegion>>,
    log: Option<Arc<Log>>,
}

/// In-process delegator double.
///
/// Keeps the global index in a map, serves read payloads straight from the
/// client's log store, and delivers replies through the real reply region
/// from a producer thread, optionally reversed and in several batches to
/// exercise out-of-order assembly. Reads inside a laminated size that no
/// extent covers come back zero-filled, like any sparse region.
pub struct LocalDelegator {
    state: Mutex<State>,
    /// Replies per `FILLED` batch.
    batch: usize,
    /// Deliver each batch's replies in reverse request order.
    reverse: bool,
    /// Accept read RPCs but never produce replies.
    offline: AtomicBool,
}

impl LocalDelegator {
    pub fn new() -> Arc<Self> {
        Self::with_delivery(usize::MAX, false)
    }

    pub fn with_delivery(batch: usize, reverse: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            batch: batch.max(1),
            reverse,
            offline: AtomicBool::new(false),
        })
    }

    /// Wire the double to a mounted client's reply region and log store.
    pub fn attach(&self, client: &Client) {
        let mut state = self.state.lock();
        state.region = Some(Arc::clone(client.reply_region()));
        state.log = Some(Arc::clone(client.log_store()));
    }

    /// Simulate a dead producer: reads are accepted but never answered.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn resolve(state: &State, log: &Log, e: &Extent) -> (ReplyHeader, Vec<u8>) {
        let mut errcode = ERRCODE_OK;
        let mut data = vec![0; e.length as usize];
        match state.extents.get(&e.gfid) {
            None => errcode = ERRCODE_NOENT,
            Some(entries) => {
                for entry in entries {
                    let start = entry.file_offset.max(e.offset);
                    let end = (entry.file_offset + entry.length).min(e.offset + e.length);
                    if start < end {
                        let len = (end - start) as usize;
                        let log_off = entry.log_offset + (start - entry.file_offset);
                        let dst = (start - e.offset) as usize;
                        if log.read_at(log_off, &mut data[dst..dst + len]).is_err() {
                            errcode = 5;
                        }
                    }
                }
            }
        }
        (
            ReplyHeader {
                gfid: e.gfid,
                offset: e.offset,
                length: e.length,
                errcode,
            },
            data,
        )
    }

    fn serve(&self, extents: Vec<Extent>) -> io::Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            return Ok(());
        }
        let (region, mut replies) = {
            let state = self.state.lock();
            let region = state
                .region
                .clone()
                .ok_or_else(|| io::Error::other("delegator not attached"))?;
            let log = state.log.clone().ok_or_else(|| io::Error::other("delegator not attached"))?;
            let replies: Vec<_> = extents.iter().map(|e| Self::resolve(&state, &log, e)).collect();
            (region, replies)
        };
        if self.reverse {
            replies.reverse();
        }

        let batch = self.batch;
        thread::spawn(move || {
            let timeout = Duration::from_secs(10);
            let poll = Duration::from_micros(50);
            let mut chunks = replies.chunks(batch).peekable();
            while let Some(chunk) = chunks.next() {
                if region.wait_empty(timeout, poll).is_err() {
                    return;
                }
                let borrowed: Vec<(ReplyHeader, &[u8])> =
                    chunk.iter().map(|(h, d)| (*h, d.as_slice())).collect();
                let complete = chunks.peek().is_none();
                if region.fill(&borrowed, complete).is_err() {
                    return;
                }
            }
        });
        Ok(())
    }
}

impl Delegator for LocalDelegator {
    fn metaget(&self, gfid: Gfid) -> io::Result<FileAttr> {
        self.state
            .lock()
            .attrs
            .get(&gfid)
            .copied()
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn filesize(&self, gfid: Gfid) -> io::Result<u64> {
        let state = self.state.lock();
        Ok(state
            .extents
            .get(&gfid)
            .and_then(|es| es.iter().map(|e| e.file_offset + e.length).max())
            .unwrap_or(0))
    }

    fn sync(&self, _gfid: Gfid, entries: &[IndexEntry]) -> io::Result<()> {
        let mut state = self.state.lock();
        for entry in entries {
            state.extents.entry(entry.gfid).or_default().push(*entry);
        }
        Ok(())
    }

    fn read(&self, gfid: Gfid, offset: u64, length: u64) -> io::Result<()> {
        self.serve(vec![Extent {
            gfid,
            offset,
            length,
        }])
    }

    fn mread(&self, count: usize, extents: &[u8]) -> io::Result<()> {
        let decoded = extent::decode(extents).map_err(io::Error::other)?;
        if decoded.len() != count {
            return Err(io::Error::other("extent count mismatch"));
        }
        self.serve(decoded)
    }

    fn set_meta(&self, gfid: Gfid, attr: &FileAttr) -> io::Result<()> {
        self.state.lock().attrs.insert(gfid, *attr);
        Ok(())
    }
}
