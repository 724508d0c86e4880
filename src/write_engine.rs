//! Outbound PDU queueing with scatter/gather writes.
//!
//! Each connection owns one engine. Complete PDUs wait on the `to_write`
//! FIFO; a flush gathers up to [`MAX_IOV`] segment slices across queued PDUs
//! into one vectored write and rewinds cursors on partial success, so the
//! transport sees exactly the concatenation of PDUs in enqueue order no
//! matter how the writes are cut.
//!
//! PDUs that elicited or await acknowledgement are retained after their bytes
//! drain: a response stays linked to the inbound request that caused it
//! (a retransmitted request re-emits its responses without reprocessing), and
//! an ARQ data frame stays retained until its sequence number is acked.

use crate::pdu::{LocalPduCache, PduBuf};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::io::{ErrorKind, IoSlice};
use std::ops::Range;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

/// Upper bound on gather segments per vectored write; the system `IOV_MAX`
/// clamped into 16..=32.
pub const MAX_IOV: usize = 16;

pub type RequestId = u64;

/// Abstraction for pushing gathered byte chunks at a transport, introduced to
/// facilitate mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WireWriter: Send + 'static {
    /// Write as much of `chunks` (in order) as the transport accepts,
    /// returning the byte count. `WouldBlock` pauses the caller.
    async fn write_chunks<'a>(&mut self, chunks: &[&'a [u8]]) -> std::io::Result<usize>;
}

#[async_trait]
impl WireWriter for tokio::net::tcp::OwnedWriteHalf {
    async fn write_chunks<'a>(&mut self, chunks: &[&'a [u8]]) -> std::io::Result<usize> {
        let slices: Vec<IoSlice> = chunks.iter().map(|c| IoSlice::new(c)).collect();
        self.write_vectored(&slices).await
    }
}

/// Retention semantics of an outbound PDU.
pub enum PduKind {
    Plain,
    /// A response to the inbound request with this id; retained with it once
    /// written, released when the request is acknowledged.
    Response { to: RequestId },
    /// Retained after writing until explicitly released (ARQ data frames).
    AwaitAck { id: RequestId },
}

struct QueuedPdu {
    buf: PduBuf,
    /// 1..=3 gather segments (header / payload / CRC trailer) as spans into
    /// the arena.
    segs: Vec<Range<usize>>,
    written: usize,
    kind: PduKind,
}

impl QueuedPdu {
    fn total(&self) -> usize {
        self.segs.iter().map(|s| s.len()).sum()
    }

    fn wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total());
        for seg in &self.segs {
            out.extend_from_slice(&self.buf.as_ref()[seg.clone()]);
        }
        out
    }
}

pub struct WriteEngine<W: WireWriter> {
    writer: W,
    cache: LocalPduCache,
    to_write: VecDeque<QueuedPdu>,
    /// Inbound requests whose responses must be retained. Present key with
    /// empty vec = request seen, no response written yet.
    linked_responses: FxHashMap<RequestId, Vec<Vec<u8>>>,
    /// Own PDUs awaiting acknowledgement, by id.
    awaiting_ack: FxHashMap<RequestId, Vec<u8>>,
    pub n_written: u64,
    pub n_pdu_out: u64,
}

impl<W: WireWriter> WriteEngine<W> {
    pub fn new(writer: W, cache: LocalPduCache) -> WriteEngine<W> {
        WriteEngine {
            writer,
            cache,
            to_write: VecDeque::new(),
            linked_responses: FxHashMap::default(),
            awaiting_ack: FxHashMap::default(),
            n_written: 0,
            n_pdu_out: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.to_write.is_empty()
    }

    /// Queue an encoded PDU whose gather segments are spans into `buf`.
    pub fn enqueue(&mut self, buf: PduBuf, segs: Vec<Range<usize>>, kind: PduKind) {
        debug_assert!(!segs.is_empty() && segs.len() <= 3);
        debug_assert!(segs.iter().all(|s| s.end <= buf.len()));
        self.to_write.push_back(QueuedPdu {
            buf,
            segs,
            written: 0,
            kind,
        });
    }

    /// Queue a PDU that is already a single contiguous byte run.
    pub fn enqueue_bytes(&mut self, data: &[u8], kind: PduKind) {
        let segs = vec![0..data.len()];
        self.enqueue_segmented(data, segs, kind);
    }

    /// Queue encoded bytes whose gather segments are spans into `data`.
    pub fn enqueue_segmented(&mut self, data: &[u8], segs: Vec<Range<usize>>, kind: PduKind) {
        let mut buf = self.cache.get();
        let n = buf.fill(data);
        debug_assert_eq!(n, data.len(), "outbound pdu exceeds arena capacity");
        self.enqueue(buf, segs, kind);
    }

    /// Note an inbound request whose responses must be retained for re-emit.
    pub fn open_request(&mut self, id: RequestId) {
        self.linked_responses.entry(id).or_default();
    }

    /// The inbound request was acknowledged: release it and every linked
    /// response.
    pub fn release_request(&mut self, id: RequestId) {
        self.linked_responses.remove(&id);
    }

    /// The peer retransmitted a request we already processed: re-emit the
    /// retained responses instead of reprocessing.
    pub fn reemit_responses(&mut self, id: RequestId) -> usize {
        let Some(responses) = self.linked_responses.get(&id) else {
            return 0;
        };
        let copies: Vec<Vec<u8>> = responses.clone();
        for bytes in &copies {
            self.enqueue_bytes(bytes, PduKind::Plain);
        }
        copies.len()
    }

    /// Release a retained own PDU (its acknowledgement arrived).
    pub fn release_own(&mut self, id: RequestId) {
        self.awaiting_ack.remove(&id);
    }

    /// Requeue a retained own PDU for retransmission. Returns false if it is
    /// no longer retained.
    pub fn retransmit_own(&mut self, id: RequestId) -> bool {
        let Some(bytes) = self.awaiting_ack.get(&id) else {
            return false;
        };
        let copy = bytes.clone();
        self.enqueue_bytes(&copy, PduKind::Plain);
        true
    }

    /// Release every queued and retained PDU. Called when the connection
    /// closes on error.
    pub fn drain(&mut self) {
        while let Some(q) = self.to_write.pop_front() {
            self.cache.put(q.buf);
        }
        self.linked_responses.clear();
        self.awaiting_ack.clear();
    }

    /// Push queued bytes at the transport until everything is written
    /// (`Ok(true)`), the transport would block (`Ok(false)`, connection stays
    /// write-armed), or a fatal error occurs (the caller closes and drains).
    pub async fn flush(&mut self) -> std::io::Result<bool> {
        loop {
            if self.to_write.is_empty() {
                return Ok(true);
            }

            let mut chunks: Vec<&[u8]> = Vec::new();
            'gather: for q in &self.to_write {
                let mut skip = q.written;
                for seg in &q.segs {
                    let seg_bytes = &q.buf.as_ref()[seg.clone()];
                    if skip >= seg_bytes.len() {
                        skip -= seg_bytes.len();
                        continue;
                    }
                    chunks.push(&seg_bytes[skip..]);
                    skip = 0;
                    if chunks.len() == MAX_IOV {
                        break 'gather;
                    }
                }
            }

            match self.writer.write_chunks(&chunks).await {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "transport accepted no bytes",
                    ))
                }
                Ok(n) => {
                    trace!("wrote {} of {} gathered bytes", n, chunks.iter().map(|c| c.len()).sum::<usize>());
                    drop(chunks);
                    self.n_written += n as u64;
                    self.advance(n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!("transport would block, pausing write");
                    return Ok(false);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let front = self
                .to_write
                .front_mut()
                .expect("transport wrote more bytes than were queued");
            let remaining = front.total() - front.written;
            if n < remaining {
                front.written += n;
                return;
            }
            n -= remaining;
            let q = self.to_write.pop_front().expect("front vanished");
            self.complete(q);
        }
    }

    fn complete(&mut self, q: QueuedPdu) {
        self.n_pdu_out += 1;
        match q.kind {
            PduKind::Plain => {}
            PduKind::Response { to } => {
                if let Some(responses) = self.linked_responses.get_mut(&to) {
                    responses.push(q.wire_bytes());
                } else {
                    debug!("response written for request #{} that is no longer retained", to);
                }
            }
            PduKind::AwaitAck { id } => {
                self.awaiting_ack.insert(id, q.wire_bytes());
            }
        }
        self.cache.put(q.buf);
    }
}
