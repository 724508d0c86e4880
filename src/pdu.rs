//! Reusable fixed-capacity PDU buffers and their pool.
//!
//! A `PduBuf` is the quantum of I/O: a pre-allocated arena that a connection
//! fills from its socket and that the protocol decoders parse in place. The
//! `need` field is the contract between buffer and read engine: it holds the
//! number of bytes the decoder requires before it can make progress, and a
//! fresh buffer starts with `need = 1` so the read engine schedules the
//! initial read.
//!
//! Buffers come from a two-tier pool: a global free list under a short mutex,
//! fronted by a per-connection cache that pulls batches on miss and spills
//! back once it exceeds its high-water mark.

use bytes::buf::UninitSlice;
use std::borrow::Borrow;
use std::fmt::{Debug, Formatter};
use std::sync::Mutex;
use tracing::{debug, trace};

/// Arena capacity. Large enough for the biggest SIS PDU (8192 bytes); DTS
/// frames are far smaller.
pub const PDU_MEM: usize = 8192;

/// How many buffers a cache miss pulls from the global pool in one lock.
const CACHE_BATCH: usize = 8;

#[derive(Eq)]
pub struct PduBuf {
    buf: Vec<u8>,
    len: usize,
    /// Parser cursor, owned by the protocol decoder.
    pub scan: usize,
    /// Total on-wire length of the PDU once the decoder has determined it.
    pub pdu_len: Option<usize>,
    /// Bytes required before the decoder can make progress; 0 means the PDU
    /// is complete and must not drive further I/O.
    pub need: usize,
}

impl PduBuf {
    pub fn new(capacity: usize) -> PduBuf {
        PduBuf {
            buf: vec![0; capacity],
            len: 0,
            scan: 0,
            pdu_len: None,
            need: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn space(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.scan = 0;
        self.pdu_len = None;
        self.need = 1;
    }

    /// Append raw bytes from the transport. Returns how many fit.
    pub fn fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.space());
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// Convenience for test code: a buffer pre-filled from a slice.
    #[cfg(test)]
    pub fn from_slice(data: &[u8]) -> PduBuf {
        let mut buf = PduBuf::new(PDU_MEM);
        buf.fill(data);
        buf
    }
}

impl PartialEq for PduBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref().eq(other.as_ref())
    }
}

impl Debug for PduBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl Borrow<[u8]> for PduBuf {
    fn borrow(&self) -> &[u8] {
        self.as_ref()
    }
}

impl AsRef<[u8]> for PduBuf {
    fn as_ref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl AsMut<[u8]> for PduBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

unsafe impl bytes::BufMut for PduBuf {
    fn remaining_mut(&self) -> usize {
        self.buf.len() - self.len
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(self.len + cnt <= self.capacity());
        self.len += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        UninitSlice::new(&mut self.buf[self.len..])
    }
}

/// Global free list. Cache misses and overflow go through here; the common
/// path stays on the per-connection cache.
pub struct PduPool {
    buf_size: usize,
    buffers: Mutex<Vec<PduBuf>>,
}

impl PduPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        PduPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> PduBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        PduBuf::new(self.buf_size)
    }

    /// Pull up to `n` free buffers in one lock acquisition. May return fewer
    /// (including none) if the free list is short.
    pub fn get_batch(&self, n: usize) -> Vec<PduBuf> {
        let mut buffers = self.buffers.lock().unwrap();
        let take = n.min(buffers.len());
        let split_at = buffers.len() - take;
        buffers.split_off(split_at)
    }

    pub fn return_to_pool(&self, mut buffer: PduBuf) {
        assert_eq!(
            buffer.capacity(),
            self.buf_size,
            "returned buffer does not have the regular capacity of {} bytes",
            self.buf_size
        );

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}

/// Per-connection front of the pool. Never shared; the owning task is the
/// only accessor, so gets and puts are lock-free until the cache runs dry or
/// overflows.
pub struct LocalPduCache {
    pool: std::sync::Arc<PduPool>,
    cache: Vec<PduBuf>,
    high_water: usize,
}

impl LocalPduCache {
    pub fn new(pool: std::sync::Arc<PduPool>, high_water: usize) -> LocalPduCache {
        LocalPduCache {
            pool,
            cache: Vec::with_capacity(high_water),
            high_water,
        }
    }

    pub fn get(&mut self) -> PduBuf {
        if let Some(buf) = self.cache.pop() {
            return buf;
        }
        let mut batch = self.pool.get_batch(CACHE_BATCH);
        match batch.pop() {
            Some(buf) => {
                self.cache = batch;
                buf
            }
            None => self.pool.get_from_pool(),
        }
    }

    pub fn put(&mut self, mut buf: PduBuf) {
        if self.cache.len() < self.high_water {
            buf.clear();
            self.cache.push(buf);
        } else {
            self.pool.return_to_pool(buf);
        }
    }
}
