//! Socket-to-PDU boundary assembly.
//!
//! The read engine knows nothing about any protocol's framing. The coupling
//! point is the current PDU's `need` field: the engine invokes the decoder
//! whenever at least `need` bytes are buffered, and the decoder either raises
//! `need` or declares the PDU finished. Because the decoder is only ever
//! asked the same question with strictly more bytes, the sequence of finished
//! PDUs is independent of how the transport chunks its reads.
//!
//! When a finished PDU ran longer than its self-declared length, the surplus
//! bytes are the start of the next PDU and are copied into a fresh buffer
//! that becomes current. A finished PDU of declared length zero is refused -
//! it would split forever.

use crate::pdu::{LocalPduCache, PduBuf};
use tracing::debug;

/// What a decoder learned from one look at the current PDU.
pub enum DecodeOutcome {
    /// Cannot decode yet; call again once this many bytes are buffered.
    /// Must be strictly greater than what is already buffered.
    Need(usize),
    /// PDU fully parsed and its events emitted; release it.
    Consumed,
    /// PDU is well-framed but semantically unusable; release it silently.
    Discard(&'static str),
    /// The byte stream is unrecoverable; close the connection.
    Close(&'static str),
}

/// A protocol's framing logic. Decoders are synchronous and never suspend;
/// all I/O stays in the engine.
pub trait ProtocolDecoder {
    type Event;

    /// Smallest well-formed PDU. Must be strictly positive; the engine
    /// asserts this at construction.
    const MIN_PDU_LEN: usize;

    /// Inspect the buffered bytes of `pdu`. On `Consumed`/`Discard` the
    /// decoder must have set `pdu.pdu_len` to the PDU's total on-wire length
    /// so the engine can split off surplus bytes.
    fn decode(&mut self, pdu: &mut PduBuf, events: &mut Vec<Self::Event>) -> DecodeOutcome;
}

pub struct ReadEngine<D: ProtocolDecoder> {
    decoder: D,
    cache: LocalPduCache,
    cur: Option<PduBuf>,
    pub n_read: u64,
    pub n_pdu_in: u64,
}

impl<D: ProtocolDecoder> ReadEngine<D> {
    pub fn new(decoder: D, cache: LocalPduCache) -> ReadEngine<D> {
        assert!(
            D::MIN_PDU_LEN > 0,
            "a protocol's minimum PDU length must be strictly positive"
        );
        ReadEngine {
            decoder,
            cache,
            cur: None,
            n_read: 0,
            n_pdu_in: 0,
        }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut D {
        &mut self.decoder
    }

    /// Feed bytes arriving from the transport, in wire order. Events for
    /// every PDU completed by these bytes are appended to `events`.
    ///
    /// An `Err` is a close reason: the connection must be torn down.
    pub fn feed(
        &mut self,
        mut bytes: &[u8],
        events: &mut Vec<D::Event>,
    ) -> Result<(), &'static str> {
        self.n_read += bytes.len() as u64;
        loop {
            let cur = self.cur.get_or_insert_with(|| self.cache.get());
            if !bytes.is_empty() {
                let n = cur.fill(bytes);
                bytes = &bytes[n..];
            }

            self.drain_current(events)?;

            if bytes.is_empty() {
                return Ok(());
            }
            if let Some(cur) = &self.cur {
                if cur.space() == 0 {
                    // the decoder wants more bytes than one arena can hold
                    return Err("pdu exceeds buffer capacity");
                }
            }
        }
    }

    /// Run the decode loop over the current PDU until it stalls for more
    /// bytes, handling completion and overflow splits.
    fn drain_current(&mut self, events: &mut Vec<D::Event>) -> Result<(), &'static str> {
        loop {
            let Some(pdu) = self.cur.as_mut() else {
                return Ok(());
            };
            if pdu.need == 0 || pdu.len() < pdu.need {
                return Ok(());
            }

            match self.decoder.decode(pdu, events) {
                DecodeOutcome::Need(n) => {
                    if n <= pdu.len() {
                        return Err("decoder requested no progress");
                    }
                    pdu.need = n;
                    return Ok(());
                }
                DecodeOutcome::Consumed => self.finish_current()?,
                DecodeOutcome::Discard(reason) => {
                    debug!("discarding pdu: {}", reason);
                    self.finish_current()?;
                }
                DecodeOutcome::Close(reason) => return Err(reason),
            }
        }
    }

    fn finish_current(&mut self) -> Result<(), &'static str> {
        let pdu = self.cur.take().expect("no current pdu to finish");
        let total = pdu.pdu_len.unwrap_or(pdu.len());
        if total == 0 {
            return Err("decoder finished a zero-length pdu");
        }
        self.n_pdu_in += 1;

        if pdu.len() > total {
            // surplus bytes are the start of the next PDU
            let mut next = self.cache.get();
            next.fill(&pdu.as_ref()[total..]);
            self.cur = Some(next);
        }
        self.cache.put(pdu);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduPool;
    use rstest::rstest;
    use std::sync::Arc;

    /// Toy framing for engine tests: `[tag u8][body_len u8][body]`. A tag of
    /// 0xff closes, a tag of 0xfe is discarded after framing, a tag of 0xfd
    /// maliciously declares length zero.
    struct ToyDecoder;

    impl ProtocolDecoder for ToyDecoder {
        type Event = (u8, Vec<u8>);

        const MIN_PDU_LEN: usize = 2;

        fn decode(&mut self, pdu: &mut PduBuf, events: &mut Vec<Self::Event>) -> DecodeOutcome {
            let bytes = pdu.as_ref();
            if bytes.len() < 2 {
                return DecodeOutcome::Need(2);
            }
            let tag = bytes[0];
            if tag == 0xff {
                return DecodeOutcome::Close("poison tag");
            }
            if tag == 0xfd {
                pdu.pdu_len = Some(0);
                return DecodeOutcome::Consumed;
            }
            let total = 2 + bytes[1] as usize;
            if bytes.len() < total {
                return DecodeOutcome::Need(total);
            }
            let body = bytes[2..total].to_vec();
            pdu.pdu_len = Some(total);
            if tag == 0xfe {
                return DecodeOutcome::Discard("discard tag");
            }
            events.push((tag, body));
            DecodeOutcome::Consumed
        }
    }

    fn engine() -> ReadEngine<ToyDecoder> {
        let pool = Arc::new(PduPool::new(64, 16));
        ReadEngine::new(ToyDecoder, LocalPduCache::new(pool, 4))
    }

    fn feed_chunked(chunk_len: usize, bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        let mut engine = engine();
        let mut events = Vec::new();
        for chunk in bytes.chunks(chunk_len.max(1)) {
            engine.feed(chunk, &mut events).unwrap();
        }
        events
    }

    #[rstest]
    #[case::single_byte(1)]
    #[case::two_bytes(2)]
    #[case::three_bytes(3)]
    #[case::seven_bytes(7)]
    #[case::all_at_once(1000)]
    fn test_framing_is_chunking_independent(#[case] chunk_len: usize) {
        let bytes = [
            1, 3, 10, 11, 12, // pdu A
            2, 0, // pdu B, empty body
            3, 5, 20, 21, 22, 23, 24, // pdu C
        ];
        let expected = vec![
            (1, vec![10, 11, 12]),
            (2, vec![]),
            (3, vec![20, 21, 22, 23, 24]),
        ];

        assert_eq!(feed_chunked(chunk_len, &bytes), expected);
    }

    #[test]
    fn test_overflow_split_preserves_second_pdu() {
        // both PDUs arrive in one read; the second must survive the split
        let mut engine = engine();
        let mut events = Vec::new();
        engine
            .feed(&[1, 2, 0xaa, 0xbb, 2, 1, 0xcc], &mut events)
            .unwrap();

        assert_eq!(events, vec![(1, vec![0xaa, 0xbb]), (2, vec![0xcc])]);
        assert_eq!(engine.n_pdu_in, 2);
    }

    #[test]
    fn test_split_across_discarded_pdu() {
        // surplus bytes after a discarded PDU still start the next one
        let mut engine = engine();
        let mut events = Vec::new();
        engine
            .feed(&[0xfe, 1, 0x00, 7, 2, 0xaa, 0xbb], &mut events)
            .unwrap();

        assert_eq!(events, vec![(7, vec![0xaa, 0xbb])]);
        assert_eq!(engine.n_pdu_in, 2);
    }

    #[test]
    fn test_close_propagates() {
        let mut engine = engine();
        let mut events = Vec::new();
        assert_eq!(
            engine.feed(&[0xff, 0], &mut events),
            Err("poison tag")
        );
    }

    #[test]
    fn test_zero_length_pdu_refused() {
        // a declared length of zero would split forever
        let mut engine = engine();
        let mut events = Vec::new();
        assert_eq!(
            engine.feed(&[0xfd, 0], &mut events),
            Err("decoder finished a zero-length pdu")
        );
    }

    #[test]
    fn test_pdu_larger_than_arena_closes() {
        let pool = Arc::new(PduPool::new(4, 4));
        let mut engine = ReadEngine::new(ToyDecoder, LocalPduCache::new(pool, 2));
        let mut events = Vec::new();

        // declares a 12-byte PDU into a 4-byte arena
        assert_eq!(
            engine.feed(&[1, 10, 0, 0, 0, 0], &mut events),
            Err("pdu exceeds buffer capacity")
        );
    }

    #[test]
    fn test_counters() {
        let mut engine = engine();
        let mut events = Vec::new();
        engine.feed(&[1, 1, 0xaa, 2, 0], &mut events).unwrap();

        assert_eq!(engine.n_read, 5);
        assert_eq!(engine.n_pdu_in, 2);
    }
}
