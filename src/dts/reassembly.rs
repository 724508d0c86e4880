//! Non-ARQ C_PDU reassembly.
//!
//! Connectionless transfer repeats segments rather than acknowledging them,
//! so a C_PDU arrives as overlapping fragments in any order, possibly more
//! than once. Each in-progress C_PDU holds a reception bitmap with one bit
//! per payload byte; the C_PDU is delivered exactly once, when every byte of
//! `[0, total)` has been received, and the slot is freed on delivery.
//!
//! Slots are keyed by the 12-bit C_PDU id. A stale slot (sender restarted,
//! or the tail was lost for good) is purged by age so the id can be reused.

use super::{MAX_C_PDU, MAX_C_PDU_ID};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, PartialEq, Eq)]
pub enum SegmentError {
    /// The declared total differs from the slot created by earlier segments.
    TotalMismatch,
    /// Offset plus segment length runs past the declared total.
    OffsetOverrun,
    /// An overlapping byte differs from what was already received.
    InconsistentOverlap,
    /// Declared total is zero or exceeds the C_PDU ceiling.
    BadTotal,
    /// All 4096 slots are in use.
    TableFull,
}

struct Slot {
    total: usize,
    buf: Vec<u8>,
    /// One bit per payload byte.
    bitmap: Vec<u8>,
    received: usize,
    created: Instant,
}

impl Slot {
    fn new(total: usize, now: Instant) -> Slot {
        Slot {
            total,
            buf: vec![0; total],
            bitmap: vec![0; (total + 7) / 8],
            received: 0,
            created: now,
        }
    }

    fn has_byte(&self, i: usize) -> bool {
        self.bitmap[i / 8] & (1 << (i % 8)) != 0
    }

    fn mark_byte(&mut self, i: usize) {
        self.bitmap[i / 8] |= 1 << (i % 8);
    }
}

pub struct ReassemblyTable {
    slots: FxHashMap<u16, Slot>,
}

impl Default for ReassemblyTable {
    fn default() -> Self {
        ReassemblyTable {
            slots: FxHashMap::default(),
        }
    }
}

impl ReassemblyTable {
    pub fn in_progress(&self) -> usize {
        self.slots.len()
    }

    /// Fold one received segment in. Returns the complete C_PDU when this
    /// segment supplied its final missing byte.
    pub fn insert(
        &mut self,
        id: u16,
        total: usize,
        offset: usize,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, SegmentError> {
        debug_assert!(id <= MAX_C_PDU_ID);
        if total == 0 || total > MAX_C_PDU {
            return Err(SegmentError::BadTotal);
        }
        if offset + data.len() > total {
            return Err(SegmentError::OffsetOverrun);
        }

        if !self.slots.contains_key(&id) {
            if self.slots.len() > MAX_C_PDU_ID as usize {
                warn!("all non-arq reassembly slots in use - dropping c_pdu #{}", id);
                return Err(SegmentError::TableFull);
            }
            self.slots.insert(id, Slot::new(total, now));
        }
        let slot = self.slots.get_mut(&id).expect("slot just ensured");
        if slot.total != total {
            return Err(SegmentError::TotalMismatch);
        }

        // repetition is the norm; only *conflicting* overlap is an error
        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i;
            if slot.has_byte(pos) && slot.buf[pos] != byte {
                return Err(SegmentError::InconsistentOverlap);
            }
        }

        for (i, &byte) in data.iter().enumerate() {
            let pos = offset + i;
            if !slot.has_byte(pos) {
                slot.buf[pos] = byte;
                slot.mark_byte(pos);
                slot.received += 1;
            }
        }

        if slot.received == slot.total {
            let slot = self.slots.remove(&id).expect("complete slot present");
            debug!("c_pdu #{} complete ({} bytes)", id, slot.total);
            return Ok(Some(slot.buf));
        }
        Ok(None)
    }

    /// Drop slots older than `max_age`. Returns how many were purged.
    pub fn purge_older_than(&mut self, now: Instant, max_age: std::time::Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|id, slot| {
            let keep = now.duration_since(slot.created) < max_age;
            if !keep {
                debug!(
                    "purging incomplete c_pdu #{} ({}/{} bytes received)",
                    id, slot.received, slot.total
                );
            }
            keep
        });
        before - self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::time::Instant;

    fn now() -> Instant {
        Instant::now()
    }

    #[test]
    fn test_single_segment_delivers_immediately() {
        let mut table = ReassemblyTable::default();
        let result = table.insert(1, 3, 0, b"abc", now()).unwrap();
        assert_eq!(result, Some(b"abc".to_vec()));
        assert_eq!(table.in_progress(), 0);
    }

    /// Four segments of a 2500-byte C_PDU (800+800+800+100) deliver exactly
    /// once, whatever their arrival order.
    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3])]
    #[case::reversed(vec![3, 2, 1, 0])]
    #[case::interleaved(vec![2, 0, 3, 1])]
    fn test_segmented_c_pdu_any_arrival_order(#[case] order: Vec<usize>) {
        let c_pdu: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let bounds = [(0usize, 800usize), (800, 800), (1600, 800), (2400, 100)];

        let mut table = ReassemblyTable::default();
        let mut delivered = Vec::new();
        for &i in &order {
            let (offset, len) = bounds[i];
            if let Some(done) = table
                .insert(42, 2500, offset, &c_pdu[offset..offset + len], now())
                .unwrap()
            {
                delivered.push(done);
            }
        }

        assert_eq!(delivered, vec![c_pdu]);
        assert_eq!(table.in_progress(), 0);
    }

    #[test]
    fn test_missing_segment_blocks_delivery() {
        let c_pdu: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut table = ReassemblyTable::default();

        // segment at offset 800 never arrives
        for (offset, len) in [(0usize, 800usize), (1600, 800), (2400, 100)] {
            let result = table
                .insert(42, 2500, offset, &c_pdu[offset..offset + len], now())
                .unwrap();
            assert_eq!(result, None);
        }
        assert_eq!(table.in_progress(), 1);
    }

    #[test]
    fn test_repetition_is_harmless() {
        let mut table = ReassemblyTable::default();
        assert_eq!(table.insert(7, 4, 0, b"ab", now()).unwrap(), None);
        assert_eq!(table.insert(7, 4, 0, b"ab", now()).unwrap(), None);
        assert_eq!(
            table.insert(7, 4, 2, b"cd", now()).unwrap(),
            Some(b"abcd".to_vec())
        );
    }

    #[test]
    fn test_conflicting_overlap_rejected() {
        let mut table = ReassemblyTable::default();
        table.insert(7, 4, 0, b"ab", now()).unwrap();
        assert_eq!(
            table.insert(7, 4, 1, b"xz", now()),
            Err(SegmentError::InconsistentOverlap)
        );
    }

    #[test]
    fn test_total_mismatch_rejected() {
        let mut table = ReassemblyTable::default();
        table.insert(7, 100, 0, b"ab", now()).unwrap();
        assert_eq!(
            table.insert(7, 99, 2, b"cd", now()),
            Err(SegmentError::TotalMismatch)
        );
    }

    #[rstest]
    #[case::zero(0, SegmentError::BadTotal)]
    #[case::past_limit(MAX_C_PDU + 1, SegmentError::BadTotal)]
    fn test_bad_totals(#[case] total: usize, #[case] expected: SegmentError) {
        let mut table = ReassemblyTable::default();
        assert_eq!(table.insert(7, total, 0, b"a", now()), Err(expected));
    }

    #[test]
    fn test_offset_overrun_rejected() {
        let mut table = ReassemblyTable::default();
        assert_eq!(
            table.insert(7, 10, 9, b"ab", now()),
            Err(SegmentError::OffsetOverrun)
        );
    }

    #[test]
    fn test_purge_by_age() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
            .block_on(async {
                let max_age = std::time::Duration::from_secs(60);
                let mut table = ReassemblyTable::default();
                table.insert(1, 10, 0, b"abc", Instant::now()).unwrap();

                tokio::time::advance(std::time::Duration::from_secs(30)).await;
                table.insert(2, 10, 0, b"abc", Instant::now()).unwrap();

                tokio::time::advance(std::time::Duration::from_secs(31)).await;
                assert_eq!(table.purge_older_than(Instant::now(), max_age), 1);
                assert_eq!(table.in_progress(), 1);
            });
    }
}
