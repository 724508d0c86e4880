//! ARQ sliding windows over the 8-bit D_PDU sequence space.
//!
//! Sequence comparisons use the modular convention that a forward distance of
//! at most 127 means "newer"; to keep that unambiguous no window may span
//! more than half the sequence space. The transmit side refuses to allocate
//! once `(tx_uwe - tx_lwe) mod 256` reaches 128.
//!
//! The transmit window tracks one slot per outstanding sequence number; the
//! frame bytes themselves stay retained in the write engine under the slot's
//! write id, so acknowledgement release and retransmission both go through
//! that single owner.

use tokio::time::Instant;
use tracing::{debug, warn};

/// Forward distance from `from` to `to` in the 8-bit sequence space.
pub fn seq_forward(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from)
}

/// Outstanding-window ceiling: allocation fails once this many sequence
/// numbers are unacknowledged.
pub const FULL_WINDOW: usize = 128;

pub struct TxSlot {
    pub write_id: u64,
    pub last_tx: Instant,
    pub retries: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct WindowFull;

pub struct ArqTx {
    lwe: u8,
    uwe: u8,
    slots: Box<[Option<TxSlot>; 256]>,
}

impl Default for ArqTx {
    fn default() -> Self {
        ArqTx {
            lwe: 0,
            uwe: 0,
            slots: Box::new(std::array::from_fn(|_| None)),
        }
    }
}

impl ArqTx {
    pub fn lwe(&self) -> u8 {
        self.lwe
    }

    pub fn uwe(&self) -> u8 {
        self.uwe
    }

    /// Outstanding (unacknowledged) sequence count.
    pub fn window(&self) -> usize {
        seq_forward(self.lwe, self.uwe) as usize
    }

    pub fn has_room_for(&self, segments: usize) -> bool {
        self.window() + segments <= FULL_WINDOW
    }

    /// Allocate the next sequence number. Returns the sequence plus its
    /// window-edge markers.
    pub fn alloc(&mut self, write_id: u64, now: Instant) -> Result<(u8, bool, bool), WindowFull> {
        if self.window() >= FULL_WINDOW {
            return Err(WindowFull);
        }
        let seq = self.uwe;
        let lwe_mark = seq == self.lwe;
        self.slots[seq as usize] = Some(TxSlot {
            write_id,
            last_tx: now,
            retries: 0,
        });
        self.uwe = self.uwe.wrapping_add(1);
        Ok((seq, true, lwe_mark))
    }

    /// Apply a received acknowledgement: a new lower window edge plus a
    /// bitmap of selectively received sequences beyond it. Returns the write
    /// ids of every newly released frame.
    pub fn on_ack(&mut self, new_lwe: u8, bitmap: &[u8]) -> Vec<u64> {
        let mut released = Vec::new();

        let advance = seq_forward(self.lwe, new_lwe) as usize;
        if advance > self.window() {
            debug!(
                "ack advances lwe to #{} past our uwe #{} - ignoring the cumulative part",
                new_lwe, self.uwe
            );
        } else {
            for i in 0..advance {
                let seq = self.lwe.wrapping_add(i as u8);
                if let Some(slot) = self.slots[seq as usize].take() {
                    released.push(slot.write_id);
                }
            }
            self.lwe = new_lwe;
        }

        // selective acknowledgements beyond the new lower edge
        for (byte_idx, byte) in bitmap.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let offset = byte_idx * 8 + bit;
                if offset >= self.window() {
                    continue;
                }
                let seq = self.lwe.wrapping_add(offset as u8);
                if let Some(slot) = self.slots[seq as usize].take() {
                    released.push(slot.write_id);
                }
            }
        }

        // the lower edge slides over everything contiguously acknowledged
        while self.lwe != self.uwe && self.slots[self.lwe as usize].is_none() {
            self.lwe = self.lwe.wrapping_add(1);
        }

        released
    }

    /// Sequences whose retransmit timer expired. Stamps them as retransmitted.
    pub fn due_for_retransmit(
        &mut self,
        now: Instant,
        rto: std::time::Duration,
    ) -> Vec<(u8, u64)> {
        let mut due = Vec::new();
        for i in 0..self.window() {
            let seq = self.lwe.wrapping_add(i as u8);
            if let Some(slot) = self.slots[seq as usize].as_mut() {
                if now.duration_since(slot.last_tx) >= rto {
                    slot.last_tx = now;
                    slot.retries += 1;
                    due.push((seq, slot.write_id));
                }
            }
        }
        due
    }

    /// Clear the window (RESET / WIN_RESYNC). Returns the released write ids.
    pub fn reset(&mut self) -> Vec<u64> {
        let mut released = Vec::new();
        for slot in self.slots.iter_mut() {
            if let Some(slot) = slot.take() {
                released.push(slot.write_id);
            }
        }
        self.lwe = 0;
        self.uwe = 0;
        released
    }
}

pub struct RxSeg {
    pub first: bool,
    pub last: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RxDisposition {
    Stored,
    /// Below the lower window edge: already acknowledged and delivered.
    DuplicateDelivered,
    /// Inside the window with its ACK bit already set.
    DuplicateBuffered,
}

enum RunState {
    Complete(u8),
    Incomplete,
    /// A segment flagged "first" interrupts the run at this sequence.
    Restart(u8),
}

pub struct ArqRx {
    lwe: u8,
    uwe: u8,
    acked: Box<[bool; 256]>,
    segs: Box<[Option<RxSeg>; 256]>,
}

impl Default for ArqRx {
    fn default() -> Self {
        ArqRx {
            lwe: 0,
            uwe: 0,
            acked: Box::new([false; 256]),
            segs: Box::new(std::array::from_fn(|_| None)),
        }
    }
}

impl ArqRx {
    pub fn lwe(&self) -> u8 {
        self.lwe
    }

    pub fn uwe(&self) -> u8 {
        self.uwe
    }

    pub fn window(&self) -> usize {
        seq_forward(self.lwe, self.uwe) as usize
    }

    pub fn on_segment(&mut self, seq: u8, first: bool, last: bool, data: Vec<u8>) -> RxDisposition {
        let dist = seq_forward(self.lwe, seq) as usize;
        if dist >= FULL_WINDOW {
            return RxDisposition::DuplicateDelivered;
        }
        if self.acked[seq as usize] {
            return RxDisposition::DuplicateBuffered;
        }
        self.segs[seq as usize] = Some(RxSeg { first, last, data });
        self.acked[seq as usize] = true;
        if dist >= self.window() {
            self.uwe = seq.wrapping_add(1);
        }
        RxDisposition::Stored
    }

    /// Pull every complete C_PDU whose segments are contiguous from the lower
    /// window edge, shrinking the window (and its ACK bitmap) from the low
    /// end.
    pub fn deliver(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            if self.window() == 0 {
                break;
            }
            match &self.segs[self.lwe as usize] {
                None => break,
                Some(seg) if !seg.first => {
                    warn!(
                        "segment #{} at the lower window edge does not start a c_pdu - dropping",
                        self.lwe
                    );
                    self.drop_seq(self.lwe);
                    continue;
                }
                Some(_) => {}
            }

            match self.scan_run() {
                RunState::Incomplete => break,
                RunState::Restart(at) => {
                    warn!(
                        "c_pdu starting at #{} interrupted by a new first segment at #{} - dropping the fragment",
                        self.lwe, at
                    );
                    while self.lwe != at {
                        self.drop_seq(self.lwe);
                    }
                }
                RunState::Complete(end) => {
                    let mut c_pdu = Vec::new();
                    let mut s = self.lwe;
                    loop {
                        let seg = self.segs[s as usize].take().expect("scanned run has a gap");
                        c_pdu.extend_from_slice(&seg.data);
                        self.acked[s as usize] = false;
                        let done = s == end;
                        s = s.wrapping_add(1);
                        if done {
                            break;
                        }
                    }
                    self.lwe = s;
                    out.push(c_pdu);
                }
            }
        }
        out
    }

    fn drop_seq(&mut self, seq: u8) {
        debug_assert_eq!(seq, self.lwe);
        self.segs[seq as usize] = None;
        self.acked[seq as usize] = false;
        self.lwe = self.lwe.wrapping_add(1);
    }

    fn scan_run(&self) -> RunState {
        let mut s = self.lwe;
        loop {
            let Some(seg) = &self.segs[s as usize] else {
                return RunState::Incomplete;
            };
            if seg.first && s != self.lwe {
                return RunState::Restart(s);
            }
            if seg.last {
                return RunState::Complete(s);
            }
            s = s.wrapping_add(1);
            if seq_forward(self.lwe, s) as usize >= FULL_WINDOW {
                return RunState::Incomplete;
            }
        }
    }

    /// Current acknowledgement state: the lower window edge plus one bit per
    /// sequence in `[lwe, uwe)`. Always at least one bitmap byte so the ACK
    /// header never degenerates.
    pub fn ack_info(&self) -> (u8, Vec<u8>) {
        let window = self.window();
        let mut bitmap = vec![0u8; (window + 7) / 8];
        for i in 0..window {
            let seq = self.lwe.wrapping_add(i as u8);
            if self.acked[seq as usize] {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        if bitmap.is_empty() {
            bitmap.push(0);
        }
        (self.lwe, bitmap)
    }

    pub fn reset(&mut self) {
        self.acked.fill(false);
        for seg in self.segs.iter_mut() {
            *seg = None;
        }
        self.lwe = 0;
        self.uwe = 0;
    }

    /// Invariant check used by tests: no ACK bit outside `[lwe, uwe)`.
    #[cfg(test)]
    fn bits_outside_window(&self) -> usize {
        (0..=255u8)
            .filter(|&s| {
                self.acked[s as usize] && seq_forward(self.lwe, s) as usize >= self.window()
            })
            .count()
    }
}
