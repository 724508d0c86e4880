//! Hierarchical subnetwork addresses.
//!
//! An address is a sequence of 1..=7 four-bit elements ("nibbles"). On the
//! wire two addresses (source, then destination) share packed byte space: the
//! pair occupies `(src_len + dst_len + 1) / 2` bytes, with an unused trailing
//! nibble zero-padded. The per-address length travels separately in the D_PDU
//! header, so the packed form itself carries no length.

use std::fmt::{Display, Formatter};

pub const MAX_ADDR_LEN: usize = 7;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct S5066Addr {
    len: u8,
    nibbles: [u8; MAX_ADDR_LEN],
}

impl Display for S5066Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, n) in self.elements().iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", n)?;
        }
        Ok(())
    }
}

impl S5066Addr {
    pub fn new(elements: &[u8]) -> Result<S5066Addr, &'static str> {
        if elements.is_empty() || elements.len() > MAX_ADDR_LEN {
            return Err("address length must be 1..=7");
        }
        if elements.iter().any(|&e| e > 0x0f) {
            return Err("address element exceeds 4 bits");
        }
        let mut nibbles = [0u8; MAX_ADDR_LEN];
        nibbles[..elements.len()].copy_from_slice(elements);
        Ok(S5066Addr {
            len: elements.len() as u8,
            nibbles,
        })
    }

    /// The SIS wire format carries addresses as a fixed big-endian u32 whose
    /// low 28 bits hold the 7 address elements.
    pub fn from_u32(raw: u32) -> S5066Addr {
        let mut nibbles = [0u8; MAX_ADDR_LEN];
        for (i, n) in nibbles.iter_mut().enumerate() {
            *n = ((raw >> ((MAX_ADDR_LEN - 1 - i) * 4)) & 0x0f) as u8;
        }
        S5066Addr {
            len: MAX_ADDR_LEN as u8,
            nibbles,
        }
    }

    pub fn to_u32(&self) -> u32 {
        let mut raw = 0u32;
        for i in 0..MAX_ADDR_LEN {
            let n = if (i as u8) < self.len { self.nibbles[i] } else { 0 };
            raw = (raw << 4) | n as u32;
        }
        raw
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn elements(&self) -> &[u8] {
        &self.nibbles[..self.len as usize]
    }
}

/// Packed size of an address pair in bytes.
pub fn packed_len(src_len: usize, dst_len: usize) -> usize {
    (src_len + dst_len + 1) / 2
}

/// Pack source then destination into shared nibble space.
pub fn encode_pair(src: &S5066Addr, dst: &S5066Addr, out: &mut Vec<u8>) {
    let mut nibbles = Vec::with_capacity(src.len() + dst.len() + 1);
    nibbles.extend_from_slice(src.elements());
    nibbles.extend_from_slice(dst.elements());
    if nibbles.len() % 2 != 0 {
        nibbles.push(0);
    }
    for pair in nibbles.chunks_exact(2) {
        out.push((pair[0] << 4) | pair[1]);
    }
}

/// Unpack an address pair with the given per-address element counts.
pub fn decode_pair(
    src_len: usize,
    dst_len: usize,
    bytes: &[u8],
) -> Result<(S5066Addr, S5066Addr), &'static str> {
    if src_len == 0 || src_len > MAX_ADDR_LEN || dst_len == 0 || dst_len > MAX_ADDR_LEN {
        return Err("address length must be 1..=7");
    }
    if bytes.len() < packed_len(src_len, dst_len) {
        return Err("address field shorter than declared lengths");
    }
    let nibble_at = |i: usize| {
        let b = bytes[i / 2];
        if i % 2 == 0 {
            (b >> 4) & 0x0f
        } else {
            b & 0x0f
        }
    };
    let mut src = [0u8; MAX_ADDR_LEN];
    for (i, s) in src.iter_mut().take(src_len).enumerate() {
        *s = nibble_at(i);
    }
    let mut dst = [0u8; MAX_ADDR_LEN];
    for (i, d) in dst.iter_mut().take(dst_len).enumerate() {
        *d = nibble_at(src_len + i);
    }
    Ok((
        S5066Addr::new(&src[..src_len]).expect("nibble extraction stays in range"),
        S5066Addr::new(&dst[..dst_len]).expect("nibble extraction stays in range"),
    ))
}
