//! The two CRCs of STANAG 5066 Annex C.
//!
//! Both are bit-serial, LSB-first, with initial value 0 and no final XOR. The
//! polynomials are given in their reflected form, so the register shifts right
//! and folds the polynomial in whenever the outgoing bit differs from the
//! incoming data bit. Neither polynomial is in the catalog of any published
//! CRC collection, so the fold is spelled out here rather than pulled from a
//! generic CRC crate.

/// CRC-16 polynomial (reflected), used for D_PDU header and payload checksums.
pub const CRC16_POLY: u16 = 0x9299;

/// CRC-32 polynomial (reflected), used for management and reset D_PDUs.
pub const CRC32_POLY: u32 = 0xf3a4_e550;

/// Fold one byte into a running CRC-16.
pub fn crc16_byte(mut crc: u16, byte: u8) -> u16 {
    for i in 0..8 {
        let bit = ((crc & 1) as u8) ^ ((byte >> i) & 1);
        crc >>= 1;
        if bit != 0 {
            crc ^= CRC16_POLY;
        }
    }
    crc
}

/// CRC-16 over a span. The empty span yields 0.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0, |crc, &b| crc16_byte(crc, b))
}

/// Fold one byte into a running CRC-32.
pub fn crc32_byte(mut crc: u32, byte: u8) -> u32 {
    for i in 0..8 {
        let bit = ((crc & 1) as u8) ^ ((byte >> i) & 1);
        crc >>= 1;
        if bit != 0 {
            crc ^= CRC32_POLY;
        }
    }
    crc
}

/// CRC-32 over a span. The empty span yields 0.
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0, |crc, &b| crc32_byte(crc, b))
}
