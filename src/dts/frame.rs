//! D_PDU wire codec.
//!
//! Frame layout:
//!
//! ```ascii
//! 0..1   Maury-Styles sync pattern 0x90 0xEB
//! 2      D_TYPE (upper nibble) | EOW bits 11..8 (lower nibble)
//! 3      EOW bits 7..0
//! 4      EOT
//! 5      address length (bits 7..5) | type header length (bits 4..0)
//! 6..    source and destination address, nibble-packed (addr_size bytes)
//! ..     type-specific header (hdr_len bytes, layouts below)
//! ..     segmented C_PDU payload (data-bearing types only, <= 800 bytes)
//! tail   CRC trailer: header CRC-16 then, iff payload is present, payload
//!        CRC-16. RESET and MANAGEMENT frames instead carry one CRC-32 over
//!        the whole frame.
//! ```
//!
//! Type-specific headers:
//!
//! ```ascii
//! DATA / EDATA (4):      flags+seg_hi | seg_lo | tx_seq | edge marks
//!                        flags: bit7 first segment, bit6 last segment
//!                        edge:  bit7 upper window edge, bit6 lower edge
//! ACK / EACK (>=4):      reserved | new rx_lwe | ack bitmap (hdr_len-2)
//! DATA_ACK (>=6):        DATA header | new rx_lwe | ack bitmap (hdr_len-5)
//! RESET (4):             reason | new tx seq | new rx seq | flags (bit7 ack)
//! NON_ARQ / expedited (9): id_hi+seg_hi | seg_lo | id_lo | C_PDU size (2)
//!                        | C_PDU offset (2) | rx window hint (2)
//!                        byte 0: bits 5..2 id bits 11..8, bits 1..0 seg
//!                        size bits 9..8
//! MANAGEMENT (4):        opaque info bytes
//! WARNING (4):           reason | offending D_TYPE | reserved | reserved
//! ```

use super::{MAX_C_PDU, MIN_PDU, PREAMBLE, SEG_SIZE};
use crate::addr::{self, S5066Addr};
use crate::crc::{crc16, crc32};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::ops::Range;

#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DType {
    DataOnly = 0,
    AckOnly = 1,
    DataAck = 2,
    Reset = 3,
    EDataOnly = 4,
    EAckOnly = 5,
    Management = 6,
    NonArq = 7,
    ExpeditedNonArq = 8,
    Warning = 15,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameBody {
    Data {
        expedited: bool,
        seq: u8,
        first: bool,
        last: bool,
        uwe_mark: bool,
        lwe_mark: bool,
        payload: Vec<u8>,
    },
    Ack {
        expedited: bool,
        new_lwe: u8,
        bitmap: Vec<u8>,
    },
    DataAck {
        seq: u8,
        first: bool,
        last: bool,
        uwe_mark: bool,
        lwe_mark: bool,
        payload: Vec<u8>,
        new_lwe: u8,
        bitmap: Vec<u8>,
    },
    NonArq {
        expedited: bool,
        id: u16,
        total: u16,
        offset: u16,
        rx_win: u16,
        payload: Vec<u8>,
    },
    Reset {
        reason: u8,
        new_tx: u8,
        new_rx: u8,
        is_ack: bool,
    },
    Management {
        info: [u8; 4],
    },
    Warning {
        reason: u8,
        orig_type: u8,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DtsFrame {
    pub eow: u16,
    pub eot: u8,
    pub src: S5066Addr,
    pub dst: S5066Addr,
    pub body: FrameBody,
}

impl DtsFrame {
    pub fn d_type(&self) -> DType {
        match &self.body {
            FrameBody::Data { expedited: false, .. } => DType::DataOnly,
            FrameBody::Data { expedited: true, .. } => DType::EDataOnly,
            FrameBody::Ack { expedited: false, .. } => DType::AckOnly,
            FrameBody::Ack { expedited: true, .. } => DType::EAckOnly,
            FrameBody::DataAck { .. } => DType::DataAck,
            FrameBody::NonArq { expedited: false, .. } => DType::NonArq,
            FrameBody::NonArq { expedited: true, .. } => DType::ExpeditedNonArq,
            FrameBody::Reset { .. } => DType::Reset,
            FrameBody::Management { .. } => DType::Management,
            FrameBody::Warning { .. } => DType::Warning,
        }
    }

    fn type_header(&self) -> Vec<u8> {
        fn data_bytes(seq: u8, first: bool, last: bool, uwe: bool, lwe: bool, payload_len: usize) -> [u8; 4] {
            let mut flags = ((payload_len >> 8) & 0x03) as u8;
            if first {
                flags |= 0x80;
            }
            if last {
                flags |= 0x40;
            }
            let mut edge = 0u8;
            if uwe {
                edge |= 0x80;
            }
            if lwe {
                edge |= 0x40;
            }
            [flags, (payload_len & 0xff) as u8, seq, edge]
        }

        match &self.body {
            FrameBody::Data {
                seq,
                first,
                last,
                uwe_mark,
                lwe_mark,
                payload,
                ..
            } => data_bytes(*seq, *first, *last, *uwe_mark, *lwe_mark, payload.len()).to_vec(),
            FrameBody::Ack { new_lwe, bitmap, .. } => {
                let mut th = vec![0, *new_lwe];
                th.extend_from_slice(bitmap);
                while th.len() < 4 {
                    th.push(0);
                }
                th
            }
            FrameBody::DataAck {
                seq,
                first,
                last,
                uwe_mark,
                lwe_mark,
                payload,
                new_lwe,
                bitmap,
            } => {
                let mut th =
                    data_bytes(*seq, *first, *last, *uwe_mark, *lwe_mark, payload.len()).to_vec();
                th.push(*new_lwe);
                th.extend_from_slice(bitmap);
                while th.len() < 6 {
                    th.push(0);
                }
                th
            }
            FrameBody::NonArq {
                id,
                total,
                offset,
                rx_win,
                payload,
                ..
            } => {
                let mut th = Vec::with_capacity(9);
                th.push((((id >> 8) as u8 & 0x0f) << 2) | ((payload.len() >> 8) & 0x03) as u8);
                th.push((payload.len() & 0xff) as u8);
                th.push((id & 0xff) as u8);
                th.extend_from_slice(&total.to_be_bytes());
                th.extend_from_slice(&offset.to_be_bytes());
                th.extend_from_slice(&rx_win.to_be_bytes());
                th
            }
            FrameBody::Reset {
                reason,
                new_tx,
                new_rx,
                is_ack,
            } => vec![*reason, *new_tx, *new_rx, if *is_ack { 0x80 } else { 0 }],
            FrameBody::Management { info } => info.to_vec(),
            FrameBody::Warning { reason, orig_type } => vec![*reason, *orig_type, 0, 0],
        }
    }

    fn payload(&self) -> &[u8] {
        match &self.body {
            FrameBody::Data { payload, .. }
            | FrameBody::DataAck { payload, .. }
            | FrameBody::NonArq { payload, .. } => payload,
            _ => &[],
        }
    }

    /// Serialize to wire bytes plus the gather segments (header, payload,
    /// CRC trailer) the write engine vectorizes over.
    pub fn encode(&self) -> (Vec<u8>, Vec<Range<usize>>) {
        let d_type = self.d_type();
        let type_header = self.type_header();
        let payload = self.payload();
        debug_assert_eq!(
            self.src.len(),
            self.dst.len(),
            "a D_PDU carries one shared address length"
        );
        debug_assert!(type_header.len() >= 4 && type_header.len() <= 31);
        debug_assert!(payload.len() <= SEG_SIZE);

        let mut out = Vec::with_capacity(MIN_PDU + 7 + type_header.len() + payload.len() + 4);
        out.extend_from_slice(&PREAMBLE);
        out.push((u8::from(d_type) << 4) | ((self.eow >> 8) as u8 & 0x0f));
        out.push((self.eow & 0xff) as u8);
        out.push(self.eot);
        out.push(((self.src.len() as u8) << 5) | type_header.len() as u8);
        addr::encode_pair(&self.src, &self.dst, &mut out);
        out.extend_from_slice(&type_header);
        let header_end = out.len();

        let mut segs = vec![0..header_end];
        if !payload.is_empty() {
            out.extend_from_slice(payload);
            segs.push(header_end..out.len());
        }

        let trailer_start = out.len();
        match d_type {
            DType::Reset | DType::Management => {
                let crc = crc32(&out[..header_end]);
                out.extend_from_slice(&crc.to_be_bytes());
            }
            _ => {
                let crc = crc16(&out[..header_end]);
                out.extend_from_slice(&crc.to_be_bytes());
                if !payload.is_empty() {
                    let crc = crc16(payload);
                    out.extend_from_slice(&crc.to_be_bytes());
                }
            }
        }
        segs.push(trailer_start..out.len());

        (out, segs)
    }
}

pub enum Framing {
    /// Call again with at least this many bytes buffered.
    Need(usize),
    /// The frame occupies exactly this many bytes.
    Total(usize),
}

/// Fixed-header fields needed before the frame length is known.
struct HeaderFields {
    d_type_raw: u8,
    addr_size: usize,
    hdr_len: usize,
    hdr_end: usize,
}

fn header_fields(bytes: &[u8]) -> Result<HeaderFields, &'static str> {
    if bytes[..2] != PREAMBLE {
        return Err("bad dts preamble");
    }
    let d_type_raw = (bytes[2] >> 4) & 0x0f;
    let addr_size = ((bytes[5] >> 5) & 0x07) as usize;
    let hdr_len = (bytes[5] & 0x1f) as usize;
    if hdr_len < 4 {
        return Err("dts header length out of range");
    }
    Ok(HeaderFields {
        d_type_raw,
        addr_size,
        hdr_len,
        hdr_end: MIN_PDU + addr_size + hdr_len,
    })
}

/// Determine a frame's on-wire length from its self-describing header, or how
/// many more bytes are required to do so. An `Err` means the byte stream has
/// lost framing and the link must close.
pub fn wire_len(bytes: &[u8]) -> Result<Framing, &'static str> {
    if bytes.len() < MIN_PDU {
        return Ok(Framing::Need(MIN_PDU));
    }
    let hf = header_fields(bytes)?;
    if bytes.len() < hf.hdr_end {
        return Ok(Framing::Need(hf.hdr_end));
    }

    let th = &bytes[MIN_PDU + hf.addr_size..hf.hdr_end];
    let payload_len = match DType::try_from(hf.d_type_raw) {
        Ok(DType::DataOnly) | Ok(DType::EDataOnly) | Ok(DType::DataAck) | Ok(DType::NonArq)
        | Ok(DType::ExpeditedNonArq) => (((th[0] & 0x03) as usize) << 8) | th[1] as usize,
        Ok(_) => 0,
        // reserved types carry no known payload; frame them headers-only so
        // they can be discarded without losing stream sync
        Err(_) => 0,
    };

    let trailer = match DType::try_from(hf.d_type_raw) {
        Ok(DType::Reset) | Ok(DType::Management) => 4,
        _ => 2 + if payload_len > 0 { 2 } else { 0 },
    };

    Ok(Framing::Total(hf.hdr_end + payload_len + trailer))
}

/// Parse a complete frame previously measured by [`wire_len`]. Every error is
/// a silent discard at the caller.
pub fn parse(bytes: &[u8]) -> Result<DtsFrame, &'static str> {
    let hf = header_fields(bytes).map_err(|_| "header fields changed under us")?;
    let d_type = DType::try_from(hf.d_type_raw).map_err(|_| "reserved d_type")?;
    if hf.addr_size == 0 {
        return Err("zero address length");
    }

    let eow = (((bytes[2] & 0x0f) as u16) << 8) | bytes[3] as u16;
    let eot = bytes[4];
    let (src, dst) = addr::decode_pair(
        hf.addr_size,
        hf.addr_size,
        &bytes[MIN_PDU..MIN_PDU + hf.addr_size],
    )?;
    let th = &bytes[MIN_PDU + hf.addr_size..hf.hdr_end];

    // checksums first: a corrupt header must not be interpreted at all
    match d_type {
        DType::Reset | DType::Management => {
            let stored = u32::from_be_bytes(bytes[hf.hdr_end..hf.hdr_end + 4].try_into().unwrap());
            if crc32(&bytes[..hf.hdr_end]) != stored {
                return Err("frame crc-32 mismatch");
            }
        }
        _ => {
            let payload_len = bytes.len()
                - hf.hdr_end
                - 2
                - if bytes.len() > hf.hdr_end + 2 { 2 } else { 0 };
            let crc_at = hf.hdr_end + payload_len;
            let stored = u16::from_be_bytes(bytes[crc_at..crc_at + 2].try_into().unwrap());
            if crc16(&bytes[..hf.hdr_end]) != stored {
                return Err("header crc-16 mismatch");
            }
            if payload_len > 0 {
                let stored =
                    u16::from_be_bytes(bytes[crc_at + 2..crc_at + 4].try_into().unwrap());
                if crc16(&bytes[hf.hdr_end..crc_at]) != stored {
                    return Err("payload crc-16 mismatch");
                }
            }
        }
    }

    let seg_payload = |seg_len: usize| -> Result<Vec<u8>, &'static str> {
        if seg_len > SEG_SIZE {
            return Err("segment exceeds 800 bytes");
        }
        Ok(bytes[hf.hdr_end..hf.hdr_end + seg_len].to_vec())
    };

    let data_fields = |th: &[u8]| {
        let seg_len = (((th[0] & 0x03) as usize) << 8) | th[1] as usize;
        (
            seg_len,
            th[0] & 0x80 != 0,
            th[0] & 0x40 != 0,
            th[2],
            th[3] & 0x80 != 0,
            th[3] & 0x40 != 0,
        )
    };

    let body = match d_type {
        DType::DataOnly | DType::EDataOnly => {
            let (seg_len, first, last, seq, uwe_mark, lwe_mark) = data_fields(th);
            if seg_len == 0 {
                return Err("empty data segment");
            }
            FrameBody::Data {
                expedited: d_type == DType::EDataOnly,
                seq,
                first,
                last,
                uwe_mark,
                lwe_mark,
                payload: seg_payload(seg_len)?,
            }
        }
        DType::DataAck => {
            if th.len() < 6 {
                return Err("data_ack header too short");
            }
            let (seg_len, first, last, seq, uwe_mark, lwe_mark) = data_fields(th);
            if seg_len == 0 {
                return Err("empty data segment");
            }
            FrameBody::DataAck {
                seq,
                first,
                last,
                uwe_mark,
                lwe_mark,
                payload: seg_payload(seg_len)?,
                new_lwe: th[4],
                bitmap: th[5..].to_vec(),
            }
        }
        DType::AckOnly | DType::EAckOnly => FrameBody::Ack {
            expedited: d_type == DType::EAckOnly,
            new_lwe: th[1],
            bitmap: th[2..].to_vec(),
        },
        DType::NonArq | DType::ExpeditedNonArq => {
            if th.len() != 9 {
                return Err("non-arq header length mismatch");
            }
            let seg_len = (((th[0] & 0x03) as usize) << 8) | th[1] as usize;
            let id = (((th[0] >> 2) as u16 & 0x0f) << 8) | th[2] as u16;
            let total = u16::from_be_bytes([th[3], th[4]]);
            let offset = u16::from_be_bytes([th[5], th[6]]);
            let rx_win = u16::from_be_bytes([th[7], th[8]]);
            if seg_len == 0 {
                return Err("empty non-arq segment");
            }
            if total == 0 || total as usize > MAX_C_PDU {
                return Err("c_pdu size out of range");
            }
            if offset as usize + seg_len > total as usize {
                return Err("segment extends past declared c_pdu size");
            }
            FrameBody::NonArq {
                expedited: d_type == DType::ExpeditedNonArq,
                id,
                total,
                offset,
                rx_win,
                payload: seg_payload(seg_len)?,
            }
        }
        DType::Reset => FrameBody::Reset {
            reason: th[0],
            new_tx: th[1],
            new_rx: th[2],
            is_ack: th[3] & 0x80 != 0,
        },
        DType::Management => FrameBody::Management {
            info: [th[0], th[1], th[2], th[3]],
        },
        DType::Warning => FrameBody::Warning {
            reason: th[0],
            orig_type: th[1],
        },
    };

    Ok(DtsFrame {
        eow,
        eot,
        src,
        dst,
        body,
    })
}
