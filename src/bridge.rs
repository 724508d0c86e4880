//! The SIS<->DTS bridge.
//!
//! A thin, stateless mapper (bar the C_PDU id allocator): an accepted
//! UNIDATA_REQUEST becomes one C_PDU heading for the peer link, and a C_PDU
//! completed by the DTS engine becomes a UNIDATA_INDICATION for whichever
//! client is bound to the destination SAP.
//!
//! The C_PDU wraps the client's U_PDU in a 4-byte S_PDU header carrying the
//! SAP pair, so the receiving daemon can route the delivery:
//!
//! ```ascii
//! 0  C_PCI (0 = data)
//! 1  S_PDU type (upper nibble) | priority (lower nibble)
//! 2  source SAP (upper nibble) | destination SAP (lower nibble)
//! 3  reserved
//! 4.. U_PDU
//! ```

use crate::addr::S5066Addr;
use crate::dts::{MAX_C_PDU, MAX_C_PDU_ID, SEG_SIZE};
use crate::sis::{
    self, encode_unidata_indication, unidata_reject, TxMode, UnidataIndication, UnidataRequest,
};

pub const C_PDU_HDR: usize = 4;
const C_PCI_DATA: u8 = 0;

pub fn make_c_pdu(src_sap: u8, dst_sap: u8, priority: u8, u_pdu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(C_PDU_HDR + u_pdu.len());
    out.push(C_PCI_DATA);
    out.push(priority & 0x0f);
    out.push((src_sap << 4) | (dst_sap & 0x0f));
    out.push(0);
    out.extend_from_slice(u_pdu);
    out
}

pub struct ParsedCPdu<'a> {
    pub src_sap: u8,
    pub dst_sap: u8,
    pub priority: u8,
    pub u_pdu: &'a [u8],
}

pub fn parse_c_pdu(bytes: &[u8]) -> Result<ParsedCPdu, &'static str> {
    if bytes.len() < C_PDU_HDR {
        return Err("c_pdu shorter than its header");
    }
    if bytes[0] != C_PCI_DATA {
        return Err("unsupported c_pci type");
    }
    Ok(ParsedCPdu {
        src_sap: (bytes[2] >> 4) & 0x0f,
        dst_sap: bytes[2] & 0x0f,
        priority: bytes[1] & 0x0f,
        u_pdu: &bytes[C_PDU_HDR..],
    })
}

/// Check a client submission against the limits of its transmission path.
/// The error is a UNIDATA_REQUEST_REJECTED reason code.
pub fn validate_submission(req: &UnidataRequest) -> Result<(), u8> {
    let c_pdu_len = C_PDU_HDR + req.payload.len();
    match req.tx_mode {
        TxMode::Arq => {
            if req.payload.len() > sis::ARQ_MTU {
                return Err(unidata_reject::TOO_LONG);
            }
        }
        TxMode::NonArq | TxMode::Broadcast => {
            if c_pdu_len > MAX_C_PDU {
                return Err(unidata_reject::TOO_LONG);
            }
        }
    }
    Ok(())
}

/// Fresh 12-bit C_PDU ids for the Non-ARQ path.
#[derive(Default)]
pub struct CPduIdSpace {
    next: u16,
}

impl CPduIdSpace {
    pub fn alloc(&mut self) -> u16 {
        let id = self.next;
        self.next = (self.next + 1) & MAX_C_PDU_ID;
        id
    }
}

/// Segment boundaries `(offset, len)` covering `[0, total)` in `seg_size`
/// steps.
pub fn segments(total: usize, seg_size: usize) -> impl Iterator<Item = (usize, usize)> {
    debug_assert!(seg_size > 0 && seg_size <= SEG_SIZE);
    (0..total)
        .step_by(seg_size)
        .map(move |offset| (offset, seg_size.min(total - offset)))
}

/// Turn a reassembled C_PDU into the encoded UNIDATA_INDICATION for its
/// destination SAP. The caller still has to find the bound client; an
/// unbound SAP means the delivery is discarded there.
pub fn indication_from_c_pdu(
    c_pdu: &[u8],
    src_addr: S5066Addr,
    dst_addr: S5066Addr,
    tx_mode: TxMode,
    expedited: bool,
) -> Result<(u8, Vec<u8>), &'static str> {
    let parsed = parse_c_pdu(c_pdu)?;
    let encoded = encode_unidata_indication(&UnidataIndication {
        dst_sap: parsed.dst_sap,
        src_sap: parsed.src_sap,
        dst_addr,
        src_addr,
        priority: parsed.priority,
        delivery_mode: 0,
        tx_mode,
        expedited,
        payload: parsed.u_pdu,
    });
    Ok((parsed.dst_sap, encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_c_pdu_round_trip() {
        let c_pdu = make_c_pdu(3, 7, 2, b"hello");
        let parsed = parse_c_pdu(&c_pdu).unwrap();
        assert_eq!(parsed.src_sap, 3);
        assert_eq!(parsed.dst_sap, 7);
        assert_eq!(parsed.priority, 2);
        assert_eq!(parsed.u_pdu, b"hello");
    }

    #[test]
    fn test_c_pdu_too_short() {
        assert!(parse_c_pdu(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_2500_byte_c_pdu_segments() {
        let bounds: Vec<(usize, usize)> = segments(2500, SEG_SIZE).collect();
        assert_eq!(bounds, vec![(0, 800), (800, 800), (1600, 800), (2400, 100)]);
    }

    #[rstest]
    #[case::exact_multiple(1600, vec![(0, 800), (800, 800)])]
    #[case::single(1, vec![(0, 1)])]
    #[case::one_full(800, vec![(0, 800)])]
    fn test_segment_bounds(#[case] total: usize, #[case] expected: Vec<(usize, usize)>) {
        assert_eq!(segments(total, SEG_SIZE).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_id_space_wraps_at_4096() {
        let mut ids = CPduIdSpace::default();
        for expected in 0..=MAX_C_PDU_ID {
            assert_eq!(ids.alloc(), expected);
        }
        assert_eq!(ids.alloc(), 0);
    }

    fn request(tx_mode: TxMode, payload_len: usize) -> UnidataRequest {
        UnidataRequest {
            dst_sap: 1,
            dst_addr: crate::addr::S5066Addr::from_u32(1),
            delivery_mode: 0,
            tx_mode,
            expedited: false,
            payload: vec![0; payload_len],
        }
    }

    #[rstest]
    #[case::arq_at_mtu(TxMode::Arq, sis::ARQ_MTU, true)]
    #[case::arq_past_mtu(TxMode::Arq, sis::ARQ_MTU + 1, false)]
    #[case::non_arq_at_limit(TxMode::NonArq, MAX_C_PDU - C_PDU_HDR, true)]
    #[case::non_arq_past_limit(TxMode::NonArq, MAX_C_PDU - C_PDU_HDR + 1, false)]
    #[case::broadcast_small(TxMode::Broadcast, 100, true)]
    fn test_validate_submission(
        #[case] tx_mode: TxMode,
        #[case] payload_len: usize,
        #[case] ok: bool,
    ) {
        assert_eq!(validate_submission(&request(tx_mode, payload_len)).is_ok(), ok);
    }

    #[test]
    fn test_indication_routes_by_destination_sap() {
        let c_pdu = make_c_pdu(2, 9, 0, b"data");
        let (dst_sap, encoded) = indication_from_c_pdu(
            &c_pdu,
            crate::addr::S5066Addr::from_u32(1),
            crate::addr::S5066Addr::from_u32(2),
            TxMode::NonArq,
            false,
        )
        .unwrap();

        assert_eq!(dst_sap, 9);
        assert_eq!(&encoded[..3], &sis::PREAMBLE);
        assert_eq!(&encoded[encoded.len() - 4..], b"data");
    }
}
