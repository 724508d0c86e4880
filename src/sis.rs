//! SIS - the Subnetwork Interface Sublayer (STANAG 5066 Annex A).
//!
//! This is the client-facing primitive protocol. Every PDU starts with the
//! preamble `90 EB 00` followed by a big-endian u16 length of everything
//! after the 5-byte header; the first body byte is the primitive opcode.
//!
//! The daemon is the server side: it parses requests (BIND, UNBIND, UNIDATA
//! and the expedited variant) and emits indications and accept/reject
//! replies. A local client that violates framing is closed - unlike the HF
//! link there is no ARQ to recover it, and a misbehaving local process should
//! find out immediately.

use crate::addr::S5066Addr;
use crate::pdu::PduBuf;
use crate::read_engine::{DecodeOutcome, ProtocolDecoder};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const PREAMBLE: [u8; 3] = [0x90, 0xeb, 0x00];
/// Preamble plus length field.
pub const MIN_PDU: usize = 5;
pub const MAX_PDU: usize = 8192;
/// Fixed UNIDATA_REQUEST header, opcode through U_PDU length.
pub const UNIDATA_HDR: usize = 12;
/// Fixed UNIDATA_INDICATION header, opcode through U_PDU length.
pub const INDICATION_HDR: usize = 17;
/// Upper bound for a broadcast (Non-ARQ) U_PDU.
pub const BCAST_MTU: usize = 4096;
/// MTU negotiated at BIND time, binding for the ARQ path.
pub const ARQ_MTU: usize = 2048;

#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SisOp {
    BindRequest = 0x01,
    UnbindRequest = 0x02,
    BindAccepted = 0x03,
    BindRejected = 0x04,
    UnbindIndication = 0x05,
    UnidataRequest = 0x14,
    UnidataIndication = 0x15,
    UnidataConfirm = 0x16,
    UnidataRejected = 0x17,
    ExpeditedUnidataRequest = 0x18,
    ExpeditedUnidataIndication = 0x19,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TxMode {
    Arq = 0,
    NonArq = 1,
    Broadcast = 2,
}

/// Reason codes carried in BIND_REJECTED.
pub mod bind_reject {
    pub const OCCUPIED: u8 = 1;
    pub const MALFORMED: u8 = 2;
    pub const NOT_ENOUGH_RESOURCES: u8 = 3;
}

/// Reason codes carried in UNIDATA_REQUEST_REJECTED.
pub mod unidata_reject {
    pub const TOO_LONG: u8 = 1;
    pub const MODE_UNSUPPORTED: u8 = 2;
    pub const CONGESTION: u8 = 3;
    pub const NO_ROUTE: u8 = 4;
    pub const NOT_BOUND: u8 = 5;
}

/// Reason codes carried in UNBIND_INDICATION.
pub mod unbind_reason {
    pub const SHUTDOWN: u8 = 1;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnidataRequest {
    pub dst_sap: u8,
    pub dst_addr: S5066Addr,
    pub delivery_mode: u8,
    pub tx_mode: TxMode,
    pub expedited: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SisEvent {
    BindRequest { sap: u8, rank: u8, service_type: u16 },
    UnbindRequest,
    Unidata(UnidataRequest),
    /// A well-specified rejection: send `pdu` and keep the connection.
    Reject { pdu: Vec<u8>, reason: &'static str },
    /// Send `pdu`, then the engine closes the connection.
    FatalReject { pdu: Vec<u8>, reason: &'static str },
}

/// Stateless framing and primitive parser. Per-connection binding state
/// lives with the connection, not here.
pub struct SisDecoder;

impl ProtocolDecoder for SisDecoder {
    type Event = SisEvent;

    const MIN_PDU_LEN: usize = MIN_PDU;

    fn decode(&mut self, pdu: &mut PduBuf, events: &mut Vec<SisEvent>) -> DecodeOutcome {
        let (pdu_len, outcome) = Self::decode_framed(pdu.as_ref(), events);
        if let Some(total) = pdu_len {
            pdu.pdu_len = Some(total);
        }
        outcome
    }
}

impl SisDecoder {
    /// Framing plus primitive dispatch; returns the PDU's total length once
    /// it is known so the caller can record it for overflow splitting.
    fn decode_framed(bytes: &[u8], events: &mut Vec<SisEvent>) -> (Option<usize>, DecodeOutcome) {
        if bytes.len() < MIN_PDU {
            return (None, DecodeOutcome::Need(MIN_PDU));
        }
        if bytes[..3] != PREAMBLE {
            return (None, DecodeOutcome::Close("bad sis preamble"));
        }
        let body_len = u16::from_be_bytes([bytes[3], bytes[4]]) as usize;
        let total = MIN_PDU + body_len;
        if total > MAX_PDU {
            return (None, DecodeOutcome::Close("sis pdu exceeds maximum size"));
        }
        if bytes.len() < total {
            return (None, DecodeOutcome::Need(total));
        }

        if body_len == 0 {
            return (Some(total), DecodeOutcome::Discard("empty sis pdu"));
        }
        let body = &bytes[MIN_PDU..total];
        (Some(total), Self::dispatch(body, events))
    }

    fn dispatch(body: &[u8], events: &mut Vec<SisEvent>) -> DecodeOutcome {
        let op = match SisOp::try_from(body[0]) {
            Ok(op) => op,
            Err(_) => return DecodeOutcome::Discard("unknown sis primitive"),
        };

        match op {
            SisOp::BindRequest => {
                if body.len() < 4 {
                    events.push(SisEvent::FatalReject {
                        pdu: encode_bind_rejected(bind_reject::MALFORMED),
                        reason: "short bind request",
                    });
                    return DecodeOutcome::Close("short bind request");
                }
                events.push(SisEvent::BindRequest {
                    sap: (body[1] >> 4) & 0x0f,
                    rank: body[1] & 0x0f,
                    service_type: u16::from_be_bytes([body[2], body[3]]),
                });
                DecodeOutcome::Consumed
            }
            SisOp::UnbindRequest => {
                events.push(SisEvent::UnbindRequest);
                DecodeOutcome::Consumed
            }
            SisOp::UnidataRequest => Self::parse_unidata(body, false, events),
            SisOp::ExpeditedUnidataRequest => Self::parse_unidata(body, true, events),
            SisOp::BindAccepted
            | SisOp::BindRejected
            | SisOp::UnbindIndication
            | SisOp::UnidataIndication
            | SisOp::UnidataConfirm
            | SisOp::UnidataRejected
            | SisOp::ExpeditedUnidataIndication => {
                DecodeOutcome::Discard("indication primitive not valid from a client")
            }
        }
    }
}

impl SisDecoder {
    fn parse_unidata(body: &[u8], expedited: bool, events: &mut Vec<SisEvent>) -> DecodeOutcome {
        if body.len() < UNIDATA_HDR {
            return DecodeOutcome::Close("short unidata request");
        }
        let dst_sap = body[1] & 0x0f;
        let dst_addr = S5066Addr::from_u32(u32::from_be_bytes([body[2], body[3], body[4], body[5]]));
        let delivery_mode = body[6];
        let u_pdu_len = u16::from_be_bytes([body[10], body[11]]) as usize;
        if body.len() != UNIDATA_HDR + u_pdu_len {
            return DecodeOutcome::Close("unidata length inconsistent with pdu length");
        }
        if u_pdu_len > BCAST_MTU {
            events.push(SisEvent::Reject {
                pdu: encode_unidata_rejected(unidata_reject::TOO_LONG, dst_sap, u_pdu_len as u16),
                reason: "u_pdu exceeds broadcast mtu",
            });
            return DecodeOutcome::Consumed;
        }
        let tx_mode = match TxMode::try_from(body[7]) {
            Ok(mode) => mode,
            Err(_) => {
                events.push(SisEvent::Reject {
                    pdu: encode_unidata_rejected(
                        unidata_reject::MODE_UNSUPPORTED,
                        dst_sap,
                        u_pdu_len as u16,
                    ),
                    reason: "unsupported transmission mode",
                });
                return DecodeOutcome::Consumed;
            }
        };
        events.push(SisEvent::Unidata(UnidataRequest {
            dst_sap,
            dst_addr,
            delivery_mode,
            tx_mode,
            expedited,
            payload: body[UNIDATA_HDR..].to_vec(),
        }));
        DecodeOutcome::Consumed
    }
}

fn with_header(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MIN_PDU + body.len());
    out.extend_from_slice(&PREAMBLE);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn encode_bind_accepted(sap: u8, mtu: u16) -> Vec<u8> {
    let mtu = mtu.to_be_bytes();
    with_header(&[SisOp::BindAccepted.into(), sap << 4, mtu[0], mtu[1]])
}

pub fn encode_bind_rejected(reason: u8) -> Vec<u8> {
    with_header(&[SisOp::BindRejected.into(), reason])
}

pub fn encode_unbind_indication(reason: u8) -> Vec<u8> {
    with_header(&[SisOp::UnbindIndication.into(), reason])
}

pub fn encode_unidata_rejected(reason: u8, dst_sap: u8, u_pdu_len: u16) -> Vec<u8> {
    let len = u_pdu_len.to_be_bytes();
    with_header(&[SisOp::UnidataRejected.into(), reason, dst_sap, len[0], len[1]])
}

pub struct UnidataIndication<'a> {
    pub dst_sap: u8,
    pub src_sap: u8,
    pub dst_addr: S5066Addr,
    pub src_addr: S5066Addr,
    pub priority: u8,
    pub delivery_mode: u8,
    pub tx_mode: TxMode,
    pub expedited: bool,
    pub payload: &'a [u8],
}

pub fn encode_unidata_indication(ind: &UnidataIndication) -> Vec<u8> {
    let op = if ind.expedited {
        SisOp::ExpeditedUnidataIndication
    } else {
        SisOp::UnidataIndication
    };
    let mut body = Vec::with_capacity(INDICATION_HDR + ind.payload.len());
    body.push(op.into());
    body.push((ind.src_sap << 4) | (ind.dst_sap & 0x0f));
    body.extend_from_slice(&ind.dst_addr.to_u32().to_be_bytes());
    body.extend_from_slice(&ind.src_addr.to_u32().to_be_bytes());
    body.push(ind.priority);
    body.push(ind.delivery_mode);
    body.push(ind.tx_mode.into());
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(&(ind.payload.len() as u16).to_be_bytes());
    body.extend_from_slice(ind.payload);
    with_header(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{LocalPduCache, PduPool};
    use crate::read_engine::ReadEngine;
    use rstest::rstest;
    use std::sync::Arc;

    fn engine() -> ReadEngine<SisDecoder> {
        let pool = Arc::new(PduPool::new(crate::pdu::PDU_MEM, 16));
        ReadEngine::new(SisDecoder, LocalPduCache::new(pool, 4))
    }

    fn feed_ok(bytes: &[u8]) -> Vec<SisEvent> {
        let mut engine = engine();
        let mut events = Vec::new();
        engine.feed(bytes, &mut events).unwrap();
        events
    }

    #[test]
    fn test_bind_request_handshake_bytes() {
        // SAP 3, rank 0, service type 0
        let events = feed_ok(&[0x90, 0xeb, 0x00, 0x00, 0x04, 0x01, 0x30, 0x00, 0x00]);
        assert_eq!(
            events,
            vec![SisEvent::BindRequest {
                sap: 3,
                rank: 0,
                service_type: 0
            }]
        );
    }

    #[test]
    fn test_bind_accepted_bytes() {
        assert_eq!(
            encode_bind_accepted(3, 2048),
            vec![0x90, 0xeb, 0x00, 0x00, 0x04, 0x03, 0x30, 0x08, 0x00]
        );
    }

    #[test]
    fn test_bind_rejected_bytes() {
        assert_eq!(
            encode_bind_rejected(bind_reject::OCCUPIED),
            vec![0x90, 0xeb, 0x00, 0x00, 0x02, 0x04, 0x01]
        );
    }

    #[rstest]
    #[case::byte0(&[0x91, 0xeb, 0x00, 0x00, 0x00])]
    #[case::byte1(&[0x90, 0xec, 0x00, 0x00, 0x00])]
    #[case::byte2(&[0x90, 0xeb, 0x01, 0x00, 0x00])]
    fn test_preamble_mismatch_closes(#[case] bytes: &[u8]) {
        let mut engine = engine();
        let mut events = Vec::new();
        assert_eq!(engine.feed(bytes, &mut events), Err("bad sis preamble"));
    }

    #[test]
    fn test_oversized_declared_length_closes() {
        // body length 8188 would exceed the 8192-byte ceiling by one
        let mut engine = engine();
        let mut events = Vec::new();
        assert_eq!(
            engine.feed(&[0x90, 0xeb, 0x00, 0x1f, 0xfc], &mut events),
            Err("sis pdu exceeds maximum size")
        );
    }

    #[test]
    fn test_maximum_pdu_accepted_at_limit() {
        // body length 8187 is exactly the 8192-byte ceiling
        let mut pdu = vec![0x90, 0xeb, 0x00, 0x1f, 0xfb, u8::from(SisOp::UnbindRequest)];
        pdu.resize(8192, 0);
        let events = feed_ok(&pdu);
        assert_eq!(events, vec![SisEvent::UnbindRequest]);
    }

    #[test]
    fn test_short_bind_rejects_then_closes() {
        let mut engine = engine();
        let mut events = Vec::new();
        let result = engine.feed(&[0x90, 0xeb, 0x00, 0x00, 0x02, 0x01, 0x30], &mut events);

        assert_eq!(result, Err("short bind request"));
        assert_eq!(
            events,
            vec![SisEvent::FatalReject {
                pdu: encode_bind_rejected(bind_reject::MALFORMED),
                reason: "short bind request",
            }]
        );
    }

    #[test]
    fn test_unknown_primitive_discarded_connection_survives() {
        let mut engine = engine();
        let mut events = Vec::new();
        engine
            .feed(&[0x90, 0xeb, 0x00, 0x00, 0x01, 0x7a], &mut events)
            .unwrap();
        assert!(events.is_empty());

        // the connection keeps decoding subsequent PDUs
        engine
            .feed(&[0x90, 0xeb, 0x00, 0x00, 0x02, 0x02, 0x00], &mut events)
            .unwrap();
        assert_eq!(events, vec![SisEvent::UnbindRequest]);
    }

    fn unidata_pdu(dst_sap: u8, tx_mode: u8, payload: &[u8]) -> Vec<u8> {
        let mut body = vec![
            u8::from(SisOp::UnidataRequest),
            dst_sap,
            0x00,
            0x00,
            0x00,
            0x07, // destination address 0.0.0.0.0.0.7
            0x00, // delivery mode
            tx_mode,
            0x00,
            0x00, // padding
        ];
        body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        body.extend_from_slice(payload);
        with_header(&body)
    }

    #[test]
    fn test_unidata_request_parses() {
        let events = feed_ok(&unidata_pdu(7, TxMode::NonArq.into(), b"ABC"));
        assert_eq!(
            events,
            vec![SisEvent::Unidata(UnidataRequest {
                dst_sap: 7,
                dst_addr: S5066Addr::from_u32(7),
                delivery_mode: 0,
                tx_mode: TxMode::NonArq,
                expedited: false,
                payload: b"ABC".to_vec(),
            })]
        );
    }

    #[test]
    fn test_expedited_unidata_request_parses() {
        let mut pdu = unidata_pdu(2, TxMode::Arq.into(), b"x");
        pdu[5] = SisOp::ExpeditedUnidataRequest.into();
        let events = feed_ok(&pdu);
        match &events[..] {
            [SisEvent::Unidata(req)] => {
                assert!(req.expedited);
                assert_eq!(req.tx_mode, TxMode::Arq);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_unidata_at_broadcast_mtu_accepted() {
        let payload = vec![0x55; BCAST_MTU];
        let events = feed_ok(&unidata_pdu(1, TxMode::Broadcast.into(), &payload));
        match &events[..] {
            [SisEvent::Unidata(req)] => assert_eq!(req.payload.len(), BCAST_MTU),
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_unidata_past_broadcast_mtu_rejected() {
        let payload = vec![0x55; BCAST_MTU + 1];
        let events = feed_ok(&unidata_pdu(1, TxMode::Broadcast.into(), &payload));
        match &events[..] {
            [SisEvent::Reject { pdu, .. }] => {
                assert_eq!(pdu[5], u8::from(SisOp::UnidataRejected));
                assert_eq!(pdu[6], unidata_reject::TOO_LONG);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_unidata_unknown_tx_mode_rejected() {
        let events = feed_ok(&unidata_pdu(1, 9, b"hi"));
        match &events[..] {
            [SisEvent::Reject { pdu, .. }] => {
                assert_eq!(pdu[6], unidata_reject::MODE_UNSUPPORTED);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_unidata_length_mismatch_closes() {
        let mut pdu = unidata_pdu(1, TxMode::NonArq.into(), b"hello");
        // declared U_PDU length no longer matches the PDU length
        pdu[15] = 0;
        pdu[16] = 2;
        let mut engine = engine();
        let mut events = Vec::new();
        assert_eq!(
            engine.feed(&pdu, &mut events),
            Err("unidata length inconsistent with pdu length")
        );
    }

    #[rstest]
    #[case::single_byte(1)]
    #[case::three_bytes(3)]
    #[case::all_at_once(100)]
    fn test_back_to_back_pdus_chunking_independent(#[case] chunk_len: usize) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x90, 0xeb, 0x00, 0x00, 0x04, 0x01, 0x30, 0x12, 0x30]);
        bytes.extend_from_slice(&[0x90, 0xeb, 0x00, 0x00, 0x02, 0x02, 0x00]);

        let mut engine = engine();
        let mut events = Vec::new();
        for chunk in bytes.chunks(chunk_len) {
            engine.feed(chunk, &mut events).unwrap();
        }

        assert_eq!(
            events,
            vec![
                SisEvent::BindRequest {
                    sap: 3,
                    rank: 0,
                    service_type: 0x1230
                },
                SisEvent::UnbindRequest,
            ]
        );
        assert_eq!(engine.n_pdu_in, 2);
    }

    #[test]
    fn test_unidata_indication_round_trip_layout() {
        let ind = UnidataIndication {
            dst_sap: 3,
            src_sap: 5,
            dst_addr: S5066Addr::from_u32(0x0000_0001),
            src_addr: S5066Addr::from_u32(0x0000_0002),
            priority: 0,
            delivery_mode: 0,
            tx_mode: TxMode::Arq,
            expedited: false,
            payload: b"payload",
        };
        let encoded = encode_unidata_indication(&ind);

        assert_eq!(&encoded[..3], &PREAMBLE);
        assert_eq!(encoded.len(), MIN_PDU + INDICATION_HDR + 7);
        assert_eq!(encoded[5], u8::from(SisOp::UnidataIndication));
        assert_eq!(encoded[6], 0x53);
        assert_eq!(&encoded[encoded.len() - 7..], b"payload");
        // the minimum indication is 22 bytes of header
        assert_eq!(MIN_PDU + INDICATION_HDR, 22);
    }
}
