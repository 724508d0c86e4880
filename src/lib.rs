//! A STANAG 5066 subnetwork daemon for HF radio links.
//!
//! The daemon multiplexes local application clients over slow, unreliable HF
//! links. Clients connect on one port and speak the SIS primitive protocol
//! (Annex A): they BIND to one of 16 service access points and exchange
//! UNIDATA requests and indications. Peer daemons connect on another port
//! and speak the DTS protocol (Annex C): D_PDU frames with dual CRCs
//! carrying segmented C_PDUs, either connectionless (Non-ARQ, recovered by
//! repetition) or reliable (ARQ, a selective-acknowledgement sliding window
//! over an 8-bit sequence space).
//!
//! ## Design
//!
//! * The I/O substrate is shared by every protocol: pool-allocated PDU
//!   buffers, a read engine whose only coupling to a protocol is the "bytes
//!   needed before you may call me again" contract, and a write engine with
//!   scatter/gather queues and partial-write bookkeeping. New protocols
//!   (see [`aux_proto`]) plug in a decoder without touching either engine.
//! * A connection is owned by exactly one task for its whole life; all
//!   per-connection and per-peer protocol state is single-threaded. The
//!   shared structures - the buffer pool, the SAP table, the peer router -
//!   are behind short locks and touched only at well-defined points.
//! * Failure tiers differ by trust: a local client that breaks framing is
//!   closed immediately, while a corrupt frame from the HF link is silently
//!   discarded because ARQ or plain repetition will recover it and a NACK
//!   does not exist in the protocol.
//!
//! The binary (`hf5066d`) wires this together from listener specs like
//! `sis:127.0.0.1:5066` and peer directives like `dts:host:5067`.

pub mod addr;
pub mod aux_proto;
pub mod bridge;
pub mod config;
pub mod conn;
pub mod crc;
pub mod daemon;
pub mod dts;
pub mod pdu;
pub mod peer;
pub mod pid_file;
pub mod read_engine;
pub mod sap;
pub mod sis;
pub mod write_engine;
