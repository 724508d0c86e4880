//! Auxiliary protocols behind the same decoder contract as SIS and DTS.
//!
//! These exist so a listener spec can bind `test_ping`, `smtp` or `http`
//! endpoints next to the subnetwork ports; they demonstrate that a new
//! protocol plugs into the read engine without touching it. The SMTP and
//! HTTP decoders are deliberately minimal greeting/close implementations -
//! the daemon is not a mail relay or a web server.

use crate::pdu::{LocalPduCache, PduBuf, PduPool};
use crate::read_engine::{DecodeOutcome, ProtocolDecoder, ReadEngine};
use crate::write_engine::{PduKind, WriteEngine};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, error};

const MAX_LINE: usize = 1024;
const MAX_REQUEST_HEAD: usize = 8192;

/// Newline-delimited framing for the line-oriented aux protocols. Emits each
/// line without its terminator.
pub struct LineDecoder;

impl ProtocolDecoder for LineDecoder {
    type Event = Vec<u8>;

    const MIN_PDU_LEN: usize = 1;

    fn decode(&mut self, pdu: &mut PduBuf, events: &mut Vec<Vec<u8>>) -> DecodeOutcome {
        let bytes = pdu.as_ref();
        match bytes.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let line = &bytes[..idx];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                events.push(line.to_vec());
                pdu.pdu_len = Some(idx + 1);
                DecodeOutcome::Consumed
            }
            None if bytes.len() >= MAX_LINE => DecodeOutcome::Close("line too long"),
            None => DecodeOutcome::Need(bytes.len() + 1),
        }
    }
}

/// Frames one HTTP request head (through the blank line); the body, if any,
/// is ignored.
pub struct HttpHeadDecoder;

impl ProtocolDecoder for HttpHeadDecoder {
    type Event = Vec<u8>;

    const MIN_PDU_LEN: usize = 4;

    fn decode(&mut self, pdu: &mut PduBuf, events: &mut Vec<Vec<u8>>) -> DecodeOutcome {
        let bytes = pdu.as_ref();
        match bytes.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(idx) => {
                events.push(bytes[..idx].to_vec());
                pdu.pdu_len = Some(idx + 4);
                DecodeOutcome::Consumed
            }
            None if bytes.len() >= MAX_REQUEST_HEAD => {
                DecodeOutcome::Close("request head too long")
            }
            None => DecodeOutcome::Need(bytes.len() + 1),
        }
    }
}

/// Echo service: every received line comes straight back.
pub async fn run_test_ping(conn_id: u64, stream: TcpStream, pool: Arc<PduPool>) {
    let peer = stream.peer_addr().ok();
    debug!("test_ping connection {} from {:?}", conn_id, peer);
    let (mut read_half, write_half) = stream.into_split();
    let mut read_engine = ReadEngine::new(LineDecoder, LocalPduCache::new(pool.clone(), 4));
    let mut engine = WriteEngine::new(write_half, LocalPduCache::new(pool, 4));
    let mut buf = [0u8; 1024];
    let mut events: Vec<Vec<u8>> = Vec::new();

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if read_engine.feed(&buf[..n], &mut events).is_err() {
                    break;
                }
                for line in events.drain(..) {
                    let mut reply = line;
                    reply.extend_from_slice(b"\r\n");
                    engine.enqueue_bytes(&reply, PduKind::Plain);
                }
                if engine.flush().await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("test_ping read error: {}", e);
                break;
            }
        }
    }
    engine.drain();
}

/// Greeting-only SMTP endpoint: answers politely and accepts nothing.
pub async fn run_smtp(conn_id: u64, stream: TcpStream, pool: Arc<PduPool>) {
    let peer = stream.peer_addr().ok();
    debug!("smtp connection {} from {:?}", conn_id, peer);
    let (mut read_half, write_half) = stream.into_split();
    let mut read_engine = ReadEngine::new(LineDecoder, LocalPduCache::new(pool.clone(), 4));
    let mut engine = WriteEngine::new(write_half, LocalPduCache::new(pool, 4));
    let mut buf = [0u8; 1024];
    let mut events: Vec<Vec<u8>> = Vec::new();

    engine.enqueue_bytes(b"220 hf5066 SMTP service ready\r\n", PduKind::Plain);
    if engine.flush().await.is_err() {
        return;
    }

    'outer: loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if read_engine.feed(&buf[..n], &mut events).is_err() {
                    break;
                }
                for line in events.drain(..) {
                    if line.to_ascii_uppercase().starts_with(b"QUIT") {
                        engine.enqueue_bytes(b"221 closing\r\n", PduKind::Plain);
                        let _ = engine.flush().await;
                        break 'outer;
                    }
                    engine.enqueue_bytes(b"250 ok\r\n", PduKind::Plain);
                }
                if engine.flush().await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("smtp read error: {}", e);
                break;
            }
        }
    }
    engine.drain();
}

/// One-shot HTTP endpoint: answers every request with a status page.
pub async fn run_http(conn_id: u64, stream: TcpStream, pool: Arc<PduPool>) {
    let peer = stream.peer_addr().ok();
    debug!("http connection {} from {:?}", conn_id, peer);
    let (mut read_half, write_half) = stream.into_split();
    let mut read_engine = ReadEngine::new(HttpHeadDecoder, LocalPduCache::new(pool.clone(), 4));
    let mut engine = WriteEngine::new(write_half, LocalPduCache::new(pool, 4));
    let mut buf = [0u8; 1024];
    let mut events: Vec<Vec<u8>> = Vec::new();

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if read_engine.feed(&buf[..n], &mut events).is_err() {
                    break;
                }
                if events.drain(..).next().is_some() {
                    let body = b"hf5066 subnetwork daemon\n";
                    let head = format!(
                        "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
                        body.len()
                    );
                    engine.enqueue_bytes(head.as_bytes(), PduKind::Plain);
                    engine.enqueue_bytes(body, PduKind::Plain);
                    let _ = engine.flush().await;
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("http read error: {}", e);
                break;
            }
        }
    }
    engine.drain();
}
