//! The SIS client connection: one task per local application.
//!
//! The task owns the connection's read engine, write engine and binding
//! state. Deliveries from peer links arrive as already-encoded SIS PDUs on
//! the connection's channel (registered in the SAP table at BIND time) and
//! are simply queued for writing.

use crate::config::DaemonConfig;
use crate::pdu::{LocalPduCache, PduPool};
use crate::peer::{PeerCmd, PeerRouter, Submission};
use crate::read_engine::ReadEngine;
use crate::sap::{SapBinding, SapTable};
use crate::sis::{self, bind_reject, unidata_reject, SisDecoder, SisEvent};
use crate::write_engine::{PduKind, RequestId, WireWriter, WriteEngine};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, error, info, warn};

/// The I/O-free half of a client connection; the socket loop in
/// [`run_sis_connection`] drives it.
pub struct ClientCore<W: WireWriter> {
    conn_id: u64,
    sap_table: Arc<SapTable>,
    router: Arc<PeerRouter>,
    engine: WriteEngine<W>,
    deliver: UnboundedSender<Vec<u8>>,
    bound_sap: Option<u8>,
    /// The most recent primitive that elicited responses; its responses stay
    /// linked to it until the next one supersedes it.
    cur_request: Option<RequestId>,
    next_request_id: RequestId,
}

impl<W: WireWriter> ClientCore<W> {
    pub fn new(
        conn_id: u64,
        writer: W,
        cache: LocalPduCache,
        sap_table: Arc<SapTable>,
        router: Arc<PeerRouter>,
        deliver: UnboundedSender<Vec<u8>>,
    ) -> ClientCore<W> {
        ClientCore {
            conn_id,
            sap_table,
            router,
            engine: WriteEngine::new(writer, cache),
            deliver,
            bound_sap: None,
            cur_request: None,
            next_request_id: 0,
        }
    }

    fn open_request(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        if let Some(prev) = self.cur_request.replace(id) {
            self.engine.release_request(prev);
        }
        self.engine.open_request(id);
        id
    }

    pub fn bound_sap(&self) -> Option<u8> {
        self.bound_sap
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.engine.n_written, self.engine.n_pdu_out)
    }

    pub fn on_event(&mut self, event: SisEvent) {
        match event {
            SisEvent::BindRequest {
                sap,
                rank,
                service_type,
            } => self.handle_bind(sap, rank, service_type),
            SisEvent::UnbindRequest => {
                if let Some(sap) = self.bound_sap.take() {
                    self.sap_table.unbind(sap, self.conn_id);
                }
            }
            SisEvent::Unidata(request) => self.handle_unidata(request),
            SisEvent::Reject { pdu, reason } => {
                debug!("rejecting client request: {}", reason);
                self.engine.enqueue_bytes(&pdu, PduKind::Plain);
            }
            SisEvent::FatalReject { pdu, reason } => {
                debug!("rejecting client request before close: {}", reason);
                self.engine.enqueue_bytes(&pdu, PduKind::Plain);
            }
        }
    }

    fn handle_bind(&mut self, sap: u8, rank: u8, service_type: u16) {
        let request = self.open_request();
        // a re-bind moves the connection to the new SAP
        if let Some(old) = self.bound_sap.take() {
            self.sap_table.unbind(old, self.conn_id);
        }
        let binding = SapBinding {
            conn_id: self.conn_id,
            rank,
            service_type,
            deliver: self.deliver.clone(),
        };
        match self.sap_table.bind(sap, binding) {
            Ok(()) => {
                info!("connection {} bound to sap {}", self.conn_id, sap);
                self.bound_sap = Some(sap);
                self.engine.enqueue_bytes(
                    &sis::encode_bind_accepted(sap, sis::ARQ_MTU as u16),
                    PduKind::Response { to: request },
                );
            }
            Err(_) => {
                debug!("sap {} already bound - rejecting connection {}", sap, self.conn_id);
                self.engine.enqueue_bytes(
                    &sis::encode_bind_rejected(bind_reject::OCCUPIED),
                    PduKind::Response { to: request },
                );
            }
        }
    }

    fn handle_unidata(&mut self, request: sis::UnidataRequest) {
        let Some(src_sap) = self.bound_sap else {
            debug!("unidata from unbound connection {} - rejecting", self.conn_id);
            self.reject_unidata(&request, unidata_reject::NOT_BOUND);
            return;
        };
        if let Err(reason) = crate::bridge::validate_submission(&request) {
            self.reject_unidata(&request, reason);
            return;
        }
        let Some(peer) = self.router.route(&request.dst_addr) else {
            debug!("no peer link towards {} - rejecting", request.dst_addr);
            self.reject_unidata(&request, unidata_reject::NO_ROUTE);
            return;
        };
        let submission = Submission {
            src_sap,
            dst_sap: request.dst_sap,
            dst_addr: request.dst_addr,
            priority: 0,
            tx_mode: request.tx_mode,
            expedited: request.expedited,
            u_pdu: request.payload,
            reject: Some(self.deliver.clone()),
        };
        if peer.cmds.send(PeerCmd::Submit(submission)).is_err() {
            debug!("peer link went away - delivery dropped");
        }
    }

    fn reject_unidata(&mut self, request: &sis::UnidataRequest, reason: u8) {
        self.engine.enqueue_bytes(
            &sis::encode_unidata_rejected(reason, request.dst_sap, request.payload.len() as u16),
            PduKind::Plain,
        );
    }

    pub fn deliver(&mut self, encoded: &[u8]) {
        self.engine.enqueue_bytes(encoded, PduKind::Plain);
    }

    pub async fn flush(&mut self) -> std::io::Result<bool> {
        self.engine.flush().await
    }

    pub fn close(&mut self) {
        if let Some(sap) = self.bound_sap.take() {
            self.sap_table.unbind(sap, self.conn_id);
        }
        self.sap_table.unbind_all(self.conn_id);
        self.engine.drain();
    }
}

/// Socket loop for one SIS client.
pub async fn run_sis_connection(
    conn_id: u64,
    stream: TcpStream,
    sap_table: Arc<SapTable>,
    pool: Arc<PduPool>,
    _cfg: Arc<DaemonConfig>,
    router: Arc<PeerRouter>,
) {
    let peer = stream.peer_addr().ok();
    let (mut read_half, write_half) = stream.into_split();

    let (deliver_tx, mut deliver_rx) = unbounded_channel();
    let mut read_engine = ReadEngine::new(SisDecoder, LocalPduCache::new(pool.clone(), 8));
    let mut core = ClientCore::new(
        conn_id,
        write_half,
        LocalPduCache::new(pool, 8),
        sap_table,
        router,
        deliver_tx,
    );

    let mut buf = [0u8; 4096];
    let mut events: Vec<SisEvent> = Vec::new();

    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("client {:?} disconnected", peer);
                    break;
                }
                Ok(n) => {
                    let fed = read_engine.feed(&buf[..n], &mut events);
                    for event in events.drain(..) {
                        core.on_event(event);
                    }
                    let flushed = core.flush().await;
                    if let Err(reason) = fed {
                        warn!("closing client {:?}: {}", peer, reason);
                        break;
                    }
                    if let Err(e) = flushed {
                        error!("write error to client {:?}: {}", peer, e);
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("read error from client {:?}: {}", peer, e);
                    break;
                }
            },
            delivery = deliver_rx.recv() => {
                let encoded = delivery.expect("this task holds a sender");
                core.deliver(&encoded);
                if let Err(e) = core.flush().await {
                    error!("write error to client {:?}: {}", peer, e);
                    break;
                }
            }
        }
    }

    core.close();
    let (n_written, n_pdu_out) = core.stats();
    info!(
        "client {:?} done: {} pdus in / {} pdus out ({} bytes in / {} bytes out)",
        peer, read_engine.n_pdu_in, n_pdu_out, read_engine.n_read, n_written
    );
}
