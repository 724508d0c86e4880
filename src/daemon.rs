//! Daemon assembly: listeners, the protocol registry and shared state.
//!
//! The daemon owns what is genuinely shared - the PDU pool, the SAP table
//! and the peer router - and hands each accepted socket to the connection
//! driver registered for the listener's protocol tag. Everything per
//! connection lives inside that task.

use crate::config::{DaemonConfig, ProtoTag};
use crate::pdu::{PduPool, PDU_MEM};
use crate::peer::{run_dts_peer, PeerHandle, PeerRouter};
use crate::pid_file::{drop_privileges, PidFile};
use crate::sap::SapTable;
use anyhow::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, error, info, warn};

pub struct Daemon {
    cfg: Arc<DaemonConfig>,
    pool: Arc<PduPool>,
    sap: Arc<SapTable>,
    router: Arc<PeerRouter>,
    next_conn_id: AtomicU64,
}

impl Daemon {
    pub fn new(cfg: DaemonConfig) -> Daemon {
        let pool = Arc::new(PduPool::new(PDU_MEM, cfg.pool_size));
        Daemon {
            cfg: Arc::new(cfg),
            pool,
            sap: Arc::new(SapTable::default()),
            router: Arc::new(PeerRouter::default()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    fn alloc_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run until interrupted. Binding happens up front so a configuration
    /// mistake fails the process before any privileges are dropped.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.cfg.validate()?;

        let mut listeners = Vec::new();
        for spec in &self.cfg.listeners {
            let listener = TcpListener::bind(spec.bind_addr())
                .await
                .with_context(|| format!("binding listener {}", spec.bind_addr()))?;
            info!("listening for {:?} on {}", spec.proto, spec.bind_addr());
            listeners.push((spec.proto, listener));
        }

        let _pid_file = match &self.cfg.pid_file {
            Some(path) => Some(PidFile::create(path)?),
            None => None,
        };
        if let Some((uid, gid)) = self.cfg.user {
            drop_privileges(uid, gid)?;
        }

        for peer in self.cfg.peers.clone() {
            let daemon = self.clone();
            tokio::spawn(async move {
                match TcpStream::connect(peer.connect_addr()).await {
                    Ok(stream) => {
                        info!("connected to peer {}", peer.connect_addr());
                        daemon.dispatch(ProtoTag::Dts, stream).await;
                    }
                    Err(e) => {
                        error!("could not connect to peer {}: {}", peer.connect_addr(), e)
                    }
                }
            });
        }

        for (proto, listener) in listeners {
            let daemon = self.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, from)) => {
                            debug!("accepted {:?} connection from {}", proto, from);
                            let daemon = daemon.clone();
                            tokio::spawn(async move {
                                daemon.dispatch(proto, stream).await;
                            });
                        }
                        Err(e) => {
                            warn!("accept failed on {:?} listener: {}", proto, e);
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            });
        }

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutting down");

        // tell bound clients their binding is gone, then give their writer
        // tasks a moment to get the indication onto the wire
        let unbind = crate::sis::encode_unbind_indication(crate::sis::unbind_reason::SHUTDOWN);
        for sender in self.sap.drain() {
            let _ = sender.send(unbind.clone());
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        Ok(())
    }

    /// The protocol registry: a listener's tag picks the connection driver.
    async fn dispatch(&self, proto: ProtoTag, stream: TcpStream) {
        let conn_id = self.alloc_conn_id();
        match proto {
            ProtoTag::Sis => {
                crate::conn::run_sis_connection(
                    conn_id,
                    stream,
                    self.sap.clone(),
                    self.pool.clone(),
                    self.cfg.clone(),
                    self.router.clone(),
                )
                .await
            }
            ProtoTag::Dts => {
                let (cmds_tx, cmds_rx) = unbounded_channel();
                self.router.register(conn_id, PeerHandle { cmds: cmds_tx });
                run_dts_peer(
                    conn_id,
                    stream,
                    self.sap.clone(),
                    self.pool.clone(),
                    self.cfg.clone(),
                    self.router.clone(),
                    cmds_rx,
                )
                .await
            }
            ProtoTag::TestPing => {
                crate::aux_proto::run_test_ping(conn_id, stream, self.pool.clone()).await
            }
            ProtoTag::Smtp => crate::aux_proto::run_smtp(conn_id, stream, self.pool.clone()).await,
            ProtoTag::Http => crate::aux_proto::run_http(conn_id, stream, self.pool.clone()).await,
        }
    }
}
