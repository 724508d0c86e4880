//! Daemon configuration: listener/peer specs and tuning knobs.

use crate::addr::S5066Addr;
use crate::dts;
use anyhow::bail;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProtoTag {
    Sis,
    Dts,
    Smtp,
    Http,
    TestPing,
}

impl FromStr for ProtoTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ProtoTag> {
        Ok(match s {
            "sis" => ProtoTag::Sis,
            "dts" => ProtoTag::Dts,
            "smtp" => ProtoTag::Smtp,
            "http" => ProtoTag::Http,
            "test_ping" => ProtoTag::TestPing,
            other => bail!("unknown protocol {:?} (expected sis, dts, smtp, http or test_ping)", other),
        })
    }
}

/// A listener description `<proto>:<iface>:<port>`. An empty interface means
/// all interfaces.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ListenerSpec {
    pub proto: ProtoTag,
    pub host: String,
    pub port: u16,
}

impl ListenerSpec {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for ListenerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ListenerSpec> {
        let mut parts = s.splitn(3, ':');
        let (Some(proto), Some(iface), Some(port)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("listener spec {:?} is not <proto>:<iface>:<port>", s);
        };
        let proto = proto.parse()?;
        let host = if iface.is_empty() {
            "0.0.0.0".to_string()
        } else {
            iface.to_string()
        };
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("listener spec {:?} has an invalid port", s))?;
        Ok(ListenerSpec { proto, host, port })
    }
}

/// An outbound peer directive `dts:<host>:<port>`, connected at startup.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PeerSpec {
    pub host: String,
    pub port: u16,
}

impl PeerSpec {
    pub fn connect_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<PeerSpec> {
        let mut parts = s.splitn(3, ':');
        let (Some(proto), Some(host), Some(port)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("peer directive {:?} is not dts:<host>:<port>", s);
        };
        if proto != "dts" {
            bail!("peer directive {:?} must use the dts protocol", s);
        }
        if host.is_empty() {
            bail!("peer directive {:?} is missing a host", s);
        }
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("peer directive {:?} has an invalid port", s))?;
        Ok(PeerSpec {
            host: host.to_string(),
            port,
        })
    }
}

pub fn parse_user(s: &str) -> anyhow::Result<(u32, u32)> {
    let Some((uid, gid)) = s.split_once(':') else {
        bail!("user spec {:?} is not <uid>:<gid>", s);
    };
    Ok((
        uid.parse()
            .map_err(|_| anyhow::anyhow!("invalid uid in {:?}", s))?,
        gid.parse()
            .map_err(|_| anyhow::anyhow!("invalid gid in {:?}", s))?,
    ))
}

pub struct DaemonConfig {
    pub listeners: Vec<ListenerSpec>,
    pub peers: Vec<PeerSpec>,
    pub user: Option<(u32, u32)>,
    pub pid_file: Option<PathBuf>,
    /// This node's subnetwork address, used as the source of outbound D_PDUs.
    pub local_addr: S5066Addr,
    /// Segment size for outbound C_PDUs.
    pub seg_size: usize,
    /// ARQ retransmit timeout. HF round trips are measured in seconds.
    pub retransmit_timeout: Duration,
    /// Incomplete Non-ARQ reassembly slots older than this are purged.
    pub reassembly_max_age: Duration,
    /// Per-SAP backlog of submissions held while the ARQ window is full.
    pub hold_queue_limit: usize,
    /// Buffers retained on the global PDU free list.
    pub pool_size: usize,
}

impl DaemonConfig {
    pub fn new(listeners: Vec<ListenerSpec>, peers: Vec<PeerSpec>) -> DaemonConfig {
        DaemonConfig {
            listeners,
            peers,
            user: None,
            pid_file: None,
            local_addr: S5066Addr::from_u32(1),
            seg_size: dts::SEG_SIZE,
            retransmit_timeout: Duration::from_secs(30),
            reassembly_max_age: Duration::from_secs(600),
            hold_queue_limit: 32,
            pool_size: 256,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listeners.is_empty() && self.peers.is_empty() {
            bail!("nothing to do: no listeners and no peers configured");
        }
        if self.seg_size == 0 || self.seg_size > dts::SEG_SIZE {
            bail!(
                "segment size {} out of range 1..={}",
                self.seg_size,
                dts::SEG_SIZE
            );
        }
        if self.hold_queue_limit == 0 {
            bail!("hold queue limit must be positive");
        }
        Ok(())
    }
}
