use clap::Parser;
use hf5066::config::{parse_user, DaemonConfig, ListenerSpec, PeerSpec};
use hf5066::daemon::Daemon;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;

/// STANAG 5066 HF subnetwork daemon.
///
/// Clients speak the SIS primitive protocol on `sis` listeners; peer daemons
/// exchange D_PDUs on `dts` listeners or over the outbound peer directives.
#[derive(Parser)]
#[command(name = "hf5066d", version)]
struct Args {
    /// Listener spec <proto>:<iface>:<port>; repeatable.
    /// proto is one of sis, dts, smtp, http, test_ping.
    #[arg(short = 'p', long = "port")]
    listeners: Vec<String>,

    /// Drop privileges to <uid>:<gid> once the listeners are bound.
    #[arg(long)]
    user: Option<String>,

    /// Write the process id here; removed on clean shutdown.
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// This node's subnetwork address as a 28-bit number.
    #[arg(long, default_value_t = 1)]
    address: u32,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Outbound peer directives dts:<host>:<port>.
    peers: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut listeners = Vec::new();
    for spec in &args.listeners {
        let spec: ListenerSpec = spec.parse()?;
        listeners.push(spec);
    }
    let mut peers = Vec::new();
    for directive in &args.peers {
        let peer: PeerSpec = directive.parse()?;
        peers.push(peer);
    }

    let mut cfg = DaemonConfig::new(listeners, peers);
    cfg.local_addr = hf5066::addr::S5066Addr::from_u32(args.address);
    cfg.pid_file = args.pid_file;
    if let Some(user) = &args.user {
        cfg.user = Some(parse_user(user)?);
    }

    Arc::new(Daemon::new(cfg)).run().await
}
