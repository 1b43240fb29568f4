// Basalt node binary entry point.
//
// This file wires together the replica engine, the UDP transport, and the
// cluster configuration, then runs the single-threaded event loop: socket
// reads and timer firings feed one queue, and every message runs to
// completion inside the replica before the next is taken.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use basalt_mvtso::engine::{
    decode_message, HashPartitioner, Replica, SeedKeyManager, SystemTimeSource, Timestamp,
};
use bytes::BytesMut;
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod config;
mod transport;

use config::ClusterConfig;
use transport::UdpTransport;

/// Maximum datagram size the node will accept.
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "basalt-store", about = "Basalt transactional KV replica")]
struct NodeArgs {
    /// Path to the cluster config (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Shard group this replica belongs to.
    #[arg(long)]
    group: u64,

    /// Replica index within the group.
    #[arg(long)]
    replica: usize,

    /// Optional load file seeding committed data: one `key=value` per line.
    #[arg(long)]
    load: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = NodeArgs::parse();
    let cluster = ClusterConfig::load(&args.config)?;
    let group_cfg = cluster.group_config();
    let params = cluster.to_params()?;

    let local_addr = *cluster
        .groups
        .get(args.group as usize)
        .and_then(|members| members.get(args.replica))
        .with_context(|| {
            format!(
                "replica {}/{} not present in cluster config",
                args.group, args.replica
            )
        })?;

    let socket = Arc::new(
        UdpSocket::bind(local_addr)
            .await
            .with_context(|| format!("binding {local_addr}"))?,
    );
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(UdpTransport::new(
        socket.clone(),
        cluster.groups.clone(),
        events_tx,
    ));
    let key_manager = Arc::new(SeedKeyManager::new(
        cluster.num_processes(),
        cluster.key_seed.as_bytes(),
    ));

    let mut replica = Replica::new(
        group_cfg,
        args.group,
        args.replica,
        params,
        transport,
        key_manager,
        Arc::new(HashPartitioner),
        Arc::new(SystemTimeSource),
    );

    if let Some(load_path) = &args.load {
        let loaded = load_seed_data(&mut replica, load_path)?;
        info!(loaded, path = %load_path.display(), "seeded store");
    }

    info!(
        group = args.group,
        replica = args.replica,
        addr = %local_addr,
        "basalt replica listening"
    );

    let mut buf = BytesMut::zeroed(MAX_DATAGRAM);
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf[..]) => {
                let (len, from) = match received {
                    Ok(ok) => ok,
                    Err(err) => {
                        warn!(error = %err, "socket receive failed");
                        continue;
                    }
                };
                match decode_message(&buf[..len]) {
                    Ok(msg) => replica.receive(from, msg),
                    Err(err) => debug!(from = %from, error = %err, "undecodable datagram"),
                }
            }
            event = events_rx.recv() => {
                // The sender side lives in the transport; it cannot close
                // while the transport is alive.
                let Some((from, msg)) = event else { break };
                replica.receive(from, msg);
            }
        }
    }

    Ok(())
}

/// Seed the store from a `key=value` lines file. All seeded versions commit
/// at the zero timestamp under the genesis proof.
fn load_seed_data(replica: &mut Replica, path: &PathBuf) -> anyhow::Result<usize> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading load file {}", path.display()))?;
    let mut loaded = 0usize;
    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("malformed load line {}", line_no + 1))?;
        replica.load(key.as_bytes(), value.as_bytes().to_vec(), Timestamp::zero());
        loaded += 1;
    }
    Ok(loaded)
}
