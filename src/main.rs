//! Minimal node runner: bind a network, optionally dial a bootstrap peer,
//! subscribe to the block topic, and log what arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use pharos::gossip::{GossipKind, GossipTopic, ValidationResult, Validator};
use pharos::network::{Network, StaticChain};
use pharos::{
    Bitfield, ForkTable, Keystore, NetworkConfig, PeerAddress, PeerId, StaticDiscovery,
    StatusMessage,
};

#[derive(Parser, Debug)]
#[command(name = "pharos", about = "Beacon-chain p2p networking node")]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:9000")]
    listen: String,

    /// Data directory for the network keystore.
    #[arg(long, default_value = ".pharos")]
    data_dir: PathBuf,

    /// Network key path ("random" for an ephemeral key).
    #[arg(long, default_value = "network.key")]
    key: String,

    /// Keystore password; omit to use the insecure default.
    #[arg(long)]
    password: Option<String>,

    /// Bootstrap peer as <hex peer id>@<addr>.
    #[arg(long)]
    bootstrap: Option<String>,

    /// Fork digest of the network to join (hex, 8 chars).
    #[arg(long, default_value = "deadbeef")]
    fork_digest: String,

    /// Attestation subnets to subscribe to.
    #[arg(long)]
    attnet: Vec<usize>,
}

fn parse_fork_digest(s: &str) -> Result<[u8; 4]> {
    let bytes = hex::decode(s).context("fork digest must be hex")?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("fork digest must be 4 bytes"))
}

fn parse_bootstrap(s: &str) -> Result<PeerAddress> {
    let (id_hex, addr) = s
        .split_once('@')
        .context("bootstrap must be <peer id>@<addr>")?;
    let peer_id = PeerId::from_hex(id_hex)?;
    let addr = addr.parse().context("invalid bootstrap address")?;
    Ok(PeerAddress::new(peer_id, vec![addr]))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pharos=debug".into()),
        )
        .init();

    let args = Args::parse();
    let fork_digest = parse_fork_digest(&args.fork_digest)?;

    let password = args
        .password
        .as_deref()
        .unwrap_or(pharos::identity::INSECURE_KEYSTORE_PASSWORD);
    let keypair = Keystore::load_or_create(&args.key, &args.data_dir, password)?;

    let chain = Arc::new(StaticChain {
        epoch: 0,
        status: StatusMessage {
            fork_digest,
            finalized_root: [0u8; 32],
            finalized_epoch: 0,
            head_root: [0u8; 32],
            head_slot: 0,
        },
    });

    let (network, mut messages) = Network::spawn(
        NetworkConfig::default(),
        keypair,
        args.listen.parse().context("invalid listen address")?,
        ForkTable::single(fork_digest),
        chain,
        Arc::new(StaticDiscovery::new(Vec::new())),
        Vec::new(),
    )
    .await?;
    network.start().await;
    info!(peer_id = %network.local_peer_id(), addr = %network.listen_addr()?, "node up");

    if let Some(bootstrap) = &args.bootstrap {
        let address = parse_bootstrap(bootstrap)?;
        if !network.dial(address).await {
            warn!("bootstrap dial could not be enqueued");
        }
    }

    if !args.attnet.is_empty() {
        let mut attnets = Bitfield::attnets();
        for subnet in &args.attnet {
            attnets.set(*subnet, true);
        }
        network.update_attnets(attnets).await;
    }

    let accept: Validator = Validator::Sync(Arc::new(|_, _| ValidationResult::Accept));
    network
        .subscribe(GossipTopic::new(fork_digest, GossipKind::BeaconBlock), accept)
        .await?;

    let reader = tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
            info!(
                topic = %message.topic,
                from = %message.from,
                bytes = message.data.len(),
                "gossip message"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    reader.abort();
    network.stop().await;
    Ok(())
}
