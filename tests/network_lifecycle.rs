//! Network lifecycle integration: connect, gossip across the wire,
//! duplicate dials, clean shutdown.

use std::sync::Arc;
use std::time::Duration;

use pharos::gossip::{GossipKind, GossipTopic, ValidationResult, Validator};
use pharos::network::{Network, StaticChain};
use pharos::{
    ForkTable, GossipMessage, Keypair, NetworkConfig, PeerAddress, StaticDiscovery, StatusMessage,
};

const FORK_DIGEST: [u8; 4] = [0xca, 0xfe, 0xba, 0xbe];
const WAIT: Duration = Duration::from_secs(10);

async fn spawn_node() -> (Network, tokio::sync::mpsc::Receiver<GossipMessage>) {
    let chain = Arc::new(StaticChain {
        epoch: 0,
        status: StatusMessage {
            fork_digest: FORK_DIGEST,
            finalized_root: [0u8; 32],
            finalized_epoch: 0,
            head_root: [0u8; 32],
            head_slot: 0,
        },
    });
    let (network, rx) = Network::spawn(
        NetworkConfig::default(),
        Keypair::generate(),
        "127.0.0.1:0".parse().unwrap(),
        ForkTable::single(FORK_DIGEST),
        chain,
        Arc::new(StaticDiscovery::new(Vec::new())),
        Vec::new(),
    )
    .await
    .expect("network spawn");
    network.start().await;
    (network, rx)
}

fn address_of(network: &Network) -> PeerAddress {
    PeerAddress::new(
        network.local_peer_id(),
        vec![network.listen_addr().unwrap()],
    )
}

async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> Result<(), &'static str>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            return Err("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn accept_all() -> Validator {
    Validator::Sync(Arc::new(|_, _| ValidationResult::Accept))
}

#[tokio::test]
async fn connect_and_track_directions() {
    let (a, _rx_a) = spawn_node().await;
    let (b, _rx_b) = spawn_node().await;

    assert!(a.dial(address_of(&b)).await);
    wait_until(WAIT, || async {
        a.pool_status().await == (1, 0, 1) && b.pool_status().await == (1, 1, 0)
    })
    .await
    .expect("directional pool counts");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn gossip_flows_between_nodes() {
    let (a, _rx_a) = spawn_node().await;
    let (b, mut rx_b) = spawn_node().await;

    assert!(a.dial(address_of(&b)).await);
    wait_until(WAIT, || async {
        a.pool_status().await.0 == 1 && b.pool_status().await.0 == 1
    })
    .await
    .expect("connected");

    let topic = GossipTopic::new(FORK_DIGEST, GossipKind::BeaconBlock);
    a.subscribe(topic, accept_all()).await.unwrap();
    b.subscribe(topic, accept_all()).await.unwrap();

    // Subscriptions propagate asynchronously; retry the publish until the
    // peer shows up in the fan-out.
    let payload = b"a fine block".to_vec();
    wait_until(WAIT, || {
        let a = a.clone();
        let payload = payload.clone();
        async move {
            matches!(a.publish(topic, payload).await, Ok(n) if n >= 1)
        }
    })
    .await
    .expect("publish reaches a peer");

    let message = tokio::time::timeout(WAIT, rx_b.recv())
        .await
        .expect("delivery in time")
        .expect("channel open");
    assert_eq!(message.data, payload);
    assert_eq!(message.topic, topic);
    assert_eq!(message.from, a.local_peer_id());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn duplicate_dial_keeps_single_logical_peer() {
    let (a, _rx_a) = spawn_node().await;
    let (b, _rx_b) = spawn_node().await;

    assert!(a.dial(address_of(&b)).await);
    wait_until(WAIT, || async { a.pool_status().await.0 == 1 })
        .await
        .expect("connected");

    // A second dial is suppressed (seen-table cooldown after success) or
    // folded into the existing logical peer; either way the pool stays at
    // one entry.
    assert!(a.dial(address_of(&b)).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.pool_status().await.0, 1);
    assert_eq!(b.pool_status().await.0, 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn self_dial_is_rejected() {
    let (a, _rx_a) = spawn_node().await;
    let self_addr = address_of(&a);
    a.dial(self_addr).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.pool_status().await.0, 0);
    a.stop().await;
}

#[tokio::test]
async fn stop_completes_within_budget() {
    let (a, _rx_a) = spawn_node().await;
    let (b, _rx_b) = spawn_node().await;
    assert!(a.dial(address_of(&b)).await);
    wait_until(WAIT, || async { a.pool_status().await.0 == 1 })
        .await
        .expect("connected");

    let started = std::time::Instant::now();
    a.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(6),
        "stop is bounded by the shutdown budget"
    );

    // The surviving node sees the peer leave.
    wait_until(WAIT, || async { b.pool_status().await.0 == 0 })
        .await
        .expect("peer removed after remote shutdown");
    b.stop().await;
}

#[tokio::test]
async fn metadata_updates_bump_seq_monotonically() {
    let (a, _rx_a) = spawn_node().await;

    assert_eq!(a.local_metadata().await.seq_number, 0);

    let mut attnets = pharos::Bitfield::attnets();
    attnets.set(9, true);
    assert!(a.update_attnets(attnets.clone()).await);
    assert_eq!(a.local_metadata().await.seq_number, 1);

    // Unchanged content does not bump.
    assert!(!a.update_attnets(attnets).await);
    assert_eq!(a.local_metadata().await.seq_number, 1);

    assert!(a.update_custody_count(8).await);
    assert_eq!(a.local_metadata().await.seq_number, 2);

    a.stop().await;
}
