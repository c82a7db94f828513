//! End-to-end Req/Resp tests over real loopback QUIC: two full network
//! stacks, one serving blocks, one requesting them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pharos::messages::{
    BlocksByRootRequest, HandlerError, Request, Response, ResponseItem, SupportedProtocol,
};
use pharos::network::{Network, StaticChain};
use pharos::{
    ForkTable, GoodbyeReason, Keypair, NetworkConfig, PeerAddress, PeerId, Protocol,
    StaticDiscovery, StatusMessage,
};

const FORK_DIGEST: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
const WAIT: Duration = Duration::from_secs(10);

fn status_for(digest: [u8; 4]) -> StatusMessage {
    StatusMessage {
        fork_digest: digest,
        finalized_root: [0u8; 32],
        finalized_epoch: 0,
        head_root: [0u8; 32],
        head_slot: 100,
    }
}

async fn spawn_node(
    digest: [u8; 4],
    protocols: Vec<Arc<dyn Protocol>>,
) -> (Network, tokio::sync::mpsc::Receiver<pharos::GossipMessage>) {
    let chain = Arc::new(StaticChain {
        epoch: 0,
        status: status_for(digest),
    });
    let (network, rx) = Network::spawn(
        NetworkConfig::default(),
        Keypair::generate(),
        "127.0.0.1:0".parse().unwrap(),
        ForkTable::single(digest),
        chain,
        Arc::new(StaticDiscovery::new(Vec::new())),
        protocols,
    )
    .await
    .expect("network spawn");
    network.start().await;
    (network, rx)
}

async fn connect(dialer: &Network, target: &Network) {
    let address = PeerAddress::new(
        target.local_peer_id(),
        vec![target.listen_addr().unwrap()],
    );
    assert!(dialer.dial(address).await, "dial enqueued");
    wait_until(WAIT, || async {
        dialer.pool_status().await.0 == 1 && target.pool_status().await.0 == 1
    })
    .await
    .expect("both nodes connected");
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

/// Serves beacon blocks by root from an in-memory store.
struct BlockStore {
    blocks: HashMap<[u8; 32], Vec<u8>>,
}

#[async_trait]
impl Protocol for BlockStore {
    fn name(&self) -> &'static str {
        "block_store"
    }

    fn rpc_protocols(&self) -> &'static [SupportedProtocol] {
        &[SupportedProtocol::BlocksByRootV2]
    }

    async fn handle_request(
        &self,
        _network: &Network,
        _peer: PeerId,
        _rpc: SupportedProtocol,
        request: Request,
    ) -> Result<Vec<ResponseItem>, HandlerError> {
        let Request::BlocksByRoot(req) = request else {
            return Err(HandlerError::InvalidInputs("unexpected request".into()));
        };
        let mut items = Vec::new();
        for root in &req.roots {
            match self.blocks.get(root) {
                Some(block) => {
                    items.push(ResponseItem::with_context(FORK_DIGEST, block.clone()))
                }
                None => {
                    return Err(HandlerError::ResourceUnavailable(format!(
                        "unknown root {}",
                        hex::encode(root)
                    )))
                }
            }
        }
        Ok(items)
    }
}

#[tokio::test]
async fn blocks_by_root_round_trip() {
    let root = [7u8; 32];
    let block_bytes = vec![0xb0u8; 4096];

    let store = BlockStore {
        blocks: HashMap::from([(root, block_bytes.clone())]),
    };
    let (server, _rx_b) = spawn_node(FORK_DIGEST, vec![Arc::new(store)]).await;
    let (client, _rx_a) = spawn_node(FORK_DIGEST, Vec::new()).await;

    connect(&client, &server).await;

    let response = client
        .send_request(
            server.local_peer_id(),
            Request::BlocksByRoot(BlocksByRootRequest { roots: vec![root] }),
        )
        .await
        .expect("request succeeds");

    match response {
        Response::Chunks(items) => {
            assert_eq!(items.len(), 1, "exactly one success chunk");
            assert_eq!(items[0].payload, block_bytes);
            assert_eq!(items[0].context, Some(FORK_DIGEST));
        }
        other => panic!("unexpected response {other:?}"),
    }

    // Successful handshake plus a served request leaves a positive score.
    let info = client
        .peer_snapshot()
        .await
        .into_iter()
        .find(|p| p.peer_id == server.local_peer_id())
        .expect("server tracked");
    assert!(info.score > 0, "score should be positive, got {}", info.score);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn missing_block_yields_resource_unavailable() {
    let store = BlockStore {
        blocks: HashMap::new(),
    };
    let (server, _rx_b) = spawn_node(FORK_DIGEST, vec![Arc::new(store)]).await;
    let (client, _rx_a) = spawn_node(FORK_DIGEST, Vec::new()).await;

    connect(&client, &server).await;

    let err = client
        .send_request(
            server.local_peer_id(),
            Request::BlocksByRoot(BlocksByRootRequest {
                roots: vec![[1u8; 32]],
            }),
        )
        .await
        .expect_err("unknown root is an error");
    match err {
        pharos::ReqRespError::ReceivedErrorResponse { code, .. } => {
            assert_eq!(code, pharos::ResponseCode::ResourceUnavailable);
        }
        other => panic!("unexpected error {other:?}"),
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn metadata_exchange_round_trip() {
    let (server, _rx_b) = spawn_node(FORK_DIGEST, Vec::new()).await;
    let (client, _rx_a) = spawn_node(FORK_DIGEST, Vec::new()).await;

    // Server subscribes to some attnets before the exchange.
    let mut attnets = pharos::Bitfield::attnets();
    attnets.set(3, true);
    attnets.set(41, true);
    assert!(server.update_attnets(attnets).await);

    connect(&client, &server).await;

    let response = client
        .send_request(server.local_peer_id(), Request::Metadata)
        .await
        .expect("metadata request succeeds");
    match response {
        Response::Metadata(metadata) => {
            assert_eq!(metadata.seq_number, 1);
            assert!(metadata.attnets.get(3));
            assert!(metadata.attnets.get(41));
            assert!(!metadata.attnets.get(4));
        }
        other => panic!("unexpected response {other:?}"),
    }

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn ping_returns_metadata_seq() {
    let (server, _rx_b) = spawn_node(FORK_DIGEST, Vec::new()).await;
    let (client, _rx_a) = spawn_node(FORK_DIGEST, Vec::new()).await;
    connect(&client, &server).await;

    let response = client
        .send_request(server.local_peer_id(), Request::Ping(0))
        .await
        .expect("ping succeeds");
    assert_eq!(response, Response::Pong(0));

    // Bump the server's metadata; the next pong reflects it.
    let mut syncnets = pharos::Bitfield::syncnets();
    syncnets.set(1, true);
    server.update_syncnets(syncnets).await;

    let response = client
        .send_request(server.local_peer_id(), Request::Ping(0))
        .await
        .expect("ping succeeds");
    assert_eq!(response, Response::Pong(1));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn fork_digest_mismatch_disconnects_as_irrelevant() {
    let (server, _rx_b) = spawn_node([0x11, 0x11, 0x11, 0x11], Vec::new()).await;
    let (client, _rx_a) = spawn_node([0x22, 0x22, 0x22, 0x22], Vec::new()).await;

    let address = PeerAddress::new(
        server.local_peer_id(),
        vec![server.listen_addr().unwrap()],
    );
    assert!(client.dial(address.clone()).await);

    // The handshake must fail; neither side admits the other.
    wait_until(WAIT, || async {
        client
            .peer_snapshot()
            .await
            .iter()
            .any(|p| p.peer_id == server.local_peer_id())
    })
    .await
    .expect("peer observed");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.pool_status().await.0, 0);
    assert_eq!(server.pool_status().await.0, 0);

    // Redial attempts are suppressed by the seen table (24 h TTL for an
    // irrelevant network).
    assert!(client.dial(address).await);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.pool_status().await.0, 0, "reconnect suppressed");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn explicit_disconnect_sends_goodbye() {
    let (server, _rx_b) = spawn_node(FORK_DIGEST, Vec::new()).await;
    let (client, _rx_a) = spawn_node(FORK_DIGEST, Vec::new()).await;
    connect(&client, &server).await;

    client
        .disconnect(server.local_peer_id(), GoodbyeReason::IrrelevantNetwork)
        .await;

    wait_until(WAIT, || async {
        client.pool_status().await.0 == 0 && server.pool_status().await.0 == 0
    })
    .await
    .expect("both sides drop the connection");

    client.stop().await;
    server.stop().await;
}
