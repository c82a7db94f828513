//! # Network Orchestrator
//!
//! Wires the transport, Req/Resp engine, gossip router, connector,
//! discovery adapter, and control loops into one service, in the same
//! handle/actor split used throughout the crate:
//!
//! - [`Network`]: public handle (cheap to clone) — typed requests, gossip
//!   publish/subscribe, disconnects, metadata updates
//! - `NetworkActor`: owns every piece of mutable peer state (peer map,
//!   seen table, pool, quotas, local metadata, node record) and processes
//!   commands sequentially; no locks anywhere in the peer path
//!
//! ## Control loops
//!
//! `start` launches the accept loop, the connector worker pool, the
//! mesh-maintenance loop (scan → subnet-biased discovery → dial/trim), and
//! the metadata pinger. `stop` cancels everything, says goodbye to
//! connected peers, and closes the endpoint and discovery, bounded by a
//! 5 s budget with errors swallowed.
//!
//! ## Failure semantics
//!
//! Connector failures land in the seen table and are never propagated.
//! Req/Resp returns typed results. Gossip broadcast surfaces "no peers" as
//! a soft error. Only mount-time invariants panic.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{Connection, Endpoint};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::codec::ReqRespError;
use crate::config::NetworkConfig;
use crate::connector::{Connector, DialOutcome, Dialer, SeenReason, SeenTable};
use crate::crypto::{
    create_client_config, create_server_config, extract_verified_peer_id, generate_certificate,
    peer_id_to_sni,
};
use crate::discovery::{Discovery, DiscoveryAdapter};
use crate::enr::{Bitfield, Eth2ForkId, LocalNodeRecord, PeerAddress};
use crate::gossip::{
    GossipEvent, GossipMessage, GossipRouter, GossipSender, GossipTopic, GossipWireMessage,
    Validator,
};
use crate::identity::{Keypair, PeerId};
use crate::messages::{
    GoodbyeReason, HandlerError, Request, Response, ResponseItem, StatusMessage,
    SupportedProtocol,
};
use crate::metadata::{ForkTable, LocalMetadata, MetaData, MetadataVersion};
use crate::monitor::{needy_subnets, select_peers_to_trim, TrimCandidate};
use crate::peer::{ConnectOutcome, ConnectionState, Direction, Peer};
use crate::pool::{AdmissionResult, PeerPool};
use crate::registry::{NetworkProtocolStates, Protocol, ProtocolRegistry};
use crate::reqresp::{
    self, action_for_error, handle_inbound_stream, read_protocol_line, InboundHooks,
};
use crate::score::{PeerAction, ScoreTransition, ThrottleCounters, TokenBucket};

/// Stream identifier for gossip control/data streams.
pub const GOSSIP_PROTOCOL_ID: &str = "/pharos/gossip/1";

/// Private goodbye code sent to benign trim victims. Codes at and above
/// 128 are implementation-defined.
pub const GOODBYE_TOO_MANY_PEERS: u64 = 129;

/// Hard bound on one gossip wire frame (compressed payload + envelope).
const MAX_GOSSIP_FRAME: usize = 12 * 1024 * 1024;

/// Command channel capacity of the network actor.
const NETWORK_COMMAND_CHANNEL_SIZE: usize = 1024;

/// Cadence of the metadata pinger's scan; the 30 min per-peer frequency is
/// evaluated against each peer's own timestamps.
const PINGER_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Per-goodbye send budget during disconnect.
const GOODBYE_TIMEOUT: Duration = Duration::from_secs(2);

/// Marker error for a status exchange revealing a different network/fork.
#[derive(Debug)]
pub struct IrrelevantNetworkError;

impl std::fmt::Display for IrrelevantNetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer is on an irrelevant network")
    }
}

impl std::error::Error for IrrelevantNetworkError {}

// ============================================================================
// Chain View
// ============================================================================

/// Narrow read interface to the consumer's chain state; drives status
/// exchanges and fork-dependent wire choices.
pub trait ChainView: Send + Sync + 'static {
    fn current_epoch(&self) -> u64;
    fn local_status(&self) -> StatusMessage;
}

/// Fixed chain view for tests and isolated devnets.
pub struct StaticChain {
    pub epoch: u64,
    pub status: StatusMessage,
}

impl ChainView for StaticChain {
    fn current_epoch(&self) -> u64 {
        self.epoch
    }

    fn local_status(&self) -> StatusMessage {
        self.status
    }
}

// ============================================================================
// Peer Info Snapshot
// ============================================================================

/// Read-only view of one peer, for control loops and operators.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub state: ConnectionState,
    pub direction: Direction,
    pub score: i32,
    pub client: crate::identity::ClientKind,
    pub metadata_seq: Option<u64>,
    pub stability_subnets: usize,
    pub metadata_failures: u32,
    pub last_metadata_at: Option<Instant>,
    pub connected_at: Option<Instant>,
}

// ============================================================================
// Commands
// ============================================================================

enum NetworkCommand {
    ConnectionEstablished {
        peer: PeerId,
        direction: Direction,
        connection: Connection,
    },
    HandshakeFinished {
        peer: PeerId,
        result: std::result::Result<(), GoodbyeReason>,
    },
    ConnectionClosed {
        peer: PeerId,
    },
    RemovePeer {
        peer: PeerId,
    },
    Disconnect {
        peer: PeerId,
        reason: GoodbyeReason,
    },
    /// The peer said goodbye to us: record its reason and drop the
    /// transport without sending a goodbye back.
    RemoteGoodbye {
        peer: PeerId,
        reason: GoodbyeReason,
    },
    ReportPeer {
        peer: PeerId,
        action: PeerAction,
    },
    TryChargeQuota {
        peer: PeerId,
        protocol: SupportedProtocol,
        record_throttle: bool,
        reply: oneshot::Sender<std::result::Result<(), Duration>>,
    },
    PeerUsable {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    GetConnection {
        peer: PeerId,
        reply: oneshot::Sender<Option<Connection>>,
    },
    ShouldDial {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    DialOutcome {
        peer: PeerId,
        outcome: DialOutcome,
    },
    AddPendingDial {
        peer: PeerId,
    },
    KnownPeers {
        reply: oneshot::Sender<HashSet<PeerId>>,
    },
    PeerSnapshot {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    PeerProtocolState {
        peer: PeerId,
        index: usize,
        reply: oneshot::Sender<Option<Arc<dyn std::any::Any + Send + Sync>>>,
    },
    PoolStatus {
        reply: oneshot::Sender<(usize, usize, usize)>,
    },
    SetAgentVersion {
        peer: PeerId,
        agent: String,
    },
    RecordMetadata {
        peer: PeerId,
        metadata: MetaData,
    },
    RecordMetadataFailure {
        peer: PeerId,
    },
    RecordThroughput {
        peer: PeerId,
        bytes: usize,
        elapsed: Duration,
    },
    LocalMetadata {
        reply: oneshot::Sender<MetaData>,
    },
    UpdateAttnets {
        bits: Bitfield,
        reply: oneshot::Sender<bool>,
    },
    UpdateSyncnets {
        bits: Bitfield,
        reply: oneshot::Sender<bool>,
    },
    UpdateCustodyCount {
        csc: u64,
        reply: oneshot::Sender<bool>,
    },
    ThrottleSnapshot {
        reply: oneshot::Sender<Vec<(&'static str, u64)>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Shared Immutable Context
// ============================================================================

struct Shared {
    config: NetworkConfig,
    local_peer_id: PeerId,
    endpoint: Endpoint,
    client_config: quinn::ClientConfig,
    registry: ProtocolRegistry,
    /// Per-network protocol state slots, array-indexed by protocol index.
    network_states: NetworkProtocolStates,
    fork_table: ForkTable,
    chain: Arc<dyn ChainView>,
}

impl Shared {
    fn metadata_v3(&self) -> bool {
        self.fork_table.metadata_version_at(self.chain.current_epoch()) == MetadataVersion::V3
    }

    fn valid_digests(&self) -> Vec<[u8; 4]> {
        self.fork_table.known_digests()
    }
}

// ============================================================================
// Network Handle
// ============================================================================

#[derive(Clone)]
pub struct Network {
    cmd_tx: mpsc::Sender<NetworkCommand>,
    shared: Arc<Shared>,
    gossip: GossipRouter,
    loops: Arc<Mutex<JoinSet<()>>>,
    connector: Arc<Mutex<Option<Connector>>>,
    discovery: Arc<DiscoveryAdapter>,
}

impl Network {
    /// Build the network service: bind the endpoint, mount protocols, spawn
    /// the actor and gossip router. Control loops start with [`start`].
    ///
    /// Mount failures (duplicate protocols) panic; they are setup bugs.
    ///
    /// [`start`]: Network::start
    pub async fn spawn(
        config: NetworkConfig,
        keypair: Keypair,
        listen: SocketAddr,
        fork_table: ForkTable,
        chain: Arc<dyn ChainView>,
        discovery: Arc<dyn Discovery>,
        app_protocols: Vec<Arc<dyn Protocol>>,
    ) -> Result<(Self, mpsc::Receiver<GossipMessage>)> {
        let local_peer_id = keypair.peer_id();

        let (certs, key) = generate_certificate(&keypair)?;
        let server_config = create_server_config(certs, key)?;
        let (client_certs, client_key) = generate_certificate(&keypair)?;
        let client_config = create_client_config(client_certs, client_key)?;

        let endpoint = Endpoint::server(server_config, listen)
            .context("failed to bind network endpoint")?;
        let local_addr = endpoint.local_addr()?;

        let mut registry = ProtocolRegistry::new();
        registry.register(Arc::new(CoreProtocol {
            chain: chain.clone(),
        }));
        for protocol in app_protocols {
            registry.register(protocol);
        }

        let network_states = registry.init_network_states();
        let shared = Arc::new(Shared {
            config: config.clone(),
            local_peer_id,
            endpoint: endpoint.clone(),
            client_config,
            registry,
            network_states,
            fork_table,
            chain,
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(NETWORK_COMMAND_CHANNEL_SIZE);

        let gossip_transport = Arc::new(GossipTransport {
            cmd_tx: cmd_tx.clone(),
        });
        let (gossip, gossip_rx, gossip_events) = GossipRouter::spawn(gossip_transport);

        let discovery = Arc::new(DiscoveryAdapter::new(discovery));

        let network = Network {
            cmd_tx: cmd_tx.clone(),
            shared: shared.clone(),
            gossip: gossip.clone(),
            loops: Arc::new(Mutex::new(JoinSet::new())),
            connector: Arc::new(Mutex::new(None)),
            discovery: discovery.clone(),
        };

        let local_record = LocalNodeRecord::new(
            keypair,
            Eth2ForkId {
                fork_digest: shared
                    .fork_table
                    .digest_at(shared.chain.current_epoch()),
                next_fork_version: [0; 4],
                next_fork_epoch: u64::MAX,
            },
            local_addr,
        );
        discovery.publish_local_record(local_record.record().clone()).await;

        let actor = NetworkActor::new(shared, network.clone(), gossip.clone(), local_record);
        tokio::spawn(actor.run(cmd_rx));

        // Gossip rejections feed peer scoring.
        {
            let network = network.clone();
            tokio::spawn(async move {
                let mut gossip_events = gossip_events;
                while let Some(event) = gossip_events.recv().await {
                    match event {
                        GossipEvent::RejectedMessage { from } => {
                            network.report_peer(from, PeerAction::InvalidRequest).await;
                        }
                    }
                }
            });
        }

        info!(peer_id = %local_peer_id, addr = %local_addr, "network ready");
        Ok((network, gossip_rx))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Launch the accept loop, connector workers, mesh maintenance, and
    /// the metadata pinger.
    pub async fn start(&self) {
        let mut loops = self.loops.lock().await;

        // Accept loop.
        {
            let network = self.clone();
            loops.spawn(async move {
                while let Some(incoming) = network.shared.endpoint.accept().await {
                    let network = network.clone();
                    tokio::spawn(async move {
                        if let Err(e) = network.handle_incoming(incoming).await {
                            debug!(error = %e, "inbound connection failed");
                        }
                    });
                }
            });
        }

        // Connector workers.
        {
            let dialer: Arc<dyn Dialer> = Arc::new(NetworkDialer {
                network: self.clone(),
            });
            let connector = Connector::spawn(
                dialer,
                self.shared.config.concurrent_connections,
                self.shared.config.connect_timeout,
            );
            *self.connector.lock().await = Some(connector);
        }

        // Mesh maintenance: scan, discover, dial, trim.
        {
            let network = self.clone();
            loops.spawn(async move {
                let mut interval =
                    tokio::time::interval(network.shared.config.mesh_scan_interval);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    network.mesh_maintenance_round().await;
                }
            });
        }

        // Metadata pinger.
        {
            let network = self.clone();
            loops.spawn(async move {
                let mut interval = tokio::time::interval(PINGER_SCAN_INTERVAL);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    network.metadata_ping_round().await;
                }
            });
        }
    }

    /// Stop all loops and close the transport. Bounded by the shutdown
    /// timeout; errors are swallowed.
    pub async fn stop(&self) {
        let budget = self.shared.config.shutdown_timeout;
        let _ = tokio::time::timeout(budget, async {
            // Say goodbye and drain the actor.
            let (reply_tx, reply_rx) = oneshot::channel();
            if self
                .cmd_tx
                .send(NetworkCommand::Stop { reply: reply_tx })
                .await
                .is_ok()
            {
                let _ = reply_rx.await;
            }
            self.gossip.quit().await;
            self.discovery.close().await;
        })
        .await;

        if let Some(connector) = self.connector.lock().await.take() {
            connector.shutdown();
        }
        self.loops.lock().await.abort_all();
        self.shared.endpoint.close(0u32.into(), b"shutdown");
        info!("network stopped");
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.shared.local_peer_id
    }

    /// Dense index of a mounted protocol.
    pub fn protocol_index(&self, name: &str) -> Option<usize> {
        self.shared.registry.index_of(name)
    }

    /// Per-network state slot for a protocol index (array access, no map
    /// lookup).
    pub fn network_protocol_state<T: Send + Sync + 'static>(
        &self,
        index: usize,
    ) -> Option<Arc<T>> {
        self.shared.network_states.get::<T>(index)
    }

    /// Per-peer state slot for `(peer, protocol index)`.
    pub async fn peer_protocol_state<T: Send + Sync + 'static>(
        &self,
        peer: PeerId,
        index: usize,
    ) -> Option<Arc<T>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetworkCommand::PeerProtocolState {
                peer,
                index,
                reply: reply_tx,
            })
            .await
            .ok()?;
        let raw = reply_rx.await.ok().flatten()?;
        raw.downcast::<T>().ok()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.shared
            .endpoint
            .local_addr()
            .context("endpoint has no local address")
    }

    // ------------------------------------------------------------------
    // Req/Resp API
    // ------------------------------------------------------------------

    /// Send a typed request to a connected peer. Returns a typed result,
    /// never panics on peer behavior; scoring feedback is applied
    /// internally.
    pub async fn send_request(
        &self,
        peer: PeerId,
        request: Request,
    ) -> std::result::Result<Response, ReqRespError> {
        let protocol = request.protocol(self.shared.metadata_v3());
        let Some(connection) = self.get_connection(peer).await else {
            return Err(ReqRespError::BrokenConnection);
        };

        let opened = tokio::time::timeout(
            self.shared.config.stream_open_timeout,
            connection.open_bi(),
        )
        .await;
        let (mut send, mut recv) = match opened {
            Ok(Ok(streams)) => streams,
            Ok(Err(_)) => {
                self.report_peer(peer, PeerAction::PoorRequest).await;
                return Err(ReqRespError::BrokenConnection);
            }
            Err(_) => {
                self.report_peer(peer, PeerAction::PoorRequest).await;
                return Err(ReqRespError::StreamOpenTimeout);
            }
        };

        let digests = self.shared.valid_digests();
        let started = Instant::now();
        let result = reqresp::send_request_on(
            &mut send,
            &mut recv,
            &request,
            protocol,
            &digests,
            self.shared.config.resp_timeout,
        )
        .await;

        match &result {
            Ok((_, bytes)) => {
                let _ = self
                    .cmd_tx
                    .send(NetworkCommand::RecordThroughput {
                        peer,
                        bytes: *bytes,
                        elapsed: started.elapsed(),
                    })
                    .await;
                self.report_peer(peer, PeerAction::GoodValues).await;
            }
            Err(err) => {
                self.report_peer(peer, action_for_error(err)).await;
            }
        }
        result.map(|(response, _)| response)
    }

    /// Apply a score action; crossing the low limit schedules a
    /// disconnect.
    pub async fn report_peer(&self, peer: PeerId, action: PeerAction) {
        let _ = self
            .cmd_tx
            .send(NetworkCommand::ReportPeer { peer, action })
            .await;
    }

    pub async fn disconnect(&self, peer: PeerId, reason: GoodbyeReason) {
        let _ = self
            .cmd_tx
            .send(NetworkCommand::Disconnect { peer, reason })
            .await;
    }

    // ------------------------------------------------------------------
    // Gossip API
    // ------------------------------------------------------------------

    /// Subscribe with a validator; the topic becomes validated by this
    /// call.
    pub async fn subscribe(&self, topic: GossipTopic, validator: Validator) -> Result<()> {
        self.gossip.subscribe(topic, validator).await
    }

    pub async fn unsubscribe(&self, topic: GossipTopic) -> Result<()> {
        self.gossip.unsubscribe(topic).await
    }

    /// Publish an SSZ payload; `Err` includes the "no peers" soft failure.
    pub async fn publish(&self, topic: GossipTopic, data: Vec<u8>) -> Result<usize> {
        self.gossip.publish(topic, data).await
    }

    // ------------------------------------------------------------------
    // Metadata API
    // ------------------------------------------------------------------

    pub async fn local_metadata(&self) -> MetaData {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NetworkCommand::LocalMetadata { reply: reply_tx })
            .await;
        reply_rx.await.unwrap_or_default()
    }

    /// Update the attestation-subnet bitfield; bumps metadata seq and
    /// republishes the node record when the content changed.
    pub async fn update_attnets(&self, bits: Bitfield) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NetworkCommand::UpdateAttnets {
                bits,
                reply: reply_tx,
            })
            .await;
        reply_rx.await.unwrap_or(false)
    }

    pub async fn update_syncnets(&self, bits: Bitfield) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NetworkCommand::UpdateSyncnets {
                bits,
                reply: reply_tx,
            })
            .await;
        reply_rx.await.unwrap_or(false)
    }

    pub async fn update_custody_count(&self, csc: u64) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NetworkCommand::UpdateCustodyCount {
                csc,
                reply: reply_tx,
            })
            .await;
        reply_rx.await.unwrap_or(false)
    }

    pub async fn set_agent_version(&self, peer: PeerId, agent: String) {
        let _ = self
            .cmd_tx
            .send(NetworkCommand::SetAgentVersion { peer, agent })
            .await;
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub async fn peer_snapshot(&self) -> Vec<PeerInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NetworkCommand::PeerSnapshot { reply: reply_tx })
            .await;
        reply_rx.await.unwrap_or_default()
    }

    /// (connected, incoming, outgoing)
    pub async fn pool_status(&self) -> (usize, usize, usize) {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NetworkCommand::PoolStatus { reply: reply_tx })
            .await;
        reply_rx.await.unwrap_or((0, 0, 0))
    }

    pub async fn throttle_counters(&self) -> Vec<(&'static str, u64)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(NetworkCommand::ThrottleSnapshot { reply: reply_tx })
            .await;
        reply_rx.await.unwrap_or_default()
    }

    /// Enqueue a direct dial (used for bootstrap and direct peers).
    pub async fn dial(&self, address: PeerAddress) -> bool {
        let _ = self
            .cmd_tx
            .send(NetworkCommand::AddPendingDial {
                peer: address.peer_id,
            })
            .await;
        let connector = self.connector.lock().await;
        match connector.as_ref() {
            Some(c) => c.enqueue(address),
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn get_connection(&self, peer: PeerId) -> Option<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetworkCommand::GetConnection {
                peer,
                reply: reply_tx,
            })
            .await
            .ok()?;
        reply_rx.await.ok().flatten()
    }

    async fn handle_incoming(&self, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await.context("inbound handshake failed")?;
        let Some(peer) = extract_verified_peer_id(&connection) else {
            warn!(remote = %connection.remote_address(), "dropping unverifiable inbound peer");
            connection.close(0u32.into(), b"unverified");
            return Ok(());
        };
        self.cmd_tx
            .send(NetworkCommand::ConnectionEstablished {
                peer,
                direction: Direction::Incoming,
                connection,
            })
            .await
            .map_err(|_| anyhow::anyhow!("network actor closed"))
    }

    /// Accept streams on one connection until it dies, then report the
    /// closure.
    async fn connection_task(self, peer: PeerId, connection: Connection) {
        loop {
            match connection.accept_bi().await {
                Ok((send, recv)) => {
                    let network = self.clone();
                    tokio::spawn(async move {
                        network.handle_stream(peer, send, recv).await;
                    });
                }
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => {
                    trace!(peer = %peer, "connection closed");
                    break;
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "connection lost");
                    break;
                }
            }
        }
        let _ = self.cmd_tx.send(NetworkCommand::ConnectionClosed { peer }).await;
    }

    async fn handle_stream(
        &self,
        peer: PeerId,
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
    ) {
        let line = match tokio::time::timeout(
            self.shared.config.request_timeout,
            read_protocol_line(&mut recv),
        )
        .await
        {
            Ok(Ok(line)) => line,
            _ => {
                trace!(peer = %peer, "stream without protocol id");
                return;
            }
        };

        if line == GOSSIP_PROTOCOL_ID {
            self.handle_gossip_stream(peer, recv).await;
            return;
        }

        let Some(protocol) = SupportedProtocol::from_protocol_id(&line) else {
            debug!(peer = %peer, protocol = %line, "unknown protocol id");
            return;
        };

        let hooks: Arc<dyn InboundHooks> = Arc::new(self.clone());
        handle_inbound_stream(
            hooks,
            peer,
            protocol,
            &mut send,
            &mut recv,
            self.shared.config.request_timeout,
        )
        .await;
    }

    async fn handle_gossip_stream(&self, peer: PeerId, mut recv: quinn::RecvStream) {
        use tokio::io::AsyncReadExt;

        let mut len_buf = [0u8; 4];
        if recv.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_GOSSIP_FRAME {
            warn!(peer = %peer, size = len, "oversized gossip frame");
            self.report_peer(peer, PeerAction::InvalidRequest).await;
            return;
        }
        let mut frame = vec![0u8; len];
        if recv.read_exact(&mut frame).await.is_err() {
            return;
        }
        let Ok(message) = bincode::deserialize::<GossipWireMessage>(&frame) else {
            self.report_peer(peer, PeerAction::InvalidRequest).await;
            return;
        };
        self.gossip.handle_wire_message(peer, message).await;
    }

    /// One round of the maintenance loop: mesh scan, discovery, dialing,
    /// trimming.
    async fn mesh_maintenance_round(&self) {
        let snapshot = self.gossip.snapshot().await;
        let (connected, _, _) = self.pool_status().await;

        // Trim first, so discovery does not dial into a full pool.
        let excess = connected.saturating_sub(self.shared.config.target_peers);
        if excess > 0 {
            let peers = self.peer_snapshot().await;
            let candidates: Vec<TrimCandidate> = peers
                .iter()
                .filter(|p| p.state == ConnectionState::Connected)
                .map(|p| TrimCandidate {
                    peer: p.peer_id,
                    stability_subnets: p.stability_subnets,
                    is_direct: self.shared.config.direct_peers.contains(&p.peer_id),
                    metadata_known: p.metadata_seq.is_some(),
                    connected_at: p.connected_at,
                })
                .collect();
            for victim in select_peers_to_trim(&candidates, &snapshot, excess) {
                debug!(peer = %victim, "trimming excess peer");
                self.disconnect(victim, GoodbyeReason::Unknown(GOODBYE_TOO_MANY_PEERS))
                    .await;
            }
        }

        // Discover when below target or when subnets are starved.
        let filter = needy_subnets(&snapshot);
        let deficit = self.shared.config.target_peers.saturating_sub(connected);
        if deficit == 0 && filter.is_empty() {
            return;
        }

        let known = {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self
                .cmd_tx
                .send(NetworkCommand::KnownPeers { reply: reply_tx })
                .await
                .is_err()
            {
                return;
            }
            reply_rx.await.unwrap_or_default()
        };

        let want = deficit.max(4).min(32);
        let candidates = self
            .discovery
            .discover_candidates(&filter, want, &known)
            .await;
        for candidate in candidates {
            let _ = self
                .cmd_tx
                .send(NetworkCommand::AddPendingDial {
                    peer: candidate.peer_id,
                })
                .await;
            let connector = self.connector.lock().await;
            if let Some(c) = connector.as_ref() {
                c.enqueue(candidate);
            }
        }
    }

    /// One round of the metadata pinger: refresh stale or missing
    /// metadata in parallel.
    async fn metadata_ping_round(&self) {
        let frequency = self.shared.config.metadata_request_frequency;
        let peers = self.peer_snapshot().await;
        let mut requests = JoinSet::new();
        for info in peers {
            if info.state != ConnectionState::Connected {
                continue;
            }
            let due = match info.last_metadata_at {
                None => true,
                Some(at) => at.elapsed() >= frequency,
            };
            if !due {
                continue;
            }
            let network = self.clone();
            requests.spawn(async move {
                match network.send_request(info.peer_id, Request::Metadata).await {
                    Ok(Response::Metadata(metadata)) => {
                        let _ = network
                            .cmd_tx
                            .send(NetworkCommand::RecordMetadata {
                                peer: info.peer_id,
                                metadata,
                            })
                            .await;
                    }
                    Ok(_) | Err(_) => {
                        let _ = network
                            .cmd_tx
                            .send(NetworkCommand::RecordMetadataFailure {
                                peer: info.peer_id,
                            })
                            .await;
                    }
                }
            });
        }
        while requests.join_next().await.is_some() {}
    }
}

// ============================================================================
// Hook Implementations (Req/Resp dispatcher, connector)
// ============================================================================

#[async_trait]
impl InboundHooks for Network {
    async fn peer_usable(&self, peer: &PeerId) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(NetworkCommand::PeerUsable {
                peer: *peer,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    async fn charge_quota(&self, peer: &PeerId, protocol: SupportedProtocol) {
        let mut first = true;
        loop {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self
                .cmd_tx
                .send(NetworkCommand::TryChargeQuota {
                    peer: *peer,
                    protocol,
                    record_throttle: first,
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                return;
            }
            match reply_rx.await {
                Ok(Ok(())) => return,
                Ok(Err(wait)) => {
                    first = false;
                    tokio::time::sleep(wait).await;
                }
                Err(_) => return,
            }
        }
    }

    async fn handle_request(
        &self,
        peer: PeerId,
        protocol: SupportedProtocol,
        request: Request,
    ) -> std::result::Result<Vec<ResponseItem>, HandlerError> {
        let Some((_, handler)) = self.shared.registry.handler_for(protocol) else {
            return Err(HandlerError::Internal(anyhow::anyhow!(
                "no handler mounted for {}",
                protocol.protocol_id()
            )));
        };
        handler.handle_request(self, peer, protocol, request).await
    }

    async fn apply_score(&self, peer: &PeerId, action: PeerAction) {
        self.report_peer(*peer, action).await;
    }

    async fn release_peer(&self, peer: &PeerId) {
        // Low-score disconnects are scheduled inside the actor on the
        // crossing update; nothing further to do here but poke it.
        let _ = peer;
    }
}

struct NetworkDialer {
    network: Network,
}

#[async_trait]
impl Dialer for NetworkDialer {
    async fn should_dial(&self, peer: &PeerId) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .network
            .cmd_tx
            .send(NetworkCommand::ShouldDial {
                peer: *peer,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    async fn dial(&self, address: &PeerAddress) -> Result<()> {
        let shared = &self.network.shared;
        let sni = peer_id_to_sni(&address.peer_id);
        let mut last_error = anyhow::anyhow!("no addresses for peer");
        for addr in &address.addresses {
            match shared
                .endpoint
                .connect_with(shared.client_config.clone(), *addr, &sni)
            {
                Ok(connecting) => match connecting.await {
                    Ok(connection) => {
                        // The TLS verifier pinned the certificate to the
                        // dialed id already.
                        self.network
                            .cmd_tx
                            .send(NetworkCommand::ConnectionEstablished {
                                peer: address.peer_id,
                                direction: Direction::Outgoing,
                                connection,
                            })
                            .await
                            .map_err(|_| anyhow::anyhow!("network actor closed"))?;
                        return Ok(());
                    }
                    Err(e) => last_error = e.into(),
                },
                Err(e) => last_error = e.into(),
            }
        }
        Err(last_error)
    }

    async fn record_outcome(&self, peer: &PeerId, outcome: DialOutcome) {
        let _ = self
            .network
            .cmd_tx
            .send(NetworkCommand::DialOutcome {
                peer: *peer,
                outcome,
            })
            .await;
    }
}

// ============================================================================
// Gossip Transport
// ============================================================================

struct GossipTransport {
    cmd_tx: mpsc::Sender<NetworkCommand>,
}

#[async_trait]
impl GossipSender for GossipTransport {
    async fn send(&self, to: PeerId, message: GossipWireMessage) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetworkCommand::GetConnection {
                peer: to,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("network actor closed"))?;
        let connection = reply_rx
            .await
            .ok()
            .flatten()
            .context("peer has no connection")?;

        // Notification writes share the response-timeout budget.
        tokio::time::timeout(crate::config::RESP_TIMEOUT, async {
            let (mut send, _recv) =
                connection.open_bi().await.context("gossip stream open")?;

            let frame = bincode::serialize(&message).context("gossip frame encode")?;
            let mut buf = Vec::with_capacity(1 + GOSSIP_PROTOCOL_ID.len() + 4 + frame.len());
            buf.push(GOSSIP_PROTOCOL_ID.len() as u8);
            buf.extend_from_slice(GOSSIP_PROTOCOL_ID.as_bytes());
            buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            buf.extend_from_slice(&frame);
            send.write_all(&buf).await.context("gossip frame write")?;
            send.shutdown().await.ok();
            Ok(())
        })
        .await
        .map_err(|_| anyhow::anyhow!("gossip write timed out"))?
    }
}

// ============================================================================
// Core Protocol (status, ping, metadata, goodbye)
// ============================================================================

/// Built-in protocol serving the handshake and liveness surface.
struct CoreProtocol {
    chain: Arc<dyn ChainView>,
}

#[async_trait]
impl Protocol for CoreProtocol {
    fn name(&self) -> &'static str {
        "core"
    }

    fn rpc_protocols(&self) -> &'static [SupportedProtocol] {
        &[
            SupportedProtocol::StatusV1,
            SupportedProtocol::GoodbyeV1,
            SupportedProtocol::PingV1,
            SupportedProtocol::MetadataV2,
            SupportedProtocol::MetadataV3,
        ]
    }

    /// Handshake: exchange status; a fork-digest mismatch aborts the
    /// connection as an irrelevant network.
    async fn on_peer_connected(&self, network: &Network, peer: PeerId) -> Result<()> {
        let local = self.chain.local_status();
        let response = network
            .send_request(peer, Request::Status(local))
            .await
            .map_err(|e| anyhow::anyhow!("status exchange failed: {e}"))?;
        let Response::Status(remote) = response else {
            anyhow::bail!("unexpected status response shape");
        };
        if remote.fork_digest != local.fork_digest {
            debug!(
                peer = %peer,
                ours = %hex::encode(local.fork_digest),
                theirs = %hex::encode(remote.fork_digest),
                "fork digest mismatch"
            );
            return Err(IrrelevantNetworkError.into());
        }
        network.report_peer(peer, PeerAction::GoodStatus).await;
        Ok(())
    }

    async fn handle_request(
        &self,
        network: &Network,
        peer: PeerId,
        rpc: SupportedProtocol,
        request: Request,
    ) -> std::result::Result<Vec<ResponseItem>, HandlerError> {
        match request {
            Request::Status(remote) => {
                let local = self.chain.local_status();
                if remote.fork_digest != local.fork_digest {
                    // Respond first, then drop them; they are on another
                    // network.
                    let network = network.clone();
                    tokio::spawn(async move {
                        network
                            .disconnect(peer, GoodbyeReason::IrrelevantNetwork)
                            .await;
                    });
                }
                Ok(vec![ResponseItem::plain(local.to_ssz_bytes())])
            }
            Request::Ping(remote_seq) => {
                let local = network.local_metadata().await;
                // A ping advertising a newer metadata seq means our copy
                // is stale; refresh off the request path.
                let network = network.clone();
                tokio::spawn(async move {
                    let known = network
                        .peer_snapshot()
                        .await
                        .into_iter()
                        .find(|p| p.peer_id == peer)
                        .and_then(|p| p.metadata_seq);
                    if known.map_or(true, |seq| remote_seq > seq) {
                        if let Ok(Response::Metadata(metadata)) =
                            network.send_request(peer, Request::Metadata).await
                        {
                            let _ = network
                                .cmd_tx
                                .send(NetworkCommand::RecordMetadata { peer, metadata })
                                .await;
                        }
                    }
                });
                Ok(vec![ResponseItem::plain(
                    local.seq_number.to_le_bytes().to_vec(),
                )])
            }
            Request::Metadata => {
                let version = match rpc {
                    SupportedProtocol::MetadataV3 => MetadataVersion::V3,
                    _ => MetadataVersion::V2,
                };
                let local = network.local_metadata().await;
                Ok(vec![ResponseItem::plain(local.to_ssz_bytes(version))])
            }
            Request::Goodbye(reason) => {
                debug!(peer = %peer, reason = ?reason, "peer said goodbye");
                let network = network.clone();
                tokio::spawn(async move {
                    let _ = network
                        .cmd_tx
                        .send(NetworkCommand::RemoteGoodbye { peer, reason })
                        .await;
                });
                Ok(Vec::new())
            }
            other => Err(HandlerError::InvalidInputs(format!(
                "core protocol cannot serve {other:?}"
            ))),
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NetworkActor {
    shared: Arc<Shared>,
    network: Network,
    gossip: GossipRouter,
    peers: HashMap<PeerId, Peer>,
    connections: HashMap<PeerId, Connection>,
    pending_dials: HashSet<PeerId>,
    seen: SeenTable,
    pool: PeerPool,
    local_metadata: LocalMetadata,
    local_record: LocalNodeRecord,
    global_quota: TokenBucket,
    throttle: ThrottleCounters,
}

impl NetworkActor {
    fn new(
        shared: Arc<Shared>,
        network: Network,
        gossip: GossipRouter,
        local_record: LocalNodeRecord,
    ) -> Self {
        let pool = PeerPool::new(shared.config.max_peers);
        let global_quota = TokenBucket::new(
            2.0 * shared.config.max_request_quota,
            shared.config.full_replenish_time,
        );
        Self {
            shared,
            network,
            gossip,
            peers: HashMap::new(),
            connections: HashMap::new(),
            pending_dials: HashSet::new(),
            seen: SeenTable::new(),
            pool,
            local_metadata: LocalMetadata::new(),
            local_record,
            global_quota,
            throttle: ThrottleCounters::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<NetworkCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                NetworkCommand::ConnectionEstablished {
                    peer,
                    direction,
                    connection,
                } => self.on_connection_established(peer, direction, connection),
                NetworkCommand::HandshakeFinished { peer, result } => {
                    self.on_handshake_finished(peer, result)
                }
                NetworkCommand::ConnectionClosed { peer } => self.on_connection_closed(peer),
                NetworkCommand::RemovePeer { peer } => {
                    if let Some(p) = self.peers.get(&peer) {
                        if p.state() == ConnectionState::Disconnected && p.connections() == 0 {
                            self.peers.remove(&peer);
                            trace!(peer = %peer, "peer removed");
                        }
                    }
                }
                NetworkCommand::Disconnect { peer, reason } => {
                    self.start_disconnect(peer, reason)
                }
                NetworkCommand::RemoteGoodbye { peer, reason } => {
                    self.on_remote_goodbye(peer, reason)
                }
                NetworkCommand::ReportPeer { peer, action } => self.report_peer(peer, action),
                NetworkCommand::TryChargeQuota {
                    peer,
                    protocol,
                    record_throttle,
                    reply,
                } => {
                    let _ = reply.send(self.try_charge_quota(peer, protocol, record_throttle));
                }
                NetworkCommand::PeerUsable { peer, reply } => {
                    let usable = self
                        .peers
                        .get(&peer)
                        .map(|p| p.is_usable())
                        .unwrap_or(false);
                    let _ = reply.send(usable);
                }
                NetworkCommand::GetConnection { peer, reply } => {
                    let _ = reply.send(self.connections.get(&peer).cloned());
                }
                NetworkCommand::ShouldDial { peer, reply } => {
                    let suppressed = self.seen.is_seen(&peer);
                    let connected = self
                        .peers
                        .get(&peer)
                        .map(|p| p.is_usable())
                        .unwrap_or(false);
                    let ourselves = peer == self.shared.local_peer_id;
                    let _ = reply.send(!suppressed && !connected && !ourselves);
                }
                NetworkCommand::DialOutcome { peer, outcome } => {
                    self.pending_dials.remove(&peer);
                    match outcome {
                        DialOutcome::Connected => {
                            // Short cooldown so churn does not redial
                            // instantly.
                            self.seen.add(peer, SeenReason::BenignReconnect);
                        }
                        DialOutcome::Timeout => self.seen.add(peer, SeenReason::Timeout),
                        DialOutcome::Failed => self.seen.add(peer, SeenReason::Dead),
                        DialOutcome::Skipped => {}
                    }
                }
                NetworkCommand::AddPendingDial { peer } => {
                    self.pending_dials.insert(peer);
                }
                NetworkCommand::KnownPeers { reply } => {
                    let mut known: HashSet<PeerId> = self
                        .peers
                        .iter()
                        .filter(|(_, p)| p.is_usable())
                        .map(|(id, _)| *id)
                        .collect();
                    known.extend(self.pending_dials.iter().copied());
                    known.insert(self.shared.local_peer_id);
                    let _ = reply.send(known);
                }
                NetworkCommand::PeerSnapshot { reply } => {
                    let _ = reply.send(self.peer_snapshot());
                }
                NetworkCommand::PeerProtocolState { peer, index, reply } => {
                    let state = self
                        .peers
                        .get(&peer)
                        .and_then(|p| p.protocol_state_raw(index));
                    let _ = reply.send(state);
                }
                NetworkCommand::PoolStatus { reply } => {
                    let _ =
                        reply.send((self.pool.len(), self.pool.incoming(), self.pool.outgoing()));
                }
                NetworkCommand::SetAgentVersion { peer, agent } => {
                    if let Some(p) = self.peers.get_mut(&peer) {
                        p.set_agent_version(agent);
                    }
                }
                NetworkCommand::RecordMetadata { peer, metadata } => {
                    if let Some(p) = self.peers.get_mut(&peer) {
                        p.record_metadata(metadata);
                    }
                }
                NetworkCommand::RecordMetadataFailure { peer } => {
                    let failures = self
                        .peers
                        .get_mut(&peer)
                        .map(|p| p.record_metadata_failure());
                    if let Some(failures) = failures {
                        if failures >= self.shared.config.metadata_request_max_failures {
                            debug!(peer = %peer, failures, "metadata failures exhausted");
                            self.start_disconnect(peer, GoodbyeReason::PeerScoreLow);
                        }
                    }
                }
                NetworkCommand::RecordThroughput {
                    peer,
                    bytes,
                    elapsed,
                } => {
                    if let Some(p) = self.peers.get_mut(&peer) {
                        p.throughput.record(bytes, elapsed);
                    }
                }
                NetworkCommand::LocalMetadata { reply } => {
                    let _ = reply.send(self.local_metadata.get().clone());
                }
                NetworkCommand::UpdateAttnets { bits, reply } => {
                    let changed = self.local_metadata.update_attnets(bits.clone());
                    if changed {
                        self.local_record.set_attnets(bits);
                        self.republish_record();
                    }
                    let _ = reply.send(changed);
                }
                NetworkCommand::UpdateSyncnets { bits, reply } => {
                    let changed = self.local_metadata.update_syncnets(bits.clone());
                    if changed {
                        self.local_record.set_syncnets(bits);
                        self.republish_record();
                    }
                    let _ = reply.send(changed);
                }
                NetworkCommand::UpdateCustodyCount { csc, reply } => {
                    let changed = self.local_metadata.update_custody_subnet_count(csc);
                    if changed {
                        self.local_record.set_csc(csc);
                        self.republish_record();
                    }
                    let _ = reply.send(changed);
                }
                NetworkCommand::ThrottleSnapshot { reply } => {
                    let _ = reply.send(self.throttle.snapshot());
                }
                NetworkCommand::Stop { reply } => {
                    let peers: Vec<PeerId> = self
                        .peers
                        .iter()
                        .filter(|(_, p)| p.is_usable())
                        .map(|(id, _)| *id)
                        .collect();
                    for peer in peers {
                        self.start_disconnect(peer, GoodbyeReason::ClientShutdown);
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        debug!("network actor shutting down");
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn on_connection_established(
        &mut self,
        peer_id: PeerId,
        direction: Direction,
        connection: Connection,
    ) {
        if peer_id == self.shared.local_peer_id {
            connection.close(0u32.into(), b"self-dial");
            return;
        }

        let registry_len = self.shared.registry.len();
        let peer = self.peers.entry(peer_id).or_insert_with(|| {
            let mut p = Peer::new(peer_id, registry_len);
            for (index, state) in self
                .shared
                .registry
                .init_peer_states()
                .into_iter()
                .enumerate()
            {
                if let Some(state) = state {
                    p.set_protocol_state(index, state);
                }
            }
            p
        });

        match peer.on_connection_established(direction) {
            ConnectOutcome::StartHandshake => {
                debug!(peer = %peer_id, ?direction, "peer connecting");
                self.connections.insert(peer_id, connection.clone());

                // Stream accept loop for the authoritative connection.
                {
                    let network = self.network.clone();
                    let conn = connection.clone();
                    tokio::spawn(async move {
                        network.connection_task(peer_id, conn).await;
                    });
                }

                // Run every protocol's connect hook, then report back.
                let network = self.network.clone();
                tokio::spawn(async move {
                    let mut result = Ok(());
                    for (_, protocol) in network.shared.registry.iter() {
                        if let Err(e) = protocol.on_peer_connected(&network, peer_id).await {
                            let reason = if e.downcast_ref::<IrrelevantNetworkError>().is_some() {
                                GoodbyeReason::IrrelevantNetwork
                            } else {
                                GoodbyeReason::FaultOrError
                            };
                            debug!(peer = %peer_id, error = %e, "handshake hook failed");
                            result = Err(reason);
                            break;
                        }
                    }
                    let _ = network
                        .cmd_tx
                        .send(NetworkCommand::HandshakeFinished {
                            peer: peer_id,
                            result,
                        })
                        .await;
                });
            }
            ConnectOutcome::Duplicate => {
                trace!(peer = %peer_id, "duplicate transport connection");
                connection.close(0u32.into(), b"duplicate");
                // The closed duplicate never gets a task, so settle its
                // refcount here.
                peer.on_connection_closed();
            }
            ConnectOutcome::Rejected => {
                trace!(peer = %peer_id, "connection while disconnecting, dropping");
                connection.close(0u32.into(), b"disconnecting");
            }
        }
    }

    fn on_handshake_finished(
        &mut self,
        peer_id: PeerId,
        result: std::result::Result<(), GoodbyeReason>,
    ) {
        match result {
            Ok(()) => {
                let Some(peer) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                if !peer.on_handshake_complete() {
                    return;
                }
                let direction = peer.direction();
                let score = peer.score.value();
                match self.pool.try_insert(peer_id, direction, score, true) {
                    AdmissionResult::Success => {
                        info!(peer = %peer_id, ?direction, peers = self.pool.len(), "peer connected");
                        let gossip = self.gossip.clone();
                        tokio::spawn(async move {
                            gossip.peer_connected(peer_id, direction).await;
                        });
                    }
                    AdmissionResult::NoSpace => {
                        debug!(peer = %peer_id, "pool full, evicting new peer");
                        self.start_disconnect(
                            peer_id,
                            GoodbyeReason::Unknown(GOODBYE_TOO_MANY_PEERS),
                        );
                    }
                    AdmissionResult::LowScore => {
                        self.start_disconnect(peer_id, GoodbyeReason::PeerScoreLow);
                    }
                    AdmissionResult::Duplicate => {}
                    AdmissionResult::DeadPeer => {
                        self.start_disconnect(peer_id, GoodbyeReason::FaultOrError);
                    }
                }
            }
            Err(reason) => {
                self.start_disconnect(peer_id, reason);
            }
        }
    }

    fn on_connection_closed(&mut self, peer_id: PeerId) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.on_connection_closed() {
            return;
        }
        debug!(peer = %peer_id, "peer disconnected");
        self.connections.remove(&peer_id);
        self.pool.remove(&peer_id);

        let gossip = self.gossip.clone();
        let network = self.network.clone();
        tokio::spawn(async move {
            gossip.peer_disconnected(peer_id).await;
            for (_, protocol) in network.shared.registry.iter() {
                protocol.on_peer_disconnected(&network, peer_id).await;
            }
            let _ = network
                .cmd_tx
                .send(NetworkCommand::RemovePeer { peer: peer_id })
                .await;
        });
    }

    /// Schedule a disconnect. The seen-table entry is recorded *before*
    /// the transport is asked to drop, closing the reconnection race.
    fn start_disconnect(&mut self, peer_id: PeerId, reason: GoodbyeReason) {
        let seen_reason = match reason {
            GoodbyeReason::Unknown(GOODBYE_TOO_MANY_PEERS) => SeenReason::BenignReconnect,
            other => SeenReason::from_goodbye(other),
        };
        self.seen.add(peer_id, seen_reason);

        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.begin_disconnect(reason) {
            return;
        }
        debug!(peer = %peer_id, ?reason, "disconnecting peer");
        self.pool.remove(&peer_id);

        let connection = self.connections.get(&peer_id).cloned();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let Some(connection) = connection else {
                return;
            };
            // Best-effort goodbye straight over the transport; no actor
            // round-trips, so this still works during shutdown.
            let _ = tokio::time::timeout(GOODBYE_TIMEOUT, async {
                let (mut send, mut recv) = connection.open_bi().await?;
                let _ = reqresp::send_request_on(
                    &mut send,
                    &mut recv,
                    &Request::Goodbye(reason),
                    SupportedProtocol::GoodbyeV1,
                    &[],
                    shared.config.resp_timeout,
                )
                .await;
                // Closing the connection discards unacknowledged data;
                // wait for the peer's FIN so the goodbye actually lands.
                let _ = recv.read_to_end(64).await;
                Ok::<_, quinn::ConnectionError>(())
            })
            .await;
            connection.close(0u32.into(), b"goodbye");
        });
    }

    /// The peer disconnected us with a goodbye. Its reason picks the
    /// seen-table TTL; we only drop the transport.
    fn on_remote_goodbye(&mut self, peer_id: PeerId, reason: GoodbyeReason) {
        self.seen.add(peer_id, SeenReason::from_goodbye(reason));
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        if !peer.begin_disconnect(reason) {
            return;
        }
        self.pool.remove(&peer_id);
        if let Some(connection) = self.connections.get(&peer_id) {
            connection.close(0u32.into(), b"goodbye received");
        }
    }

    // ------------------------------------------------------------------
    // Scoring and quota
    // ------------------------------------------------------------------

    fn report_peer(&mut self, peer_id: PeerId, action: PeerAction) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        let transition = peer.apply_score(action);
        trace!(peer = %peer_id, ?action, score = peer.score.value(), "score updated");
        if transition == ScoreTransition::CrossedLowLimit {
            self.start_disconnect(peer_id, GoodbyeReason::PeerScoreLow);
        }
    }

    fn try_charge_quota(
        &mut self,
        peer_id: PeerId,
        protocol: SupportedProtocol,
        record_throttle: bool,
    ) -> std::result::Result<(), Duration> {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return Ok(());
        };
        // Consume from both buckets or neither; a one-sided charge would
        // let a throttled peer drain the global bucket while waiting.
        if self.global_quota.available() >= 1.0 && peer.quota.available() >= 1.0 {
            self.global_quota.try_consume();
            peer.quota.try_consume();
            return Ok(());
        }
        let wait = self.global_quota.wait_time().max(peer.quota.wait_time());
        if record_throttle {
            self.throttle.increment(protocol.name());
        }
        Err(wait.max(Duration::from_millis(10)))
    }

    // ------------------------------------------------------------------
    // Snapshots and record publication
    // ------------------------------------------------------------------

    fn peer_snapshot(&self) -> Vec<PeerInfo> {
        self.peers
            .values()
            .map(|p| PeerInfo {
                peer_id: p.peer_id,
                state: p.state(),
                direction: p.direction(),
                score: p.score.value(),
                client: p.client,
                metadata_seq: p.metadata.as_ref().map(|m| m.seq_number),
                stability_subnets: p.metadata.as_ref().map_or(0, |m| m.attnets.num_set()),
                metadata_failures: p.metadata_failures,
                last_metadata_at: p.last_metadata_at,
                connected_at: p.connected_at,
            })
            .collect()
    }

    fn republish_record(&self) {
        let record = self.local_record.record().clone();
        let discovery = self.network.discovery.clone();
        tokio::spawn(async move {
            discovery.publish_local_record(record).await;
        });
    }
}
