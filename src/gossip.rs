//! # Gossip Pipeline
//!
//! Topic-based publish/subscribe with a per-topic mesh, in the same
//! handle/actor split as the rest of the crate:
//!
//! - [`GossipRouter`]: public handle (cheap to clone) for subscribe,
//!   publish, and wire-message injection
//! - `GossipActor`: owns subscriptions, peer/topic/mesh tables, the dedup
//!   cache, and validation counters; processes commands sequentially
//!
//! ## Message Identity
//!
//! `message_id = sha256(domain ‖ len(topic) as LE u64 ‖ topic ‖
//! decompressed payload)[..20]` with the "valid snappy" domain
//! `0x01000000`. Topics carrying the phase-0 fork digest use the legacy
//! rule: topic and length are omitted from the hash.
//!
//! ## Validation
//!
//! Subscribing requires a registered validator; the inbound hot path is
//! decompress (bounded per topic kind) → drop the compressed buffer →
//! validator decision {Accept, Ignore, Reject}. Accept propagates to the
//! mesh and delivers to the application; Ignore does neither; Reject also
//! down-ranks the sender via a router event.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::config::{
    GOSSIP_MAX_SIZE, GOSSIP_SEEN_CACHE, MESH_D, MESH_D_HIGH, MESH_D_LOW, MESH_D_OUT,
};
use crate::identity::PeerId;
use crate::peer::Direction;

/// Domain prefix for ids of messages whose payload decompressed cleanly.
pub const MESSAGE_DOMAIN_VALID_SNAPPY: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Fork digest of the phase-0 network; topics carrying it hash their ids
/// under the legacy rule.
pub const PHASE0_FORK_DIGEST_HEX: &str = "00000000";

/// Command channel capacity for the gossip actor.
const GOSSIP_COMMAND_CHANNEL_SIZE: usize = 1024;

/// Delivered-message channel capacity.
const GOSSIP_DELIVERY_CHANNEL_SIZE: usize = 256;

/// Heartbeat cadence for mesh maintenance.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

// ============================================================================
// Topics
// ============================================================================

/// Message category on a gossip topic. Subnet-indexed kinds carry their
/// subnet id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GossipKind {
    BeaconBlock,
    BeaconAggregateAndProof,
    Attestation(u64),
    SyncCommitteeMessage(u64),
    SignedContributionAndProof,
    BlobSidecar(u64),
    DataColumnSidecar(u64),
    VoluntaryExit,
    ProposerSlashing,
    AttesterSlashing,
}

impl GossipKind {
    /// Maximum uncompressed payload for this kind; the decompression bound
    /// on the hot path.
    pub fn max_size(&self) -> usize {
        match self {
            GossipKind::BeaconBlock
            | GossipKind::BlobSidecar(_)
            | GossipKind::DataColumnSidecar(_) => GOSSIP_MAX_SIZE,
            _ => 1024 * 1024,
        }
    }

    /// Topics where a publish reaching zero peers is expected rather than
    /// an error (rare administrative messages).
    pub fn tolerates_no_peers(&self) -> bool {
        matches!(
            self,
            GossipKind::VoluntaryExit
                | GossipKind::ProposerSlashing
                | GossipKind::AttesterSlashing
        )
    }

    pub fn as_topic_str(&self) -> String {
        match self {
            GossipKind::BeaconBlock => "beacon_block".into(),
            GossipKind::BeaconAggregateAndProof => "beacon_aggregate_and_proof".into(),
            GossipKind::Attestation(subnet) => format!("beacon_attestation_{subnet}"),
            GossipKind::SyncCommitteeMessage(subnet) => format!("sync_committee_{subnet}"),
            GossipKind::SignedContributionAndProof => "sync_committee_contribution_and_proof".into(),
            GossipKind::BlobSidecar(subnet) => format!("blob_sidecar_{subnet}"),
            GossipKind::DataColumnSidecar(subnet) => format!("data_column_sidecar_{subnet}"),
            GossipKind::VoluntaryExit => "voluntary_exit".into(),
            GossipKind::ProposerSlashing => "proposer_slashing".into(),
            GossipKind::AttesterSlashing => "attester_slashing".into(),
        }
    }

    /// Attestation subnet id, when this kind is one.
    pub fn attestation_subnet(&self) -> Option<u64> {
        match self {
            GossipKind::Attestation(subnet) => Some(*subnet),
            _ => None,
        }
    }
}

/// A fully qualified gossip topic: `/eth2/<fork digest>/<kind>/ssz_snappy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GossipTopic {
    pub fork_digest: [u8; 4],
    pub kind: GossipKind,
}

impl GossipTopic {
    pub fn new(fork_digest: [u8; 4], kind: GossipKind) -> Self {
        Self { fork_digest, kind }
    }
}

impl fmt::Display for GossipTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/eth2/{}/{}/ssz_snappy",
            hex::encode(self.fork_digest),
            self.kind.as_topic_str()
        )
    }
}

// ============================================================================
// Message Id
// ============================================================================

fn is_phase0_topic(topic: &str) -> bool {
    topic
        .strip_prefix("/eth2/")
        .is_some_and(|rest| rest.starts_with(PHASE0_FORK_DIGEST_HEX))
}

/// Gossip message id over the *decompressed* payload.
pub fn message_id(topic: &str, decompressed: &[u8]) -> [u8; 20] {
    let mut hasher = Sha256::new();
    hasher.update(MESSAGE_DOMAIN_VALID_SNAPPY);
    if !is_phase0_topic(topic) {
        hasher.update((topic.len() as u64).to_le_bytes());
        hasher.update(topic.as_bytes());
    }
    hasher.update(decompressed);
    let digest = hasher.finalize();
    digest[..20].try_into().expect("sha256 yields 32 bytes")
}

pub type MessageId = [u8; 20];

// ============================================================================
// Validation
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationResult {
    /// Deliver to the application and propagate to the mesh.
    Accept,
    /// Drop silently; neither propagate nor penalize.
    Ignore,
    /// Drop, and down-rank the sender.
    Reject,
}

/// Synchronous validator, run on the hot path with the decompressed
/// payload.
pub type SyncValidator = Arc<dyn Fn(&GossipTopic, &[u8]) -> ValidationResult + Send + Sync>;

/// Asynchronous validator for heavier checks (signatures, DB lookups).
/// Runs off the actor loop; propagation waits for the decision.
pub type AsyncValidator = Arc<
    dyn Fn(
            GossipTopic,
            Vec<u8>,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = ValidationResult> + Send>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub enum Validator {
    Sync(SyncValidator),
    Async(AsyncValidator),
}

// ============================================================================
// Wire Messages
// ============================================================================

/// Control and data messages exchanged between gossip peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GossipWireMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    /// Join the sender's mesh for a topic.
    Graft { topic: String },
    /// Leave the sender's mesh for a topic.
    Prune { topic: String },
    /// Full message: snappy-compressed payload.
    Publish { topic: String, compressed: Vec<u8> },
}

/// Outbound transport seam: the network layer ships wire messages to a
/// peer; failures are logged, never propagated into the router.
#[async_trait::async_trait]
pub trait GossipSender: Send + Sync + 'static {
    async fn send(&self, to: PeerId, message: GossipWireMessage) -> Result<()>;
}

// ============================================================================
// Events and Delivery
// ============================================================================

/// A validated message handed to the application.
#[derive(Clone, Debug)]
pub struct GossipMessage {
    pub topic: GossipTopic,
    /// Peer we received it from (propagation source, not necessarily the
    /// original publisher).
    pub from: PeerId,
    /// Decompressed payload.
    pub data: Vec<u8>,
}

/// Router-originated events the network layer reacts to (scoring).
#[derive(Clone, Debug)]
pub enum GossipEvent {
    /// A message from this peer failed validation.
    RejectedMessage { from: PeerId },
}

/// Per-topic counters the mesh monitor scans.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopicCounters {
    /// Peers known to subscribe to the topic.
    pub subscribed: usize,
    /// Peers in our mesh for the topic.
    pub mesh: usize,
    /// Outbound-direction peers in our mesh.
    pub mesh_outbound: usize,
}

/// Snapshot of router state for the monitor and trimmer.
#[derive(Clone, Debug, Default)]
pub struct MeshSnapshot {
    pub topics: HashMap<String, TopicCounters>,
    /// Topic subscriptions per connected peer (for trim scoring).
    pub peer_topics: HashMap<PeerId, HashSet<String>>,
    pub failed_snappy: u64,
    pub failed_ssz: u64,
}

// ============================================================================
// Actor Commands
// ============================================================================

enum GossipCommand {
    Subscribe {
        topic: GossipTopic,
        validator: Validator,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        topic: GossipTopic,
        reply: oneshot::Sender<()>,
    },
    Publish {
        topic: GossipTopic,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize>>,
    },
    Inbound {
        from: PeerId,
        message: GossipWireMessage,
    },
    /// Async validator verdict arriving back at the actor.
    ValidationComplete {
        from: PeerId,
        topic: GossipTopic,
        id: MessageId,
        compressed: Vec<u8>,
        data: Vec<u8>,
        decision: ValidationResult,
    },
    PeerConnected {
        peer: PeerId,
        direction: Direction,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    Snapshot {
        reply: oneshot::Sender<MeshSnapshot>,
    },
    Quit,
}

// ============================================================================
// Router Handle
// ============================================================================

#[derive(Clone)]
pub struct GossipRouter {
    cmd_tx: mpsc::Sender<GossipCommand>,
}

impl GossipRouter {
    /// Spawn the router actor. Returns the handle, the delivery receiver
    /// for validated messages, and the event receiver for scoring.
    pub fn spawn(
        sender: Arc<dyn GossipSender>,
    ) -> (
        Self,
        mpsc::Receiver<GossipMessage>,
        mpsc::Receiver<GossipEvent>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(GOSSIP_COMMAND_CHANNEL_SIZE);
        let (delivery_tx, delivery_rx) = mpsc::channel(GOSSIP_DELIVERY_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(GOSSIP_DELIVERY_CHANNEL_SIZE);

        let actor = GossipActor::new(sender, delivery_tx, event_tx, cmd_tx.clone());
        tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx }, delivery_rx, event_rx)
    }

    /// Subscribe to a topic. The topic becomes validated exactly here; a
    /// subscribe without a validator does not exist by construction.
    pub async fn subscribe(&self, topic: GossipTopic, validator: Validator) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(GossipCommand::Subscribe {
                topic,
                validator,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("gossip router closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("gossip router closed"))?
    }

    pub async fn unsubscribe(&self, topic: GossipTopic) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(GossipCommand::Unsubscribe {
                topic,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("gossip router closed"))?;
        let _ = reply_rx.await;
        Ok(())
    }

    /// Publish an SSZ-encoded payload. Returns the number of peers the
    /// message was sent to, or a "no peers" error for topics that expect
    /// fan-out.
    pub async fn publish(&self, topic: GossipTopic, data: Vec<u8>) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(GossipCommand::Publish {
                topic,
                data,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("gossip router closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("gossip router closed"))?
    }

    /// Inject a wire message received from a peer.
    pub async fn handle_wire_message(&self, from: PeerId, message: GossipWireMessage) {
        let _ = self
            .cmd_tx
            .send(GossipCommand::Inbound { from, message })
            .await;
    }

    pub async fn peer_connected(&self, peer: PeerId, direction: Direction) {
        let _ = self
            .cmd_tx
            .send(GossipCommand::PeerConnected { peer, direction })
            .await;
    }

    pub async fn peer_disconnected(&self, peer: PeerId) {
        let _ = self
            .cmd_tx
            .send(GossipCommand::PeerDisconnected { peer })
            .await;
    }

    pub async fn snapshot(&self) -> MeshSnapshot {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(GossipCommand::Snapshot { reply: reply_tx })
            .await
            .is_err()
        {
            return MeshSnapshot::default();
        }
        reply_rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(GossipCommand::Quit).await;
    }
}

// ============================================================================
// Actor
// ============================================================================

struct Subscription {
    topic: GossipTopic,
    validator: Validator,
}

struct GossipActor {
    sender: Arc<dyn GossipSender>,
    delivery_tx: mpsc::Sender<GossipMessage>,
    event_tx: mpsc::Sender<GossipEvent>,
    /// Loopback for async validation verdicts.
    cmd_tx: mpsc::Sender<GossipCommand>,
    /// Our validated subscriptions, keyed by topic string.
    subscriptions: HashMap<String, Subscription>,
    /// Which peers subscribe to which topics.
    topic_peers: HashMap<String, HashSet<PeerId>>,
    peer_topics: HashMap<PeerId, HashSet<String>>,
    /// Mesh members per topic (subset of topic_peers).
    mesh: HashMap<String, HashSet<PeerId>>,
    peer_directions: HashMap<PeerId, Direction>,
    seen: LruCache<MessageId, ()>,
    failed_snappy: u64,
    failed_ssz: u64,
}

impl GossipActor {
    fn new(
        sender: Arc<dyn GossipSender>,
        delivery_tx: mpsc::Sender<GossipMessage>,
        event_tx: mpsc::Sender<GossipEvent>,
        cmd_tx: mpsc::Sender<GossipCommand>,
    ) -> Self {
        Self {
            sender,
            delivery_tx,
            event_tx,
            cmd_tx,
            subscriptions: HashMap::new(),
            topic_peers: HashMap::new(),
            peer_topics: HashMap::new(),
            mesh: HashMap::new(),
            peer_directions: HashMap::new(),
            seen: LruCache::new(NonZeroUsize::new(GOSSIP_SEEN_CACHE).expect("nonzero")),
            failed_snappy: 0,
            failed_ssz: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<GossipCommand>) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(GossipCommand::Subscribe { topic, validator, reply }) => {
                            let _ = reply.send(self.subscribe(topic, validator).await);
                        }
                        Some(GossipCommand::Unsubscribe { topic, reply }) => {
                            self.unsubscribe(topic).await;
                            let _ = reply.send(());
                        }
                        Some(GossipCommand::Publish { topic, data, reply }) => {
                            let _ = reply.send(self.publish(topic, data).await);
                        }
                        Some(GossipCommand::Inbound { from, message }) => {
                            self.handle_inbound(from, message).await;
                        }
                        Some(GossipCommand::ValidationComplete {
                            from, topic, id, compressed, data, decision,
                        }) => {
                            self.finish_validation(from, topic, id, compressed, data, decision)
                                .await;
                        }
                        Some(GossipCommand::PeerConnected { peer, direction }) => {
                            self.peer_connected(peer, direction).await;
                        }
                        Some(GossipCommand::PeerDisconnected { peer }) => {
                            self.peer_disconnected(peer);
                        }
                        Some(GossipCommand::Snapshot { reply }) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(GossipCommand::Quit) | None => {
                            debug!("gossip actor shutting down");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscription management
    // ------------------------------------------------------------------

    async fn subscribe(&mut self, topic: GossipTopic, validator: Validator) -> Result<()> {
        let key = topic.to_string();
        if self.subscriptions.contains_key(&key) {
            bail!("already subscribed to {key}");
        }
        self.subscriptions
            .insert(key.clone(), Subscription { topic, validator });

        // Announce to every connected peer and graft an initial mesh.
        let peers: Vec<PeerId> = self.peer_directions.keys().copied().collect();
        for peer in peers {
            self.send_to(
                peer,
                GossipWireMessage::Subscribe { topic: key.clone() },
            )
            .await;
        }
        self.maintain_topic_mesh(&key).await;
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: GossipTopic) {
        let key = topic.to_string();
        if self.subscriptions.remove(&key).is_none() {
            return;
        }
        if let Some(mesh_peers) = self.mesh.remove(&key) {
            for peer in mesh_peers {
                self.send_to(peer, GossipWireMessage::Prune { topic: key.clone() })
                    .await;
            }
        }
        let peers: Vec<PeerId> = self.peer_directions.keys().copied().collect();
        for peer in peers {
            self.send_to(
                peer,
                GossipWireMessage::Unsubscribe { topic: key.clone() },
            )
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    async fn publish(&mut self, topic: GossipTopic, data: Vec<u8>) -> Result<usize> {
        // Oversized publishes are local programming errors, not peer input.
        assert!(
            data.len() <= GOSSIP_MAX_SIZE,
            "gossip payload of {} bytes exceeds GOSSIP_MAX_SIZE",
            data.len()
        );
        let key = topic.to_string();
        if !self.subscriptions.contains_key(&key) {
            bail!("cannot publish to unsubscribed topic {key}");
        }

        let id = message_id(&key, &data);
        self.seen.put(id, ());

        let compressed = snap::raw::Encoder::new()
            .compress_vec(&data)
            .context("snappy compression failed")?;

        let targets: Vec<PeerId> = match self.mesh.get(&key) {
            Some(mesh) if !mesh.is_empty() => mesh.iter().copied().collect(),
            // No mesh yet: flood the subscribed peers.
            _ => self
                .topic_peers
                .get(&key)
                .map(|peers| peers.iter().copied().collect())
                .unwrap_or_default(),
        };

        for peer in &targets {
            self.send_to(
                *peer,
                GossipWireMessage::Publish {
                    topic: key.clone(),
                    compressed: compressed.clone(),
                },
            )
            .await;
        }

        if targets.is_empty() && !topic.kind.tolerates_no_peers() {
            bail!("no peers to publish {key}");
        }
        trace!(topic = %key, peers = targets.len(), "published message");
        Ok(targets.len())
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, from: PeerId, message: GossipWireMessage) {
        match message {
            GossipWireMessage::Subscribe { topic } => {
                self.topic_peers.entry(topic.clone()).or_default().insert(from);
                self.peer_topics.entry(from).or_default().insert(topic);
            }
            GossipWireMessage::Unsubscribe { topic } => {
                if let Some(peers) = self.topic_peers.get_mut(&topic) {
                    peers.remove(&from);
                }
                if let Some(topics) = self.peer_topics.get_mut(&from) {
                    topics.remove(&topic);
                }
                if let Some(mesh) = self.mesh.get_mut(&topic) {
                    mesh.remove(&from);
                }
            }
            GossipWireMessage::Graft { topic } => {
                if self.subscriptions.contains_key(&topic) {
                    self.topic_peers.entry(topic.clone()).or_default().insert(from);
                    self.peer_topics.entry(from).or_default().insert(topic.clone());
                    self.mesh.entry(topic).or_default().insert(from);
                } else {
                    // Not subscribed: refuse the graft.
                    self.send_to(from, GossipWireMessage::Prune { topic }).await;
                }
            }
            GossipWireMessage::Prune { topic } => {
                if let Some(mesh) = self.mesh.get_mut(&topic) {
                    mesh.remove(&from);
                }
            }
            GossipWireMessage::Publish { topic, compressed } => {
                self.handle_publish(from, topic, compressed).await;
            }
        }
    }

    async fn handle_publish(&mut self, from: PeerId, topic_str: String, compressed: Vec<u8>) {
        let Some(subscription) = self.subscriptions.get(&topic_str) else {
            trace!(topic = %topic_str, "message on unsubscribed topic, dropping");
            return;
        };
        let topic = subscription.topic;
        let max_size = topic.kind.max_size();

        // Bounded decompression: check the declared length first.
        let decompressed_len = match snap::raw::decompress_len(&compressed) {
            Ok(len) if len <= max_size => len,
            Ok(_) | Err(_) => {
                self.failed_snappy += 1;
                self.reject(from).await;
                return;
            }
        };
        let mut data = vec![0u8; decompressed_len];
        if snap::raw::Decoder::new()
            .decompress(&compressed, &mut data)
            .is_err()
        {
            self.failed_snappy += 1;
            self.reject(from).await;
            return;
        }

        // Empty payloads cannot be valid SSZ for any gossip type.
        if data.is_empty() {
            self.failed_ssz += 1;
            self.reject(from).await;
            return;
        }

        let id = message_id(&topic_str, &data);
        if self.seen.contains(&id) {
            trace!(topic = %topic_str, "duplicate message");
            return;
        }
        self.seen.put(id, ());

        match subscription.validator.clone() {
            Validator::Sync(validator) => {
                let decision = validator(&topic, &data);
                self.finish_validation(from, topic, id, compressed, data, decision)
                    .await;
            }
            Validator::Async(validator) => {
                // Run heavy validation off the actor loop; the verdict
                // comes back as a command.
                let cmd_tx = self.cmd_tx.clone();
                let fut = validator(topic, data.clone());
                tokio::spawn(async move {
                    let decision = fut.await;
                    let _ = cmd_tx
                        .send(GossipCommand::ValidationComplete {
                            from,
                            topic,
                            id,
                            compressed,
                            data,
                            decision,
                        })
                        .await;
                });
            }
        }
    }

    async fn finish_validation(
        &mut self,
        from: PeerId,
        topic: GossipTopic,
        _id: MessageId,
        compressed: Vec<u8>,
        data: Vec<u8>,
        decision: ValidationResult,
    ) {
        let topic_str = topic.to_string();
        match decision {
            ValidationResult::Accept => {
                // Propagate to the mesh, minus the peer it came from.
                let targets: Vec<PeerId> = self
                    .mesh
                    .get(&topic_str)
                    .map(|mesh| mesh.iter().copied().filter(|p| *p != from).collect())
                    .unwrap_or_default();
                for peer in targets {
                    self.send_to(
                        peer,
                        GossipWireMessage::Publish {
                            topic: topic_str.clone(),
                            compressed: compressed.clone(),
                        },
                    )
                    .await;
                }
                let _ = self
                    .delivery_tx
                    .send(GossipMessage { topic, from, data })
                    .await;
            }
            ValidationResult::Ignore => {
                trace!(topic = %topic_str, "message ignored by validator");
            }
            ValidationResult::Reject => {
                debug!(topic = %topic_str, from = %from, "message rejected by validator");
                self.reject(from).await;
            }
        }
    }

    async fn reject(&mut self, from: PeerId) {
        let _ = self
            .event_tx
            .send(GossipEvent::RejectedMessage { from })
            .await;
    }

    // ------------------------------------------------------------------
    // Peers and mesh maintenance
    // ------------------------------------------------------------------

    async fn peer_connected(&mut self, peer: PeerId, direction: Direction) {
        self.peer_directions.insert(peer, direction);
        // Tell the new peer about our subscriptions.
        let topics: Vec<String> = self.subscriptions.keys().cloned().collect();
        for topic in topics {
            self.send_to(peer, GossipWireMessage::Subscribe { topic }).await;
        }
    }

    fn peer_disconnected(&mut self, peer: PeerId) {
        self.peer_directions.remove(&peer);
        if let Some(topics) = self.peer_topics.remove(&peer) {
            for topic in topics {
                if let Some(peers) = self.topic_peers.get_mut(&topic) {
                    peers.remove(&peer);
                }
                if let Some(mesh) = self.mesh.get_mut(&topic) {
                    mesh.remove(&peer);
                }
            }
        }
    }

    async fn heartbeat(&mut self) {
        let topics: Vec<String> = self.subscriptions.keys().cloned().collect();
        for topic in topics {
            self.maintain_topic_mesh(&topic).await;
        }
    }

    /// Keep the mesh inside [d_low, d_high], honoring the outbound floor.
    async fn maintain_topic_mesh(&mut self, topic: &str) {
        let candidates: Vec<PeerId> = self
            .topic_peers
            .get(topic)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        let mesh = self.mesh.entry(topic.to_string()).or_default();
        mesh.retain(|p| candidates.contains(p));

        let outbound_in_mesh = |mesh: &HashSet<PeerId>,
                                directions: &HashMap<PeerId, Direction>| {
            mesh.iter()
                .filter(|p| directions.get(*p) == Some(&Direction::Outgoing))
                .count()
        };

        let mut to_graft: Vec<PeerId> = Vec::new();
        let mut to_prune: Vec<PeerId> = Vec::new();

        if mesh.len() < MESH_D_LOW {
            // Grow toward d, outbound candidates first.
            let mut available: Vec<PeerId> = candidates
                .iter()
                .copied()
                .filter(|p| !mesh.contains(p))
                .collect();
            available.sort_by_key(|p| {
                (self.peer_directions.get(p) != Some(&Direction::Outgoing), *p)
            });
            for peer in available {
                if mesh.len() >= MESH_D {
                    break;
                }
                mesh.insert(peer);
                to_graft.push(peer);
            }
        } else if mesh.len() > MESH_D_HIGH {
            // Shrink toward d, never dropping below the outbound floor.
            let mut members: Vec<PeerId> = mesh.iter().copied().collect();
            members.sort();
            for peer in members {
                if mesh.len() <= MESH_D {
                    break;
                }
                let is_outbound = self.peer_directions.get(&peer) == Some(&Direction::Outgoing);
                if is_outbound && outbound_in_mesh(mesh, &self.peer_directions) <= MESH_D_OUT {
                    continue;
                }
                mesh.remove(&peer);
                to_prune.push(peer);
            }
        }

        for peer in to_graft {
            self.send_to(
                peer,
                GossipWireMessage::Graft {
                    topic: topic.to_string(),
                },
            )
            .await;
        }
        for peer in to_prune {
            self.send_to(
                peer,
                GossipWireMessage::Prune {
                    topic: topic.to_string(),
                },
            )
            .await;
        }
    }

    fn snapshot(&self) -> MeshSnapshot {
        let mut topics = HashMap::new();
        for topic in self.subscriptions.keys() {
            let subscribed = self.topic_peers.get(topic).map_or(0, |p| p.len());
            let mesh_set = self.mesh.get(topic);
            let mesh = mesh_set.map_or(0, |m| m.len());
            let mesh_outbound = mesh_set.map_or(0, |m| {
                m.iter()
                    .filter(|p| self.peer_directions.get(*p) == Some(&Direction::Outgoing))
                    .count()
            });
            topics.insert(
                topic.clone(),
                TopicCounters {
                    subscribed,
                    mesh,
                    mesh_outbound,
                },
            );
        }
        MeshSnapshot {
            topics,
            peer_topics: self.peer_topics.clone(),
            failed_snappy: self.failed_snappy,
            failed_ssz: self.failed_ssz,
        }
    }

    async fn send_to(&self, peer: PeerId, message: GossipWireMessage) {
        if let Err(e) = self.sender.send(peer, message).await {
            warn!(peer = %peer, error = %e, "gossip send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use tokio::sync::Mutex;

    fn id() -> PeerId {
        Keypair::generate().peer_id()
    }

    fn accept_all() -> Validator {
        Validator::Sync(Arc::new(|_, _| ValidationResult::Accept))
    }

    fn topic(kind: GossipKind) -> GossipTopic {
        GossipTopic::new([0xaa, 0xbb, 0xcc, 0xdd], kind)
    }

    struct RecordingSender {
        sent: Mutex<Vec<(PeerId, GossipWireMessage)>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        async fn publishes_to(&self) -> Vec<PeerId> {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|(_, m)| matches!(m, GossipWireMessage::Publish { .. }))
                .map(|(p, _)| *p)
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl GossipSender for RecordingSender {
        async fn send(&self, to: PeerId, message: GossipWireMessage) -> Result<()> {
            self.sent.lock().await.push((to, message));
            Ok(())
        }
    }

    fn compress(data: &[u8]) -> Vec<u8> {
        snap::raw::Encoder::new().compress_vec(data).unwrap()
    }

    #[test]
    fn topic_string_format() {
        let t = topic(GossipKind::BeaconBlock);
        assert_eq!(t.to_string(), "/eth2/aabbccdd/beacon_block/ssz_snappy");
        let att = topic(GossipKind::Attestation(13));
        assert_eq!(
            att.to_string(),
            "/eth2/aabbccdd/beacon_attestation_13/ssz_snappy"
        );
    }

    #[test]
    fn message_id_separates_topics() {
        let payload = b"identical payload";
        let altair = "/eth2/aabbccdd/beacon_block/ssz_snappy";
        let other = "/eth2/aabbccdd/voluntary_exit/ssz_snappy";
        assert_ne!(message_id(altair, payload), message_id(other, payload));
    }

    #[test]
    fn phase0_topic_uses_legacy_id_rule() {
        let payload = b"payload bytes";
        let phase0 = "/eth2/00000000/beacon_block/ssz_snappy";
        let altair = "/eth2/aabbccdd/beacon_block/ssz_snappy";

        // Legacy id = sha256(domain || payload)[..20], no topic bytes.
        let mut hasher = Sha256::new();
        hasher.update(MESSAGE_DOMAIN_VALID_SNAPPY);
        hasher.update(payload);
        let expected: [u8; 20] = hasher.finalize()[..20].try_into().unwrap();
        assert_eq!(message_id(phase0, payload), expected);

        // Post-phase0 ids include topic bytes, so they differ.
        assert_ne!(message_id(altair, payload), expected);
    }

    #[tokio::test]
    async fn publish_without_subscription_fails() {
        let sender = RecordingSender::new();
        let (router, _rx, _ev) = GossipRouter::spawn(sender);
        let err = router
            .publish(topic(GossipKind::BeaconBlock), b"data".to_vec())
            .await;
        assert!(err.is_err());
        router.quit().await;
    }

    #[tokio::test]
    async fn accepted_message_is_delivered_and_propagated() {
        let sender = RecordingSender::new();
        let (router, mut delivery, _ev) = GossipRouter::spawn(sender.clone());
        let t = topic(GossipKind::BeaconBlock);

        router.subscribe(t, accept_all()).await.unwrap();

        let origin = id();
        let mesh_peer = id();
        router.peer_connected(origin, Direction::Incoming).await;
        router.peer_connected(mesh_peer, Direction::Outgoing).await;
        // Both subscribe and graft into our mesh.
        for p in [origin, mesh_peer] {
            router
                .handle_wire_message(p, GossipWireMessage::Graft { topic: t.to_string() })
                .await;
        }

        let payload = b"a beacon block".to_vec();
        router
            .handle_wire_message(
                origin,
                GossipWireMessage::Publish {
                    topic: t.to_string(),
                    compressed: compress(&payload),
                },
            )
            .await;

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), delivery.recv())
            .await
            .expect("delivery within timeout")
            .expect("message delivered");
        assert_eq!(delivered.data, payload);
        assert_eq!(delivered.from, origin);

        // Propagated to the mesh peer but not back to the origin.
        let targets = sender.publishes_to().await;
        assert!(targets.contains(&mesh_peer));
        assert!(!targets.contains(&origin));
        router.quit().await;
    }

    #[tokio::test]
    async fn duplicate_messages_are_dropped() {
        let sender = RecordingSender::new();
        let (router, mut delivery, _ev) = GossipRouter::spawn(sender);
        let t = topic(GossipKind::BeaconBlock);
        router.subscribe(t, accept_all()).await.unwrap();

        let origin = id();
        router.peer_connected(origin, Direction::Incoming).await;

        let payload = compress(b"same message");
        for _ in 0..3 {
            router
                .handle_wire_message(
                    origin,
                    GossipWireMessage::Publish {
                        topic: t.to_string(),
                        compressed: payload.clone(),
                    },
                )
                .await;
        }

        // Exactly one delivery.
        tokio::time::timeout(std::time::Duration::from_secs(2), delivery.recv())
            .await
            .expect("first delivery")
            .expect("message");
        let second = tokio::time::timeout(std::time::Duration::from_millis(200), delivery.recv())
            .await;
        assert!(second.is_err(), "duplicate must not be delivered");
        router.quit().await;
    }

    #[tokio::test]
    async fn oversized_and_garbage_payloads_are_rejected() {
        let sender = RecordingSender::new();
        let (router, _delivery, mut events) = GossipRouter::spawn(sender);
        // Attestation kind bounds decompression at 1 MiB.
        let t = topic(GossipKind::Attestation(0));
        router.subscribe(t, accept_all()).await.unwrap();

        let origin = id();
        router.peer_connected(origin, Direction::Incoming).await;

        // 2 MiB decompressed exceeds the attestation bound.
        let oversized = compress(&vec![0u8; 2 * 1024 * 1024]);
        router
            .handle_wire_message(
                origin,
                GossipWireMessage::Publish {
                    topic: t.to_string(),
                    compressed: oversized,
                },
            )
            .await;
        match tokio::time::timeout(std::time::Duration::from_secs(2), events.recv()).await {
            Ok(Some(GossipEvent::RejectedMessage { from })) => assert_eq!(from, origin),
            other => panic!("expected rejection event, got {other:?}"),
        }

        // Garbage snappy bytes.
        router
            .handle_wire_message(
                origin,
                GossipWireMessage::Publish {
                    topic: t.to_string(),
                    compressed: vec![0xff, 0xfe, 0xfd],
                },
            )
            .await;
        match tokio::time::timeout(std::time::Duration::from_secs(2), events.recv()).await {
            Ok(Some(GossipEvent::RejectedMessage { from })) => assert_eq!(from, origin),
            other => panic!("expected rejection event, got {other:?}"),
        }

        let snapshot = router.snapshot().await;
        assert_eq!(snapshot.failed_snappy, 2);
        router.quit().await;
    }

    #[tokio::test]
    async fn reject_validator_downranks_sender() {
        let sender = RecordingSender::new();
        let (router, _delivery, mut events) = GossipRouter::spawn(sender);
        let t = topic(GossipKind::BeaconBlock);
        router
            .subscribe(
                t,
                Validator::Sync(Arc::new(|_, _| ValidationResult::Reject)),
            )
            .await
            .unwrap();

        let origin = id();
        router.peer_connected(origin, Direction::Incoming).await;
        router
            .handle_wire_message(
                origin,
                GossipWireMessage::Publish {
                    topic: t.to_string(),
                    compressed: compress(b"invalid content"),
                },
            )
            .await;

        match tokio::time::timeout(std::time::Duration::from_secs(2), events.recv()).await {
            Ok(Some(GossipEvent::RejectedMessage { from })) => assert_eq!(from, origin),
            other => panic!("expected rejection event, got {other:?}"),
        }
        router.quit().await;
    }

    #[tokio::test]
    async fn async_validator_decides_propagation() {
        let sender = RecordingSender::new();
        let (router, mut delivery, _ev) = GossipRouter::spawn(sender);
        let t = topic(GossipKind::BeaconBlock);
        router
            .subscribe(
                t,
                Validator::Async(Arc::new(|_, _| {
                    Box::pin(async {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        ValidationResult::Accept
                    })
                })),
            )
            .await
            .unwrap();

        let origin = id();
        router.peer_connected(origin, Direction::Incoming).await;
        router
            .handle_wire_message(
                origin,
                GossipWireMessage::Publish {
                    topic: t.to_string(),
                    compressed: compress(b"heavy message"),
                },
            )
            .await;

        let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), delivery.recv())
            .await
            .expect("delivered")
            .expect("message");
        assert_eq!(delivered.data, b"heavy message");
        router.quit().await;
    }

    #[tokio::test]
    async fn snapshot_counts_mesh_directions() {
        let sender = RecordingSender::new();
        let (router, _delivery, _ev) = GossipRouter::spawn(sender);
        let t = topic(GossipKind::Attestation(7));
        router.subscribe(t, accept_all()).await.unwrap();

        let outbound = id();
        let inbound = id();
        router.peer_connected(outbound, Direction::Outgoing).await;
        router.peer_connected(inbound, Direction::Incoming).await;
        for p in [outbound, inbound] {
            router
                .handle_wire_message(p, GossipWireMessage::Graft { topic: t.to_string() })
                .await;
        }

        let snapshot = router.snapshot().await;
        let counters = snapshot.topics.get(&t.to_string()).expect("topic tracked");
        assert_eq!(counters.subscribed, 2);
        assert_eq!(counters.mesh, 2);
        assert_eq!(counters.mesh_outbound, 1);
        router.quit().await;
    }

    #[tokio::test]
    async fn no_peers_publish_is_soft_error_only_for_fanout_topics() {
        let sender = RecordingSender::new();
        let (router, _delivery, _ev) = GossipRouter::spawn(sender);

        let exit_topic = topic(GossipKind::VoluntaryExit);
        router.subscribe(exit_topic, accept_all()).await.unwrap();
        // Voluntary exits tolerate an empty fan-out.
        assert_eq!(router.publish(exit_topic, b"exit".to_vec()).await.unwrap(), 0);

        let block_topic = topic(GossipKind::BeaconBlock);
        router.subscribe(block_topic, accept_all()).await.unwrap();
        assert!(router.publish(block_topic, b"block".to_vec()).await.is_err());
        router.quit().await;
    }
}
