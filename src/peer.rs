//! # Peer Record and State Machine
//!
//! One [`Peer`] exists per known [`PeerId`], owned by the network actor and
//! reachable only through it. It tracks:
//!
//! - connection state {None, Connecting, Connected, Disconnecting,
//!   Disconnected} and direction
//! - a refcount of physical connections (duplicate transports to the same
//!   peer keep the first as authoritative; extras only bump the count)
//! - score, request quota, throughput EMA
//! - metadata, node record, agent string / client kind
//! - per-protocol opaque state slots indexed by protocol index
//! - a completion signal fired once the peer is fully disconnected
//!
//! ## Transitions
//!
//! ```text
//! None ──connect──► Connecting ──handshake ok──► Connected
//! Connected ──disconnect()──► Disconnecting ──last conn closed──► Disconnected
//! Disconnected ──re-encounter──► Connecting   (score resets to 0)
//! ```

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::{FULL_REPLENISH_TIME, MAX_REQUEST_QUOTA};
use crate::enr::NodeRecord;
use crate::identity::{ClientKind, PeerId};
use crate::messages::GoodbyeReason;
use crate::metadata::MetaData;
use crate::score::{PeerAction, PeerScore, ScoreTransition, TokenBucket};

// ============================================================================
// State and Direction
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Known (e.g. from discovery) but no connection event yet.
    None,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// What the actor should do after a connection-established event.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// First logical connection: run the per-protocol connect hooks.
    StartHandshake,
    /// Extra physical connection to an already-tracked peer: close the new
    /// transport, keep the first.
    Duplicate,
    /// Peer is on its way out; drop the connection.
    Rejected,
}

// ============================================================================
// Throughput EMA
// ============================================================================

/// Exponentially weighted bytes/sec estimate fed by Req/Resp transfers.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThroughputEma {
    bytes_per_sec: f64,
    samples: u64,
}

const THROUGHPUT_ALPHA: f64 = 0.1;

impl ThroughputEma {
    pub fn record(&mut self, bytes: usize, elapsed: Duration) {
        let secs = elapsed.as_secs_f64().max(1e-3);
        let rate = bytes as f64 / secs;
        if self.samples == 0 {
            self.bytes_per_sec = rate;
        } else {
            self.bytes_per_sec =
                THROUGHPUT_ALPHA * rate + (1.0 - THROUGHPUT_ALPHA) * self.bytes_per_sec;
        }
        self.samples += 1;
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

// ============================================================================
// Peer
// ============================================================================

pub struct Peer {
    pub peer_id: PeerId,
    state: ConnectionState,
    direction: Direction,
    /// Physical connections currently open to this peer.
    connections: u32,
    pub score: PeerScore,
    pub quota: TokenBucket,
    pub throughput: ThroughputEma,
    pub metadata: Option<MetaData>,
    pub node_record: Option<NodeRecord>,
    pub agent_version: Option<String>,
    pub client: ClientKind,
    /// Opaque per-protocol state, indexed by the registry's protocol index.
    protocol_states: Vec<Option<Arc<dyn Any + Send + Sync>>>,
    /// Reason chosen when the disconnect was scheduled; consumed on close.
    pub disconnect_reason: Option<GoodbyeReason>,
    pub metadata_failures: u32,
    pub last_metadata_at: Option<Instant>,
    pub connected_at: Option<Instant>,
    /// Fired once, when the peer becomes fully disconnected.
    disconnect_waiters: Vec<oneshot::Sender<()>>,
}

impl Peer {
    pub fn new(peer_id: PeerId, num_protocols: usize) -> Self {
        let mut protocol_states = Vec::with_capacity(num_protocols);
        protocol_states.resize_with(num_protocols, || None);
        Self {
            peer_id,
            state: ConnectionState::None,
            direction: Direction::Outgoing,
            connections: 0,
            score: PeerScore::new(),
            quota: TokenBucket::new(MAX_REQUEST_QUOTA, FULL_REPLENISH_TIME),
            throughput: ThroughputEma::default(),
            metadata: None,
            node_record: None,
            agent_version: None,
            client: ClientKind::Unknown,
            protocol_states,
            disconnect_reason: None,
            metadata_failures: 0,
            last_metadata_at: None,
            connected_at: None,
            disconnect_waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn connections(&self) -> u32 {
        self.connections
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether the peer can accept new work (requests, gossip).
    pub fn is_usable(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        )
    }

    pub fn set_agent_version(&mut self, agent: String) {
        self.client = ClientKind::from_agent_version(&agent);
        self.agent_version = Some(agent);
    }

    // ------------------------------------------------------------------
    // State machine events
    // ------------------------------------------------------------------

    /// A transport-level connection to this peer was established.
    pub fn on_connection_established(&mut self, direction: Direction) -> ConnectOutcome {
        match self.state {
            ConnectionState::None => {
                self.state = ConnectionState::Connecting;
                self.direction = direction;
                self.connections = 1;
                self.connected_at = Some(Instant::now());
                ConnectOutcome::StartHandshake
            }
            ConnectionState::Disconnected => {
                // Re-encounter: fresh start until the post-handshake
                // increment proves the peer out again.
                self.score.reset();
                self.metadata_failures = 0;
                self.disconnect_reason = None;
                self.state = ConnectionState::Connecting;
                self.direction = direction;
                self.connections = 1;
                self.connected_at = Some(Instant::now());
                ConnectOutcome::StartHandshake
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                // Multi-transport duplicate: the first logical connection
                // stays authoritative.
                self.connections += 1;
                ConnectOutcome::Duplicate
            }
            ConnectionState::Disconnecting => ConnectOutcome::Rejected,
        }
    }

    /// All per-protocol connect hooks completed for this peer.
    pub fn on_handshake_complete(&mut self) -> bool {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// A disconnect was requested. The caller records the seen-table entry
    /// *before* asking the transport to drop.
    pub fn begin_disconnect(&mut self, reason: GoodbyeReason) -> bool {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.state = ConnectionState::Disconnecting;
                self.disconnect_reason = Some(reason);
                true
            }
            _ => false,
        }
    }

    /// One physical connection closed. Returns true when that was the last
    /// one and the peer is now fully disconnected.
    pub fn on_connection_closed(&mut self) -> bool {
        self.connections = self.connections.saturating_sub(1);
        if self.connections > 0 {
            return false;
        }
        self.state = ConnectionState::Disconnected;
        self.connected_at = None;
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
        true
    }

    /// Await full disconnection. Resolves immediately if already there.
    pub fn disconnected_signal(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if self.state == ConnectionState::Disconnected {
            let _ = tx.send(());
        } else {
            self.disconnect_waiters.push(tx);
        }
        rx
    }

    // ------------------------------------------------------------------
    // Scoring and metadata
    // ------------------------------------------------------------------

    pub fn apply_score(&mut self, action: PeerAction) -> ScoreTransition {
        self.score.apply(action)
    }

    pub fn record_metadata(&mut self, metadata: MetaData) {
        self.metadata = Some(metadata);
        self.metadata_failures = 0;
        self.last_metadata_at = Some(Instant::now());
    }

    pub fn record_metadata_failure(&mut self) -> u32 {
        self.metadata_failures += 1;
        self.metadata_failures
    }

    // ------------------------------------------------------------------
    // Per-protocol state slots
    // ------------------------------------------------------------------

    pub fn set_protocol_state(&mut self, index: usize, state: Arc<dyn Any + Send + Sync>) {
        if index < self.protocol_states.len() {
            self.protocol_states[index] = Some(state);
        }
    }

    /// The raw slot for a protocol index; protocols downcast and mutate
    /// through their own interior mutability.
    pub fn protocol_state_raw(&self, index: usize) -> Option<Arc<dyn Any + Send + Sync>> {
        self.protocol_states.get(index)?.clone()
    }

    pub fn protocol_state<T: Send + Sync + 'static>(&self, index: usize) -> Option<Arc<T>> {
        self.protocol_state_raw(index)?.downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("connections", &self.connections)
            .field("score", &self.score.value())
            .field("client", &self.client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn peer() -> Peer {
        Peer::new(Keypair::generate().peer_id(), 4)
    }

    #[test]
    fn full_lifecycle_transitions() {
        let mut p = peer();
        assert_eq!(p.state(), ConnectionState::None);

        assert_eq!(
            p.on_connection_established(Direction::Outgoing),
            ConnectOutcome::StartHandshake
        );
        assert_eq!(p.state(), ConnectionState::Connecting);

        assert!(p.on_handshake_complete());
        assert_eq!(p.state(), ConnectionState::Connected);

        assert!(p.begin_disconnect(GoodbyeReason::ClientShutdown));
        assert_eq!(p.state(), ConnectionState::Disconnecting);

        assert!(p.on_connection_closed());
        assert_eq!(p.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn duplicate_connections_keep_first_authoritative() {
        let mut p = peer();
        assert_eq!(
            p.on_connection_established(Direction::Outgoing),
            ConnectOutcome::StartHandshake
        );
        assert_eq!(
            p.on_connection_established(Direction::Incoming),
            ConnectOutcome::Duplicate
        );
        assert_eq!(p.connections(), 2);
        // Direction of the first connection wins.
        assert_eq!(p.direction(), Direction::Outgoing);

        p.on_handshake_complete();
        p.begin_disconnect(GoodbyeReason::FaultOrError);

        // Not disconnected until the last physical connection closes.
        assert!(!p.on_connection_closed());
        assert_eq!(p.state(), ConnectionState::Disconnecting);
        assert!(p.on_connection_closed());
        assert_eq!(p.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn reencounter_resets_score() {
        let mut p = peer();
        p.on_connection_established(Direction::Outgoing);
        p.on_handshake_complete();
        p.apply_score(PeerAction::InvalidRequest);
        assert!(p.score.value() < 0);

        p.begin_disconnect(GoodbyeReason::PeerScoreLow);
        p.on_connection_closed();

        assert_eq!(
            p.on_connection_established(Direction::Incoming),
            ConnectOutcome::StartHandshake
        );
        assert_eq!(p.score.value(), 0);
        assert_eq!(p.direction(), Direction::Incoming);
    }

    #[test]
    fn connection_while_disconnecting_is_rejected() {
        let mut p = peer();
        p.on_connection_established(Direction::Outgoing);
        p.on_handshake_complete();
        p.begin_disconnect(GoodbyeReason::ClientShutdown);
        assert_eq!(
            p.on_connection_established(Direction::Incoming),
            ConnectOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn disconnect_signal_fires_once_fully_closed() {
        let mut p = peer();
        p.on_connection_established(Direction::Outgoing);
        let rx = p.disconnected_signal();
        p.begin_disconnect(GoodbyeReason::ClientShutdown);
        p.on_connection_closed();
        rx.await.expect("signal fired");

        // Already disconnected: resolves immediately.
        let rx = p.disconnected_signal();
        rx.await.expect("immediate signal");
    }

    #[test]
    fn protocol_state_slots_downcast() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct StatusState {
            exchanged: AtomicBool,
        }

        let mut p = peer();
        p.set_protocol_state(
            2,
            Arc::new(StatusState {
                exchanged: AtomicBool::new(false),
            }),
        );
        assert!(p.protocol_state::<StatusState>(0).is_none());
        p.protocol_state::<StatusState>(2)
            .unwrap()
            .exchanged
            .store(true, Ordering::SeqCst);
        assert!(p
            .protocol_state::<StatusState>(2)
            .unwrap()
            .exchanged
            .load(Ordering::SeqCst));
        // Wrong type yields None rather than panicking.
        assert!(p.protocol_state::<u32>(2).is_none());
    }

    #[test]
    fn throughput_ema_converges() {
        let mut ema = ThroughputEma::default();
        ema.record(1000, Duration::from_secs(1));
        assert!((ema.bytes_per_sec() - 1000.0).abs() < 1.0);
        for _ in 0..100 {
            ema.record(2000, Duration::from_secs(1));
        }
        assert!(ema.bytes_per_sec() > 1900.0);
        assert_eq!(ema.samples(), 101);
    }

    #[test]
    fn agent_version_sets_client_kind() {
        let mut p = peer();
        p.set_agent_version("Lighthouse/v4.5.0".into());
        assert_eq!(p.client, ClientKind::Lighthouse);
    }
}
