//! # Connector and Seen Table
//!
//! Outbound dialing runs through a bounded queue drained by a fixed pool of
//! workers, so at most `CONCURRENT_CONNECTIONS` dial attempts are ever in
//! flight. Each worker:
//!
//! 1. checks the seen table and live peer map (skip if suppressed or
//!    already connected)
//! 2. attempts the connection under `CONNECT_TIMEOUT`
//! 3. records the outcome in the seen table with a reason-appropriate TTL
//!    and clears the pending-dial entry
//!
//! The [`SeenTable`] suppresses immediate reconnection after a peer leaves.
//! Expiry depends on why it left: a peer on the wrong network stays
//! suppressed for a day, a trim victim for a minute.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::config::{CONCURRENT_CONNECTIONS, CONNECT_TIMEOUT, DIAL_QUEUE_CAPACITY, MAX_SEEN_PEERS};
use crate::enr::PeerAddress;
use crate::identity::PeerId;
use crate::messages::GoodbyeReason;

// ============================================================================
// Seen Reasons and TTLs
// ============================================================================

/// Why a peer entered the seen table. Each reason carries its own
/// reconnection-suppression TTL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeenReason {
    /// Dial attempt timed out.
    Timeout,
    /// Dial attempt failed outright (refused, unreachable).
    Dead,
    /// Peer said goodbye because it is shutting down.
    ClientShutdown,
    /// Peer is on a different network/fork.
    IrrelevantNetwork,
    /// Protocol fault or local error.
    FaultOrError,
    /// Disconnected for low score.
    ScoreLow,
    /// Benign eviction (peer-count trimming, post-dial cooldown); expires
    /// quickly to allow reconnect.
    BenignReconnect,
}

impl SeenReason {
    pub fn ttl(&self) -> Duration {
        match self {
            SeenReason::Timeout => Duration::from_secs(5 * 60),
            SeenReason::Dead => Duration::from_secs(5 * 60),
            SeenReason::ClientShutdown => Duration::from_secs(10 * 60),
            SeenReason::IrrelevantNetwork => Duration::from_secs(24 * 60 * 60),
            SeenReason::FaultOrError => Duration::from_secs(10 * 60),
            SeenReason::ScoreLow => Duration::from_secs(60 * 60),
            SeenReason::BenignReconnect => Duration::from_secs(60),
        }
    }

    pub fn from_goodbye(reason: GoodbyeReason) -> Self {
        match reason {
            GoodbyeReason::ClientShutdown => SeenReason::ClientShutdown,
            GoodbyeReason::IrrelevantNetwork => SeenReason::IrrelevantNetwork,
            GoodbyeReason::PeerScoreLow => SeenReason::ScoreLow,
            GoodbyeReason::FaultOrError | GoodbyeReason::Unknown(_) => SeenReason::FaultOrError,
        }
    }
}

// ============================================================================
// Seen Table
// ============================================================================

/// Bounded map `PeerId → expiry`. While an entry is unexpired, no new dial
/// attempt is made to that peer.
pub struct SeenTable {
    entries: LruCache<PeerId, Instant>,
}

impl SeenTable {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SEEN_PEERS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).expect("capacity must be nonzero")),
        }
    }

    pub fn add(&mut self, peer: PeerId, reason: SeenReason) {
        self.add_with_ttl(peer, reason.ttl());
    }

    pub fn add_with_ttl(&mut self, peer: PeerId, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        // A longer suppression already in place wins.
        match self.entries.peek(&peer) {
            Some(existing) if *existing > expiry => {}
            _ => {
                self.entries.put(peer, expiry);
            }
        }
    }

    /// Whether the peer is currently suppressed. Expired entries are
    /// dropped on the way.
    pub fn is_seen(&mut self, peer: &PeerId) -> bool {
        match self.entries.peek(peer) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                self.entries.pop(peer);
                false
            }
            None => false,
        }
    }

    pub fn expiry(&self, peer: &PeerId) -> Option<Instant> {
        self.entries.peek(peer).copied()
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.entries.pop(peer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SeenTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Dialer Seam
// ============================================================================

/// Result of one dial attempt, recorded into the seen table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DialOutcome {
    /// Connection established; a short cooldown still lands in the seen
    /// table so the connector does not immediately redial on churn.
    Connected,
    Timeout,
    Failed,
    /// Dial was skipped (suppressed or already connected); only the
    /// pending-dial entry is cleared.
    Skipped,
}

/// The connector's view of the network: dial admission, the transport dial
/// itself, and outcome bookkeeping.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// False when the peer is suppressed, already connected, or otherwise
    /// not worth dialing; the worker skips it.
    async fn should_dial(&self, peer: &PeerId) -> bool;

    /// Attempt the connection. The worker applies the timeout.
    async fn dial(&self, address: &PeerAddress) -> anyhow::Result<()>;

    /// Record the disposition and clear the pending-dial entry.
    async fn record_outcome(&self, peer: &PeerId, outcome: DialOutcome);
}

// ============================================================================
// Connector
// ============================================================================

/// Handle to the dial worker pool.
pub struct Connector {
    queue_tx: mpsc::Sender<PeerAddress>,
    workers: JoinSet<()>,
}

impl Connector {
    /// Launch `worker_count` dial workers over a bounded queue.
    pub fn spawn(dialer: Arc<dyn Dialer>, worker_count: usize, connect_timeout: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<PeerAddress>(DIAL_QUEUE_CAPACITY);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let dialer = dialer.clone();
            let queue_rx = queue_rx.clone();
            workers.spawn(async move {
                dial_worker(worker_id, dialer, queue_rx, connect_timeout).await;
            });
        }

        Self { queue_tx, workers }
    }

    pub fn spawn_default(dialer: Arc<dyn Dialer>) -> Self {
        Self::spawn(dialer, CONCURRENT_CONNECTIONS, CONNECT_TIMEOUT)
    }

    /// Enqueue a dial target. Returns false when the queue is full; callers
    /// treat that as backpressure, not an error.
    pub fn enqueue(&self, address: PeerAddress) -> bool {
        match self.queue_tx.try_send(address) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(addr)) => {
                debug!(peer = %addr.peer_id, "dial queue full, dropping candidate");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop all workers. In-flight dials are aborted.
    pub fn shutdown(mut self) {
        self.workers.abort_all();
    }
}

async fn dial_worker(
    worker_id: usize,
    dialer: Arc<dyn Dialer>,
    queue_rx: Arc<Mutex<mpsc::Receiver<PeerAddress>>>,
    connect_timeout: Duration,
) {
    loop {
        // Hold the queue lock only across the dequeue so the other workers
        // can pop while this one dials.
        let address = {
            let mut rx = queue_rx.lock().await;
            match rx.recv().await {
                Some(addr) => addr,
                None => break,
            }
        };

        let peer = address.peer_id;
        if !dialer.should_dial(&peer).await {
            trace!(worker = worker_id, peer = %peer, "skipping dial (seen or connected)");
            dialer.record_outcome(&peer, DialOutcome::Skipped).await;
            continue;
        }

        trace!(worker = worker_id, peer = %peer, addrs = ?address.addresses, "dialing");
        let outcome = match tokio::time::timeout(connect_timeout, dialer.dial(&address)).await {
            Ok(Ok(())) => DialOutcome::Connected,
            Ok(Err(e)) => {
                debug!(worker = worker_id, peer = %peer, error = %e, "dial failed");
                DialOutcome::Failed
            }
            Err(_) => {
                warn!(worker = worker_id, peer = %peer, "dial timed out");
                DialOutcome::Timeout
            }
        };
        dialer.record_outcome(&peer, outcome).await;
    }
}
