//! # Network Configuration
//!
//! All tunables for the networking core live here, snapshotted into a
//! [`NetworkConfig`] at construction time. Control loops and codecs read the
//! snapshot; nothing mutates it after startup.
//!
//! Constants are grouped by the subsystem that consumes them. Defaults match
//! mainnet consensus networking behavior.

use std::time::Duration;

// ============================================================================
// Req/Resp Timeouts
// ============================================================================

/// Timeout for opening a new multiplexed stream to a peer.
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-chunk read timeout on a response stream. Restarted for each chunk so
/// a slow but steady list response is not penalized.
pub const RESP_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for a full inbound request: read, handle, respond.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for an outbound dial attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Overall bound on graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Quotas
// ============================================================================

/// Per-peer request bucket capacity: a peer gets this many inbound requests
/// per replenish window before it is made to wait.
pub const MAX_REQUEST_QUOTA: f64 = 8.0;

/// Full bucket replenish time for request quotas.
pub const FULL_REPLENISH_TIME: Duration = Duration::from_secs(5);

// ============================================================================
// Peer Scoring
// ============================================================================

/// Lower clamp for the additive peer score. Reaching it schedules a
/// disconnect with reason `PeerScoreLow`.
pub const SCORE_LOW_LIMIT: i32 = -100;

/// Upper clamp for the additive peer score.
pub const SCORE_HIGH_LIMIT: i32 = 100;

// ============================================================================
// Connector
// ============================================================================

/// Number of dial workers draining the dial queue. Bounds how many
/// simultaneous connection attempts are ever in flight.
pub const CONCURRENT_CONNECTIONS: usize = 20;

/// Capacity of the dial queue feeding the connector workers.
pub const DIAL_QUEUE_CAPACITY: usize = 1024;

/// Maximum peers tracked in the seen table. LRU evicted beyond this.
pub const MAX_SEEN_PEERS: usize = 4096;

// ============================================================================
// Metadata Pinger
// ============================================================================

/// How often each connected peer's metadata is refreshed.
pub const METADATA_REQUEST_FREQUENCY: Duration = Duration::from_secs(30 * 60);

/// Consecutive metadata failures after which the peer is disconnected.
pub const METADATA_REQUEST_MAX_FAILURES: u32 = 3;

// ============================================================================
// Mesh Monitor
// ============================================================================

/// Cadence of the gossip mesh health scan.
pub const MESH_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period for peers whose metadata is not yet known before they become
/// trim candidates.
pub const TRIM_METADATA_GRACE: Duration = Duration::from_secs(60);

/// Topics subscribed by more than this fraction of peers are excluded from
/// the gossip-weighted trim score.
pub const TRIM_TOPIC_SATURATION: f64 = 0.75;

// ============================================================================
// Gossip
// ============================================================================

/// Hard upper bound on an uncompressed gossip payload. Exceeding it on
/// publish is a programming error.
pub const GOSSIP_MAX_SIZE: usize = 10 * 1024 * 1024;

/// Mesh degree targets (gossipsub d_low / d / d_high / d_out).
pub const MESH_D_LOW: usize = 5;
pub const MESH_D: usize = 8;
pub const MESH_D_HIGH: usize = 12;
pub const MESH_D_OUT: usize = 2;

/// Dedup cache size for gossip message ids.
pub const GOSSIP_SEEN_CACHE: usize = 16_384;

// ============================================================================
// Subnets
// ============================================================================

/// Number of attestation subnets.
pub const ATTESTATION_SUBNET_COUNT: usize = 64;

/// Number of sync-committee subnets.
pub const SYNC_COMMITTEE_SUBNET_COUNT: usize = 4;

/// Number of data-column custody subnets.
pub const DATA_COLUMN_SIDECAR_SUBNET_COUNT: usize = 128;

/// Peers targeted per attestation subnet before discovery is biased
/// toward it.
pub const TARGET_SUBNET_PEERS: usize = 6;

/// A configuration snapshot owned by the network. Field defaults mirror the
/// constants above; tests override individual fields.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Target number of connected peers.
    pub target_peers: usize,
    /// Hard cap on connected peers (target plus headroom for incoming).
    pub max_peers: usize,
    /// Peers that are never trimmed and always redialed.
    pub direct_peers: Vec<crate::identity::PeerId>,
    pub stream_open_timeout: Duration,
    pub resp_timeout: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_request_quota: f64,
    pub full_replenish_time: Duration,
    pub concurrent_connections: usize,
    pub metadata_request_frequency: Duration,
    pub metadata_request_max_failures: u32,
    pub mesh_scan_interval: Duration,
    pub mesh_d_low: usize,
    pub mesh_d: usize,
    pub mesh_d_high: usize,
    pub mesh_d_out: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            target_peers: 100,
            max_peers: 110,
            direct_peers: Vec::new(),
            stream_open_timeout: STREAM_OPEN_TIMEOUT,
            resp_timeout: RESP_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            max_request_quota: MAX_REQUEST_QUOTA,
            full_replenish_time: FULL_REPLENISH_TIME,
            concurrent_connections: CONCURRENT_CONNECTIONS,
            metadata_request_frequency: METADATA_REQUEST_FREQUENCY,
            metadata_request_max_failures: METADATA_REQUEST_MAX_FAILURES,
            mesh_scan_interval: MESH_SCAN_INTERVAL,
            mesh_d_low: MESH_D_LOW,
            mesh_d: MESH_D,
            mesh_d_high: MESH_D_HIGH,
            mesh_d_out: MESH_D_OUT,
        }
    }
}

impl NetworkConfig {
    /// Headroom above `target_peers` before the trimmer starts evicting.
    pub fn peer_headroom(&self) -> usize {
        self.max_peers.saturating_sub(self.target_peers)
    }
}
