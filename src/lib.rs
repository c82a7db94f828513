//! # Pharos - Beacon-Chain P2P Networking Core
//!
//! Pharos is the consensus-layer networking stack of a beacon node: it
//! establishes and maintains peer connections over an encrypted,
//! authenticated, multiplexed transport (QUIC), runs the length-prefixed
//! snappy-framed Req/Resp protocols (blocks, blobs, data columns,
//! metadata), distributes gossip messages across per-topic meshes, and
//! manages peer lifecycle: scoring, request quotas, reconnect suppression,
//! and mesh health.
//!
//! ## Architecture
//!
//! The crate uses the **actor pattern** throughout: each stateful
//! component has a cheap-to-clone public handle and a private actor that
//! owns all mutable state and processes commands sequentially. No locks
//! guard the peer path.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `network` | Orchestrator: wiring, lifecycle, public send/subscribe API |
//! | `reqresp` | Req/Resp engine: outbound requests, inbound dispatch |
//! | `codec` | Chunk codec: response codes, LEB128, framed snappy |
//! | `gossip` | Gossip router: topics, meshes, validation pipeline |
//! | `peer` | Peer record and connection state machine |
//! | `score` | Peer scoring and request-quota token buckets |
//! | `pool` | Bounded directional peer pool |
//! | `connector` | Dial worker pool and reconnect-suppression seen table |
//! | `discovery` | Consumed discovery interface and candidate adapter |
//! | `monitor` | Mesh health scan and peer trim selection |
//! | `registry` | Protocol registry with densely indexed state slots |
//! | `enr` | Signed node records and subnet bitfields |
//! | `metadata` | Peer metadata versions and the fork-digest table |
//! | `messages` | Req/Resp protocol table and typed messages |
//! | `identity` | Network keys, peer ids, keystore, client detection |
//! | `crypto` | TLS binding of peer ids to transport sessions |
//!
//! ## Error Model
//!
//! Wire-facing paths return typed errors ([`ReqRespError`]); protocol
//! violations feed heavy descoring, transport noise feeds light
//! descoring. Control loops log and continue. Only mount-time invariant
//! violations panic.

pub mod codec;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod discovery;
pub mod enr;
pub mod gossip;
pub mod identity;
pub mod messages;
pub mod metadata;
pub mod monitor;
pub mod network;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod reqresp;
pub mod score;

pub use codec::{ReqRespError, ResponseCode};
pub use config::NetworkConfig;
pub use discovery::{Discovery, StaticDiscovery, SubnetFilter};
pub use enr::{Bitfield, NodeRecord, PeerAddress};
pub use gossip::{
    GossipKind, GossipMessage, GossipTopic, ValidationResult, Validator,
};
pub use identity::{ClientKind, Keypair, Keystore, PeerId};
pub use messages::{GoodbyeReason, Request, Response, StatusMessage, SupportedProtocol};
pub use metadata::{ForkEntry, ForkTable, MetaData, MetadataVersion};
pub use network::{ChainView, Network, PeerInfo, StaticChain};
pub use registry::Protocol;
pub use score::PeerAction;
