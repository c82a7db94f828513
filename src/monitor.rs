//! # Mesh Monitor
//!
//! Periodic health scan of the gossip mesh. Two outputs drive the control
//! loops:
//!
//! 1. **Needy subnets**: each subnet topic is classified against the mesh
//!    degree targets; the resulting bitfields bias the next discovery
//!    query. Severity order: `lowOutgoing` (few subscribed peers) >
//!    `belowD` (thin mesh) > `belowDOut` (too few outbound mesh members) >
//!    `notHighOutgoing` (room up to d_high).
//! 2. **Trim candidates**: when the pool exceeds its target, peers are
//!    ranked by a keep-score of `10 × stability subnets` plus a
//!    gossip-weighted topic component (5000/mesh-size for mesh membership,
//!    1000/subscriber-count for plain subscription; topics subscribed by
//!    more than 75 % of peers are excluded to avoid bias). Direct peers are
//!    never trimmed, and peers whose metadata is still unknown get a grace
//!    period.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{
    DATA_COLUMN_SIDECAR_SUBNET_COUNT, MESH_D_HIGH, MESH_D_LOW, MESH_D_OUT, TRIM_METADATA_GRACE,
    TRIM_TOPIC_SATURATION,
};
use crate::discovery::SubnetFilter;
use crate::enr::Bitfield;
use crate::gossip::MeshSnapshot;
use crate::identity::PeerId;

/// Cap on subnets requested from discovery in one query.
const MAX_SUBNET_QUERY: usize = 16;

// ============================================================================
// Subnet Topic Parsing
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SubnetRef {
    Attestation(usize),
    SyncCommittee(usize),
    DataColumn(usize),
}

/// Extract the subnet reference from a full topic string, if it is a
/// subnet topic.
fn subnet_of_topic(topic: &str) -> Option<SubnetRef> {
    // "/eth2/<digest>/<kind>/ssz_snappy"
    let kind = topic.split('/').nth(3)?;
    if let Some(n) = kind.strip_prefix("beacon_attestation_") {
        return n.parse().ok().map(SubnetRef::Attestation);
    }
    if let Some(n) = kind.strip_prefix("sync_committee_") {
        // Not the contribution-and-proof topic.
        return n.parse().ok().map(SubnetRef::SyncCommittee);
    }
    if let Some(n) = kind.strip_prefix("data_column_sidecar_") {
        return n.parse().ok().map(SubnetRef::DataColumn);
    }
    None
}

// ============================================================================
// Subnet Health
// ============================================================================

/// Health condition of one subnet topic, most severe first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubnetHealth {
    LowOutgoing,
    BelowD,
    BelowDOut,
    NotHighOutgoing,
    Healthy,
}

fn classify(subscribed: usize, mesh: usize, mesh_outbound: usize) -> SubnetHealth {
    if subscribed < MESH_D_LOW {
        SubnetHealth::LowOutgoing
    } else if mesh < MESH_D_LOW {
        SubnetHealth::BelowD
    } else if mesh_outbound < MESH_D_OUT {
        SubnetHealth::BelowDOut
    } else if mesh < MESH_D_HIGH {
        SubnetHealth::NotHighOutgoing
    } else {
        SubnetHealth::Healthy
    }
}

/// Scan the snapshot and build the discovery filter for unhealthy subnets,
/// most severe first, capped at [`MAX_SUBNET_QUERY`] subnets.
pub fn needy_subnets(snapshot: &MeshSnapshot) -> SubnetFilter {
    let mut classified: Vec<(SubnetHealth, SubnetRef)> = Vec::new();
    for (topic, counters) in &snapshot.topics {
        let Some(subnet) = subnet_of_topic(topic) else {
            continue;
        };
        let health = classify(counters.subscribed, counters.mesh, counters.mesh_outbound);
        if health != SubnetHealth::Healthy {
            classified.push((health, subnet));
        }
    }
    classified.sort();

    let mut attnets = Bitfield::attnets();
    let mut syncnets = Bitfield::syncnets();
    let mut cscnets = Bitfield::new(DATA_COLUMN_SIDECAR_SUBNET_COUNT);
    for (_, subnet) in classified.into_iter().take(MAX_SUBNET_QUERY) {
        match subnet {
            SubnetRef::Attestation(n) => attnets.set(n, true),
            SubnetRef::SyncCommittee(n) => syncnets.set(n, true),
            SubnetRef::DataColumn(n) => cscnets.set(n, true),
        }
    }

    let filter = SubnetFilter::new(attnets, syncnets, cscnets);
    if !filter.is_empty() {
        debug!(
            attnets = filter.attnets.num_set(),
            syncnets = filter.syncnets.num_set(),
            cscnets = filter.cscnets.num_set(),
            "mesh scan found needy subnets"
        );
    }
    filter
}

// ============================================================================
// Trim Selection
// ============================================================================

/// Per-peer facts the trimmer needs from the peer map.
#[derive(Clone, Debug)]
pub struct TrimCandidate {
    pub peer: PeerId,
    /// Attestation subnets the peer is committed to long-term.
    pub stability_subnets: usize,
    /// Configured direct peers are never trimmed.
    pub is_direct: bool,
    /// Whether a metadata exchange has completed.
    pub metadata_known: bool,
    pub connected_at: Option<Instant>,
}

/// Pick up to `excess` peers to trim, lowest keep-score first.
pub fn select_peers_to_trim(
    candidates: &[TrimCandidate],
    snapshot: &MeshSnapshot,
    excess: usize,
) -> Vec<PeerId> {
    if excess == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let total_peers = snapshot.peer_topics.len().max(1);
    // Topics most peers subscribe to carry no signal about which peer to
    // keep; exclude them from the gossip component.
    let saturated: HashSet<&String> = snapshot
        .topics
        .keys()
        .filter(|topic| {
            let subscribers = snapshot
                .peer_topics
                .values()
                .filter(|topics| topics.contains(*topic))
                .count();
            subscribers as f64 > TRIM_TOPIC_SATURATION * total_peers as f64
        })
        .collect();

    let now = Instant::now();
    let mut scored: Vec<(f64, PeerId)> = Vec::new();
    for candidate in candidates {
        if candidate.is_direct {
            continue;
        }
        // New peers without metadata yet get a grace period before they
        // can be churned out.
        if !candidate.metadata_known {
            let age = candidate
                .connected_at
                .map(|t| now.duration_since(t))
                .unwrap_or(Duration::ZERO);
            if age < TRIM_METADATA_GRACE {
                continue;
            }
        }

        let mut score = 10.0 * candidate.stability_subnets as f64;
        let peer_topics = snapshot.peer_topics.get(&candidate.peer);
        for (topic, counters) in &snapshot.topics {
            if saturated.contains(topic) {
                continue;
            }
            let subscribed_to_topic =
                peer_topics.map(|t| t.contains(topic)).unwrap_or(false);
            if !subscribed_to_topic {
                continue;
            }
            if counters.mesh > 0 {
                score += 5000.0 / counters.mesh as f64;
            } else if counters.subscribed > 0 {
                score += 1000.0 / counters.subscribed as f64;
            }
        }
        scored.push((score, candidate.peer));
    }

    scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(excess).map(|(_, p)| p).collect()
}
