//! # Discovery Adapter
//!
//! The discovery protocol itself (Kademlia-style tables, liveness checks)
//! is an external collaborator; this module consumes its query/update
//! interface through the [`Discovery`] trait and adapts results for the
//! connector:
//!
//! - queries are biased by a [`SubnetFilter`] (union of attestation, sync
//!   committee, and data-column subnets currently unhealthy), with a
//!   minimum-score floor whenever a specific subnet is needed
//! - returned records are signature-verified and decoded into dialable
//!   [`PeerAddress`]es
//! - candidates already connected, suppressed, or pending are dropped
//!
//! Local record updates flow the other way: metadata changes re-sign the
//! record and republish it through the same trait.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::config::DATA_COLUMN_SIDECAR_SUBNET_COUNT;
use crate::enr::{Bitfield, NodeRecord, PeerAddress};
use crate::identity::PeerId;

/// Minimum peer score requested from discovery when the query targets
/// specific subnets.
const SUBNET_QUERY_MIN_SCORE: i32 = 1;

// ============================================================================
// Subnet Filter
// ============================================================================

/// Which subnets a discovery query should bias toward.
#[derive(Clone, Debug)]
pub struct SubnetFilter {
    pub attnets: Bitfield,
    pub syncnets: Bitfield,
    pub cscnets: Bitfield,
    /// Score floor for returned candidates; set automatically when any
    /// subnet bit is set.
    pub min_score: Option<i32>,
}

impl SubnetFilter {
    pub fn empty() -> Self {
        Self {
            attnets: Bitfield::attnets(),
            syncnets: Bitfield::syncnets(),
            cscnets: Bitfield::new(DATA_COLUMN_SIDECAR_SUBNET_COUNT),
            min_score: None,
        }
    }

    pub fn new(attnets: Bitfield, syncnets: Bitfield, cscnets: Bitfield) -> Self {
        let targeted = !attnets.is_zero() || !syncnets.is_zero() || !cscnets.is_zero();
        Self {
            attnets,
            syncnets,
            cscnets,
            min_score: targeted.then_some(SUBNET_QUERY_MIN_SCORE),
        }
    }

    /// True when no subnet is requested; the query falls back to general
    /// peer discovery.
    pub fn is_empty(&self) -> bool {
        self.attnets.is_zero() && self.syncnets.is_zero() && self.cscnets.is_zero()
    }

    /// Whether a record's advertised subnets satisfy any requested bit.
    pub fn matches(&self, record: &NodeRecord) -> bool {
        if self.is_empty() {
            return true;
        }
        self.attnets.iter_set().any(|i| record.attnets.get(i))
            || self.syncnets.iter_set().any(|i| record.syncnets.get(i))
            || (!self.cscnets.is_zero() && record.csc > 0)
    }
}

// ============================================================================
// Discovery Trait (consumed interface)
// ============================================================================

/// The slice of the discovery protocol this crate consumes.
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Query for up to `max` candidate records matching the filter.
    async fn query_peers(&self, filter: &SubnetFilter, max: usize) -> Vec<NodeRecord>;

    /// Republish the local record after a content change.
    async fn update_local_record(&self, record: NodeRecord);

    /// Close the discovery service.
    async fn close(&self);
}

// ============================================================================
// Adapter
// ============================================================================

pub struct DiscoveryAdapter {
    discovery: Arc<dyn Discovery>,
}

impl DiscoveryAdapter {
    pub fn new(discovery: Arc<dyn Discovery>) -> Self {
        Self { discovery }
    }

    /// Query discovery and reduce the results to fresh dialable candidates.
    /// `known` holds peers that are connected, pending, or seen-suppressed.
    pub async fn discover_candidates(
        &self,
        filter: &SubnetFilter,
        max: usize,
        known: &HashSet<PeerId>,
    ) -> Vec<PeerAddress> {
        let records = self.discovery.query_peers(filter, max).await;
        trace!(returned = records.len(), "discovery query completed");

        let mut candidates = Vec::new();
        let mut picked = HashSet::new();
        for record in records {
            if known.contains(&record.peer_id) || picked.contains(&record.peer_id) {
                continue;
            }
            if record.verify().is_err() {
                debug!(peer = %record.peer_id, "discarding discovery record with bad signature");
                continue;
            }
            if !filter.matches(&record) {
                continue;
            }
            let Some(address) = record.peer_address() else {
                continue;
            };
            picked.insert(record.peer_id);
            candidates.push(address);
            if candidates.len() >= max {
                break;
            }
        }

        debug!(
            candidates = candidates.len(),
            targeted = !filter.is_empty(),
            "discovery produced dial candidates"
        );
        candidates
    }

    pub async fn publish_local_record(&self, record: NodeRecord) {
        self.discovery.update_local_record(record).await;
    }

    pub async fn close(&self) {
        self.discovery.close().await;
    }
}

// ============================================================================
// Static Discovery (devnets and tests)
// ============================================================================

/// Table-backed discovery for tests and isolated devnets: serves a fixed
/// set of records, honoring the subnet filter.
pub struct StaticDiscovery {
    records: tokio::sync::Mutex<Vec<NodeRecord>>,
}

impl StaticDiscovery {
    pub fn new(records: Vec<NodeRecord>) -> Self {
        Self {
            records: tokio::sync::Mutex::new(records),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn query_peers(&self, filter: &SubnetFilter, max: usize) -> Vec<NodeRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .take(max)
            .cloned()
            .collect()
    }

    async fn update_local_record(&self, record: NodeRecord) {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.iter_mut().find(|r| r.peer_id == record.peer_id) {
            if record.seq > existing.seq {
                *existing = record;
            }
        } else {
            records.push(record);
        }
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enr::{Eth2ForkId, LocalNodeRecord};
    use crate::identity::Keypair;

    fn record_with_attnets(subnets: &[usize]) -> NodeRecord {
        let mut local = LocalNodeRecord::new(
            Keypair::generate(),
            Eth2ForkId {
                fork_digest: [1, 2, 3, 4],
                next_fork_version: [0; 4],
                next_fork_epoch: u64::MAX,
            },
            "127.0.0.1:9100".parse().unwrap(),
        );
        let mut attnets = Bitfield::attnets();
        for s in subnets {
            attnets.set(*s, true);
        }
        local.set_attnets(attnets);
        local.record().clone()
    }

    fn filter_for(subnets: &[usize]) -> SubnetFilter {
        let mut attnets = Bitfield::attnets();
        for s in subnets {
            attnets.set(*s, true);
        }
        SubnetFilter::new(
            attnets,
            Bitfield::syncnets(),
            Bitfield::new(DATA_COLUMN_SIDECAR_SUBNET_COUNT),
        )
    }

    #[test]
    fn targeted_filter_sets_min_score() {
        assert_eq!(filter_for(&[3, 7]).min_score, Some(SUBNET_QUERY_MIN_SCORE));
        assert_eq!(SubnetFilter::empty().min_score, None);
        assert!(SubnetFilter::empty().is_empty());
    }

    #[tokio::test]
    async fn subnet_biased_query_returns_matching_candidates() {
        let matching = record_with_attnets(&[3]);
        let other = record_with_attnets(&[10]);
        let discovery = Arc::new(StaticDiscovery::new(vec![other, matching.clone()]));
        let adapter = DiscoveryAdapter::new(discovery);

        let candidates = adapter
            .discover_candidates(&filter_for(&[3, 7]), 16, &HashSet::new())
            .await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].peer_id, matching.peer_id);
        assert!(!candidates[0].addresses.is_empty());
    }

    #[tokio::test]
    async fn known_peers_and_bad_signatures_are_dropped() {
        let good = record_with_attnets(&[1]);
        let known_peer = record_with_attnets(&[1]);
        let mut tampered = record_with_attnets(&[1]);
        tampered.csc = 99; // invalidates the signature

        let discovery = Arc::new(StaticDiscovery::new(vec![
            good.clone(),
            known_peer.clone(),
            tampered,
        ]));
        let adapter = DiscoveryAdapter::new(discovery);

        let mut known = HashSet::new();
        known.insert(known_peer.peer_id);

        let candidates = adapter
            .discover_candidates(&filter_for(&[1]), 16, &known)
            .await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].peer_id, good.peer_id);
    }

    #[tokio::test]
    async fn empty_filter_accepts_any_record() {
        let discovery = Arc::new(StaticDiscovery::new(vec![
            record_with_attnets(&[]),
            record_with_attnets(&[5]),
        ]));
        let adapter = DiscoveryAdapter::new(discovery);
        let candidates = adapter
            .discover_candidates(&SubnetFilter::empty(), 16, &HashSet::new())
            .await;
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn local_record_republish_keeps_highest_seq() {
        let keypair = Keypair::generate();
        let mut local = LocalNodeRecord::new(
            keypair,
            Eth2ForkId {
                fork_digest: [0; 4],
                next_fork_version: [0; 4],
                next_fork_epoch: u64::MAX,
            },
            "127.0.0.1:9200".parse().unwrap(),
        );
        let discovery = Arc::new(StaticDiscovery::new(Vec::new()));
        let adapter = DiscoveryAdapter::new(discovery.clone());

        adapter.publish_local_record(local.record().clone()).await;
        local.set_csc(4);
        adapter.publish_local_record(local.record().clone()).await;

        let stored = discovery
            .query_peers(&SubnetFilter::empty(), 10)
            .await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].seq, 2);
        assert_eq!(stored[0].csc, 4);
    }
}
