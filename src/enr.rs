//! # Signed Node Records
//!
//! A [`NodeRecord`] is the signed, versioned record of a node's identity and
//! capabilities that discovery serves and consumes:
//!
//! | Field | Meaning |
//! |-------|---------|
//! | `eth2` | fork digest + next fork, identifying chain and fork |
//! | `attnets` | attestation-subnet subscription bitfield |
//! | `syncnets` | sync-committee-subnet subscription bitfield |
//! | `csc` | custody subnet count for data columns |
//! | addresses | IPv4/IPv6 with discovery (UDP) and stream (QUIC) ports |
//!
//! Every observable mutation of the local record bumps the sequence number
//! and re-signs ([`LocalNodeRecord`]); stale copies are detected by seq
//! comparison. Remote records decode into dialable [`PeerAddress`]es, where
//! the stream port is preferred over the discovery port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::config::{ATTESTATION_SUBNET_COUNT, SYNC_COMMITTEE_SUBNET_COUNT};
use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, NODE_RECORD_SIGNATURE_DOMAIN,
};
use crate::identity::{Keypair, PeerId};

// ============================================================================
// Subnet Bitfields
// ============================================================================

/// Fixed-width bit array indicating subscription to each subnet index.
/// Width is set at construction and preserved across serialization.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_bits: usize,
}

impl Bitfield {
    pub fn new(num_bits: usize) -> Self {
        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits,
        }
    }

    pub fn attnets() -> Self {
        Self::new(ATTESTATION_SUBNET_COUNT)
    }

    pub fn syncnets() -> Self {
        Self::new(SYNC_COMMITTEE_SUBNET_COUNT)
    }

    pub fn len(&self) -> usize {
        self.num_bits
    }

    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    pub fn get(&self, index: usize) -> bool {
        if index >= self.num_bits {
            return false;
        }
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Out-of-range indices are ignored rather than panicking; remote
    /// bitfields drive some call sites.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.num_bits {
            return;
        }
        if value {
            self.bits[index / 8] |= 1 << (index % 8);
        } else {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    /// Bitwise OR with another field of the same width.
    pub fn union(&mut self, other: &Bitfield) {
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= *b;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn num_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_bits).filter(|i| self.get(*i))
    }

    /// Raw little-endian byte form (SSZ bitvector layout).
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn from_bytes(bytes: Vec<u8>, num_bits: usize) -> Option<Self> {
        if bytes.len() != num_bits.div_ceil(8) {
            return None;
        }
        Some(Self {
            bits: bytes,
            num_bits,
        })
    }
}

impl std::fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bitfield[{}]({})", self.num_bits, hex::encode(&self.bits))
    }
}

// ============================================================================
// Fork Identity
// ============================================================================

/// Chain + fork identity carried in the `eth2` record field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eth2ForkId {
    /// First 4 bytes of hash(fork version ‖ genesis validators root).
    pub fork_digest: [u8; 4],
    pub next_fork_version: [u8; 4],
    pub next_fork_epoch: u64,
}

// ============================================================================
// NodeRecord
// ============================================================================

/// Signed node record. The signature covers every field except itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub peer_id: PeerId,
    pub seq: u64,
    pub eth2: Eth2ForkId,
    pub attnets: Bitfield,
    pub syncnets: Bitfield,
    /// Custody subnet count for data-column sampling.
    pub csc: u64,
    pub ip4: Option<Ipv4Addr>,
    pub udp4: Option<u16>,
    pub quic4: Option<u16>,
    pub ip6: Option<Ipv6Addr>,
    pub udp6: Option<u16>,
    pub quic6: Option<u16>,
    pub signature: Vec<u8>,
}

impl NodeRecord {
    fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        bincode::serialize(&unsigned).expect("node record serialization is infallible")
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        verify_with_domain(
            &self.peer_id,
            NODE_RECORD_SIGNATURE_DOMAIN,
            &self.signing_bytes(),
            &self.signature,
        )
    }

    /// Dialable addresses, stream (QUIC) port preferred over the discovery
    /// UDP port, IPv4 and IPv6 both accepted when present.
    pub fn peer_address(&self) -> Option<PeerAddress> {
        let mut addrs = Vec::new();
        if let Some(ip) = self.ip4 {
            if let Some(port) = self.quic4.or(self.udp4) {
                addrs.push(SocketAddr::new(IpAddr::V4(ip), port));
            }
        }
        if let Some(ip) = self.ip6 {
            if let Some(port) = self.quic6.or(self.udp6) {
                addrs.push(SocketAddr::new(IpAddr::V6(ip), port));
            }
        }
        if addrs.is_empty() {
            return None;
        }
        Some(PeerAddress {
            peer_id: self.peer_id,
            addresses: addrs,
        })
    }
}

/// A resolved dial target: peer id plus candidate socket addresses in
/// preference order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddress {
    pub peer_id: PeerId,
    pub addresses: Vec<SocketAddr>,
}

impl PeerAddress {
    pub fn new(peer_id: PeerId, addresses: Vec<SocketAddr>) -> Self {
        Self { peer_id, addresses }
    }
}

// ============================================================================
// LocalNodeRecord
// ============================================================================

/// The node's own record. All mutation goes through methods that bump `seq`
/// and re-sign, and only when the observable content actually changed, so
/// the sequence number is strictly monotonic per content change.
pub struct LocalNodeRecord {
    keypair: Keypair,
    record: NodeRecord,
}

impl LocalNodeRecord {
    pub fn new(keypair: Keypair, eth2: Eth2ForkId, listen: SocketAddr) -> Self {
        let peer_id = keypair.peer_id();
        let mut record = NodeRecord {
            peer_id,
            seq: 1,
            eth2,
            attnets: Bitfield::attnets(),
            syncnets: Bitfield::syncnets(),
            csc: 0,
            ip4: None,
            udp4: None,
            quic4: None,
            ip6: None,
            udp6: None,
            quic6: None,
            signature: Vec::new(),
        };
        match listen.ip() {
            IpAddr::V4(ip) => {
                record.ip4 = Some(ip);
                record.quic4 = Some(listen.port());
            }
            IpAddr::V6(ip) => {
                record.ip6 = Some(ip);
                record.quic6 = Some(listen.port());
            }
        }
        let mut local = Self { keypair, record };
        local.resign();
        local
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn seq(&self) -> u64 {
        self.record.seq
    }

    /// Replace the eth2 fork id (on fork transitions). Returns true if the
    /// record changed.
    pub fn set_eth2(&mut self, eth2: Eth2ForkId) -> bool {
        self.mutate(|r| {
            if r.eth2 == eth2 {
                false
            } else {
                r.eth2 = eth2;
                true
            }
        })
    }

    pub fn set_attnets(&mut self, attnets: Bitfield) -> bool {
        self.mutate(|r| {
            if r.attnets == attnets {
                false
            } else {
                r.attnets = attnets;
                true
            }
        })
    }

    pub fn set_syncnets(&mut self, syncnets: Bitfield) -> bool {
        self.mutate(|r| {
            if r.syncnets == syncnets {
                false
            } else {
                r.syncnets = syncnets;
                true
            }
        })
    }

    pub fn set_csc(&mut self, csc: u64) -> bool {
        self.mutate(|r| {
            if r.csc == csc {
                false
            } else {
                r.csc = csc;
                true
            }
        })
    }

    fn mutate(&mut self, f: impl FnOnce(&mut NodeRecord) -> bool) -> bool {
        let changed = f(&mut self.record);
        if changed {
            self.record.seq += 1;
            self.resign();
        }
        changed
    }

    fn resign(&mut self) {
        let bytes = self.record.signing_bytes();
        self.record.signature =
            sign_with_domain(&self.keypair, NODE_RECORD_SIGNATURE_DOMAIN, &bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fork_id() -> Eth2ForkId {
        Eth2ForkId {
            fork_digest: [0xde, 0xad, 0xbe, 0xef],
            next_fork_version: [0, 0, 0, 5],
            next_fork_epoch: u64::MAX,
        }
    }

    fn local_record() -> LocalNodeRecord {
        LocalNodeRecord::new(
            Keypair::generate(),
            fork_id(),
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    #[test]
    fn bitfield_set_get_union() {
        let mut a = Bitfield::attnets();
        a.set(3, true);
        a.set(7, true);
        assert!(a.get(3) && a.get(7));
        assert!(!a.get(4));
        assert_eq!(a.num_set(), 2);
        assert_eq!(a.iter_set().collect::<Vec<_>>(), vec![3, 7]);

        let mut b = Bitfield::attnets();
        b.set(7, true);
        b.set(63, true);
        a.union(&b);
        assert_eq!(a.iter_set().collect::<Vec<_>>(), vec![3, 7, 63]);

        // Out-of-range access is a no-op.
        a.set(64, true);
        assert!(!a.get(64));
    }

    #[test]
    fn fresh_record_verifies() {
        let local = local_record();
        assert!(local.record().verify().is_ok());
        assert_eq!(local.seq(), 1);
    }

    #[test]
    fn mutation_bumps_seq_and_resigns() {
        let mut local = local_record();

        let mut attnets = Bitfield::attnets();
        attnets.set(12, true);
        assert!(local.set_attnets(attnets.clone()));
        assert_eq!(local.seq(), 2);
        assert!(local.record().verify().is_ok());

        // Same content does not bump.
        assert!(!local.set_attnets(attnets));
        assert_eq!(local.seq(), 2);

        assert!(local.set_csc(4));
        assert_eq!(local.seq(), 3);
        assert!(local.record().verify().is_ok());
    }

    #[test]
    fn tampered_record_fails_verification() {
        let mut local = local_record();
        local.set_csc(8);
        let mut record = local.record().clone();
        record.csc = 128;
        assert!(record.verify().is_err());
    }

    #[test]
    fn peer_address_prefers_stream_port() {
        let local = local_record();
        let mut record = local.record().clone();
        record.udp4 = Some(9999);
        let addr = record.peer_address().expect("has address");
        assert_eq!(addr.addresses[0].port(), 9000, "quic port wins over udp");

        record.quic4 = None;
        let addr = record.peer_address().expect("has address");
        assert_eq!(addr.addresses[0].port(), 9999, "udp port as fallback");

        record.ip6 = Some(Ipv6Addr::LOCALHOST);
        record.quic6 = Some(9001);
        let addr = record.peer_address().expect("has address");
        assert_eq!(addr.addresses.len(), 2, "v4 and v6 both accepted");
    }
}
