//! # Peer Metadata and Fork Digests
//!
//! [`MetaData`] is the small record peers exchange over the `metadata`
//! Req/Resp protocol: a sequence number plus subnet subscription bitfields
//! and (from the data-column fork onward) the custody subnet count.
//!
//! Two wire versions exist:
//!
//! | Version | Fields | Size |
//! |---------|--------|------|
//! | v2 | seq, attnets, syncnets | 17 bytes |
//! | v3 | v2 + custody subnet count | 25 bytes |
//!
//! Older-version responses widen into the current struct with zeroed new
//! fields. Which version a node speaks is decided by the current fork epoch
//! via the [`ForkTable`].
//!
//! [`LocalMetadata`] guards the node's own record: every observable change
//! bumps `seq_number`, which is therefore strictly monotonic.

use crate::codec::ReqRespError;
use crate::config::{ATTESTATION_SUBNET_COUNT, SYNC_COMMITTEE_SUBNET_COUNT};
use crate::enr::Bitfield;

/// Wire sizes for the two metadata versions.
pub const METADATA_V2_SIZE: usize = 8 + ATTESTATION_SUBNET_COUNT / 8 + 1;
pub const METADATA_V3_SIZE: usize = METADATA_V2_SIZE + 8;

// ============================================================================
// MetaData
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaData {
    pub seq_number: u64,
    pub attnets: Bitfield,
    pub syncnets: Bitfield,
    /// Custody subnet count; zero for peers answering with v2.
    pub custody_subnet_count: u64,
}

impl Default for MetaData {
    fn default() -> Self {
        Self {
            seq_number: 0,
            attnets: Bitfield::attnets(),
            syncnets: Bitfield::syncnets(),
            custody_subnet_count: 0,
        }
    }
}

impl MetaData {
    /// Fixed-size SSZ encoding for the given wire version.
    pub fn to_ssz_bytes(&self, version: MetadataVersion) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_V3_SIZE);
        out.extend_from_slice(&self.seq_number.to_le_bytes());
        out.extend_from_slice(self.attnets.as_bytes());
        out.extend_from_slice(self.syncnets.as_bytes());
        if version == MetadataVersion::V3 {
            out.extend_from_slice(&self.custody_subnet_count.to_le_bytes());
        }
        out
    }

    /// Decode either wire version by exact size; v2 widens with a zero
    /// custody count.
    pub fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ReqRespError> {
        let version = match bytes.len() {
            METADATA_V2_SIZE => MetadataVersion::V2,
            METADATA_V3_SIZE => MetadataVersion::V3,
            _ => return Err(ReqRespError::InvalidSszBytes),
        };

        let seq_number = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
        let attnets_end = 8 + ATTESTATION_SUBNET_COUNT / 8;
        let attnets = Bitfield::from_bytes(
            bytes[8..attnets_end].to_vec(),
            ATTESTATION_SUBNET_COUNT,
        )
        .ok_or(ReqRespError::InvalidSszBytes)?;
        let syncnets = Bitfield::from_bytes(
            bytes[attnets_end..attnets_end + 1].to_vec(),
            SYNC_COMMITTEE_SUBNET_COUNT,
        )
        .ok_or(ReqRespError::InvalidSszBytes)?;

        let custody_subnet_count = match version {
            MetadataVersion::V2 => 0,
            MetadataVersion::V3 => u64::from_le_bytes(
                bytes[attnets_end + 1..attnets_end + 9]
                    .try_into()
                    .expect("8 bytes"),
            ),
        };

        Ok(Self {
            seq_number,
            attnets,
            syncnets,
            custody_subnet_count,
        })
    }
}

/// Metadata wire version, selected by fork epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataVersion {
    V2,
    V3,
}

// ============================================================================
// Local Metadata
// ============================================================================

/// The node's own metadata. Mutations that change observable content bump
/// `seq_number`; unchanged writes do not, keeping the sequence strictly
/// monotonic per content change.
#[derive(Clone, Debug, Default)]
pub struct LocalMetadata {
    inner: MetaData,
}

impl LocalMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> &MetaData {
        &self.inner
    }

    pub fn seq_number(&self) -> u64 {
        self.inner.seq_number
    }

    pub fn update_attnets(&mut self, attnets: Bitfield) -> bool {
        if self.inner.attnets == attnets {
            return false;
        }
        self.inner.attnets = attnets;
        self.inner.seq_number += 1;
        true
    }

    pub fn update_syncnets(&mut self, syncnets: Bitfield) -> bool {
        if self.inner.syncnets == syncnets {
            return false;
        }
        self.inner.syncnets = syncnets;
        self.inner.seq_number += 1;
        true
    }

    pub fn update_custody_subnet_count(&mut self, csc: u64) -> bool {
        if self.inner.custody_subnet_count == csc {
            return false;
        }
        self.inner.custody_subnet_count = csc;
        self.inner.seq_number += 1;
        true
    }
}

// ============================================================================
// Fork Table
// ============================================================================

/// One scheduled fork: activation epoch, digest, and which metadata version
/// the network speaks from this fork on.
#[derive(Clone, Copy, Debug)]
pub struct ForkEntry {
    pub epoch: u64,
    pub digest: [u8; 4],
    pub metadata_version: MetadataVersion,
}

/// Fork digests indexed by activation epoch, ascending. Resolves the digest
/// for a slot's epoch and the set of digests accepted as context bytes.
#[derive(Clone, Debug)]
pub struct ForkTable {
    entries: Vec<ForkEntry>,
}

impl ForkTable {
    /// `entries` must be non-empty and sorted ascending by epoch; genesis is
    /// entry zero. Violations are setup programming errors.
    pub fn new(entries: Vec<ForkEntry>) -> Self {
        assert!(!entries.is_empty(), "fork table requires a genesis entry");
        assert!(
            entries.windows(2).all(|w| w[0].epoch < w[1].epoch),
            "fork table must be sorted by epoch"
        );
        Self { entries }
    }

    /// A single-fork table for tests and isolated devnets.
    pub fn single(digest: [u8; 4]) -> Self {
        Self::new(vec![ForkEntry {
            epoch: 0,
            digest,
            metadata_version: MetadataVersion::V2,
        }])
    }

    fn entry_at(&self, epoch: u64) -> &ForkEntry {
        self.entries
            .iter()
            .rev()
            .find(|e| e.epoch <= epoch)
            .unwrap_or(&self.entries[0])
    }

    pub fn digest_at(&self, epoch: u64) -> [u8; 4] {
        self.entry_at(epoch).digest
    }

    pub fn metadata_version_at(&self, epoch: u64) -> MetadataVersion {
        self.entry_at(epoch).metadata_version
    }

    /// All digests this node recognizes as valid context bytes.
    pub fn known_digests(&self) -> Vec<[u8; 4]> {
        self.entries.iter().map(|e| e.digest).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> MetaData {
        let mut attnets = Bitfield::attnets();
        attnets.set(3, true);
        attnets.set(40, true);
        let mut syncnets = Bitfield::syncnets();
        syncnets.set(1, true);
        MetaData {
            seq_number: 42,
            attnets,
            syncnets,
            custody_subnet_count: 4,
        }
    }

    #[test]
    fn v3_round_trip() {
        let md = sample_metadata();
        let bytes = md.to_ssz_bytes(MetadataVersion::V3);
        assert_eq!(bytes.len(), METADATA_V3_SIZE);
        assert_eq!(MetaData::from_ssz_bytes(&bytes).unwrap(), md);
    }

    #[test]
    fn v2_widens_with_zero_custody_count() {
        let md = sample_metadata();
        let bytes = md.to_ssz_bytes(MetadataVersion::V2);
        assert_eq!(bytes.len(), METADATA_V2_SIZE);
        let decoded = MetaData::from_ssz_bytes(&bytes).unwrap();
        assert_eq!(decoded.seq_number, md.seq_number);
        assert_eq!(decoded.attnets, md.attnets);
        assert_eq!(decoded.custody_subnet_count, 0);
    }

    #[test]
    fn wrong_size_rejected() {
        assert_eq!(
            MetaData::from_ssz_bytes(&[0u8; 16]),
            Err(ReqRespError::InvalidSszBytes)
        );
        assert_eq!(
            MetaData::from_ssz_bytes(&[0u8; 26]),
            Err(ReqRespError::InvalidSszBytes)
        );
    }

    #[test]
    fn seq_number_strictly_monotonic_on_content_change() {
        let mut local = LocalMetadata::new();
        assert_eq!(local.seq_number(), 0);

        let mut attnets = Bitfield::attnets();
        attnets.set(7, true);
        assert!(local.update_attnets(attnets.clone()));
        assert_eq!(local.seq_number(), 1);

        // No content change, no bump.
        assert!(!local.update_attnets(attnets));
        assert_eq!(local.seq_number(), 1);

        assert!(local.update_custody_subnet_count(8));
        assert_eq!(local.seq_number(), 2);

        let mut syncnets = Bitfield::syncnets();
        syncnets.set(0, true);
        assert!(local.update_syncnets(syncnets));
        assert_eq!(local.seq_number(), 3);
    }

    #[test]
    fn fork_table_resolves_by_epoch() {
        let table = ForkTable::new(vec![
            ForkEntry {
                epoch: 0,
                digest: [0, 0, 0, 1],
                metadata_version: MetadataVersion::V2,
            },
            ForkEntry {
                epoch: 100,
                digest: [0, 0, 0, 2],
                metadata_version: MetadataVersion::V2,
            },
            ForkEntry {
                epoch: 200,
                digest: [0, 0, 0, 3],
                metadata_version: MetadataVersion::V3,
            },
        ]);

        assert_eq!(table.digest_at(0), [0, 0, 0, 1]);
        assert_eq!(table.digest_at(99), [0, 0, 0, 1]);
        assert_eq!(table.digest_at(100), [0, 0, 0, 2]);
        assert_eq!(table.digest_at(5000), [0, 0, 0, 3]);
        assert_eq!(table.metadata_version_at(150), MetadataVersion::V2);
        assert_eq!(table.metadata_version_at(200), MetadataVersion::V3);
        assert_eq!(table.known_digests().len(), 3);
    }

    #[test]
    #[should_panic(expected = "sorted")]
    fn fork_table_rejects_unsorted_entries() {
        ForkTable::new(vec![
            ForkEntry {
                epoch: 100,
                digest: [0; 4],
                metadata_version: MetadataVersion::V2,
            },
            ForkEntry {
                epoch: 50,
                digest: [1; 4],
                metadata_version: MetadataVersion::V2,
            },
        ]);
    }
}
