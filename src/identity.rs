//! # Node Identity
//!
//! Core identity types for the networking layer:
//!
//! - [`Keypair`]: Ed25519 signing keypair (the node's long-term network key)
//! - [`PeerId`]: 32-byte public key serving as the peer's stable identifier
//! - [`Keystore`]: password-protected persistence of the network key
//! - [`ClientKind`]: consensus-client detection from the peer's agent string
//!
//! ## Identity Model
//!
//! PeerId = Ed25519 public key. The transport layer binds this identity to
//! the TLS session (see `crypto`), so a connected peer's id is always
//! authenticated.
//!
//! ## Key Persistence
//!
//! The network key is stored under the data directory as an encrypted
//! keystore. The ciphertext is the secret key XORed with a BLAKE3-derived
//! keystream (salt + password), with a BLAKE3 checksum over the plaintext to
//! detect a wrong password. The path `"random"` is a sentinel for an
//! ephemeral key that is never written to disk.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Sentinel key path requesting an ephemeral (never persisted) key.
pub const RANDOM_KEY_SENTINEL: &str = "random";

/// Password used when the operator supplies none.
///
/// INSECURE: offers no protection against an attacker with file access. Only
/// acceptable for tests and throwaway devnets; production deployments must
/// pass a real password.
pub const INSECURE_KEYSTORE_PASSWORD: &str = "pharos-insecure-default";

/// Keystore derivation context string (BLAKE3 `derive_key` domain).
const KEYSTORE_KDF_CONTEXT: &str = "pharos 2025-02 network keystore v1";

// ============================================================================
// PeerId
// ============================================================================

/// Stable peer identifier: the peer's long-term Ed25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("peer id must be hex")?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("peer id must be 32 bytes"))?;
        Ok(Self(arr))
    }

    /// Whether the bytes decode to a valid Ed25519 point.
    pub fn is_valid(&self) -> bool {
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Short form used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&bytes),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing_key.verifying_key().to_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub(crate) fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.peer_id().short())
    }
}

// ============================================================================
// Keystore
// ============================================================================

/// On-disk envelope for the encrypted network key.
#[derive(Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    salt: [u8; 16],
    /// Secret key XORed with the derived keystream.
    ciphertext: [u8; 32],
    /// BLAKE3 of the plaintext secret; detects a wrong password.
    checksum: [u8; 32],
}

const KEYSTORE_VERSION: u32 = 1;

/// Loads or creates the network key at a configured path.
///
/// - `path == "random"`: ephemeral key, nothing touches disk.
/// - relative `path`: resolved against the data directory.
/// - missing file: a fresh key is generated and written.
pub struct Keystore;

impl Keystore {
    pub fn load_or_create(path: &str, data_dir: &Path, password: &str) -> Result<Keypair> {
        if path == RANDOM_KEY_SENTINEL {
            info!("using ephemeral network key");
            return Ok(Keypair::generate());
        }

        let resolved = Self::resolve(path, data_dir);
        if resolved.exists() {
            let keypair = Self::read(&resolved, password)
                .with_context(|| format!("failed to load keystore {}", resolved.display()))?;
            info!(peer_id = %keypair.peer_id(), path = %resolved.display(), "loaded network key");
            Ok(keypair)
        } else {
            let keypair = Keypair::generate();
            Self::write(&resolved, &keypair, password)
                .with_context(|| format!("failed to write keystore {}", resolved.display()))?;
            if password == INSECURE_KEYSTORE_PASSWORD {
                warn!(
                    path = %resolved.display(),
                    "network key written with the insecure default password"
                );
            }
            info!(peer_id = %keypair.peer_id(), path = %resolved.display(), "generated network key");
            Ok(keypair)
        }
    }

    fn resolve(path: &str, data_dir: &Path) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            data_dir.join(p)
        }
    }

    fn read(path: &Path, password: &str) -> Result<Keypair> {
        let bytes = std::fs::read(path)?;
        let file: KeystoreFile = bincode::deserialize(&bytes).context("corrupt keystore")?;
        if file.version != KEYSTORE_VERSION {
            bail!("unsupported keystore version {}", file.version);
        }
        let mut secret = file.ciphertext;
        Self::apply_keystream(&mut secret, password, &file.salt);
        if *blake3::hash(&secret).as_bytes() != file.checksum {
            bail!("keystore checksum mismatch (wrong password?)");
        }
        Ok(Keypair::from_secret_bytes(secret))
    }

    fn write(path: &Path, keypair: &Keypair, password: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);

        let secret = keypair.secret_key_bytes();
        let checksum = *blake3::hash(&secret).as_bytes();
        let mut ciphertext = secret;
        Self::apply_keystream(&mut ciphertext, password, &salt);

        let file = KeystoreFile {
            version: KEYSTORE_VERSION,
            salt,
            ciphertext,
            checksum,
        };
        std::fs::write(path, bincode::serialize(&file)?)?;
        Ok(())
    }

    /// XOR `buf` with a BLAKE3-XOF keystream derived from password and salt.
    /// Applying twice round-trips.
    fn apply_keystream(buf: &mut [u8; 32], password: &str, salt: &[u8; 16]) {
        let key = blake3::derive_key(KEYSTORE_KDF_CONTEXT, password.as_bytes());
        let mut hasher = blake3::Hasher::new_keyed(&key);
        hasher.update(salt);
        let mut stream = [0u8; 32];
        hasher.finalize_xof().fill(&mut stream);
        for (b, k) in buf.iter_mut().zip(stream.iter()) {
            *b ^= k;
        }
    }
}

// ============================================================================
// Agent Detection
// ============================================================================

/// Known consensus-layer client implementations, detected from the agent
/// version string a peer advertises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Lighthouse,
    Prysm,
    Teku,
    Lodestar,
    Grandine,
    Nimbus,
    Unknown,
}

impl ClientKind {
    /// Substring match on the lowercased agent string.
    pub fn from_agent_version(agent: &str) -> Self {
        let lower = agent.to_lowercase();
        const TABLE: &[(&str, ClientKind)] = &[
            ("lighthouse", ClientKind::Lighthouse),
            ("prysm", ClientKind::Prysm),
            ("teku", ClientKind::Teku),
            ("lodestar", ClientKind::Lodestar),
            ("grandine", ClientKind::Grandine),
            ("nimbus", ClientKind::Nimbus),
        ];
        for (needle, kind) in TABLE {
            if lower.contains(needle) {
                return *kind;
            }
        }
        ClientKind::Unknown
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientKind::Lighthouse => "lighthouse",
            ClientKind::Prysm => "prysm",
            ClientKind::Teku => "teku",
            ClientKind::Lodestar => "lodestar",
            ClientKind::Grandine => "grandine",
            ClientKind::Nimbus => "nimbus",
            ClientKind::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_round_trips_through_hex() {
        let keypair = Keypair::generate();
        let id = keypair.peer_id();
        let restored = PeerId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, restored);
        assert!(id.is_valid());
    }

    #[test]
    fn peer_id_rejects_bad_hex() {
        assert!(PeerId::from_hex("zz").is_err());
        assert!(PeerId::from_hex("aabb").is_err());
    }

    #[test]
    fn keystore_round_trip() {
        let dir = std::env::temp_dir().join(format!("pharos-ks-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let keypair =
            Keystore::load_or_create("net.key", &dir, "hunter2").expect("create keystore");
        let reloaded =
            Keystore::load_or_create("net.key", &dir, "hunter2").expect("reload keystore");
        assert_eq!(keypair.peer_id(), reloaded.peer_id());

        let wrong = Keystore::load_or_create("net.key", &dir, "wrong-password");
        assert!(wrong.is_err(), "wrong password must not decrypt");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn keystore_absolute_path_ignores_data_dir() {
        let dir = std::env::temp_dir().join(format!("pharos-ks-abs-{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let abs = dir.join("abs.key");
        let keypair = Keystore::load_or_create(
            abs.to_str().unwrap(),
            Path::new("/some/other/dir"),
            "pw",
        )
        .unwrap();
        assert!(abs.exists());
        assert!(keypair.peer_id().is_valid());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn random_sentinel_never_touches_disk() {
        let dir = Path::new("/nonexistent-data-dir-for-pharos-tests");
        let keypair = Keystore::load_or_create(RANDOM_KEY_SENTINEL, dir, "pw").unwrap();
        assert!(keypair.peer_id().is_valid());
    }

    #[test]
    fn agent_detection_matches_known_clients() {
        assert_eq!(
            ClientKind::from_agent_version("Lighthouse/v4.5.0-1234abc/x86_64-linux"),
            ClientKind::Lighthouse
        );
        assert_eq!(
            ClientKind::from_agent_version("Prysm/v4.1.1/deadbeef"),
            ClientKind::Prysm
        );
        assert_eq!(ClientKind::from_agent_version("teku/v23.11.0"), ClientKind::Teku);
        assert_eq!(
            ClientKind::from_agent_version("js-libp2p lodestar/v1.12"),
            ClientKind::Lodestar
        );
        assert_eq!(ClientKind::from_agent_version("Grandine/0.4"), ClientKind::Grandine);
        assert_eq!(
            ClientKind::from_agent_version("nimbus-eth2/v23.10"),
            ClientKind::Nimbus
        );
        assert_eq!(ClientKind::from_agent_version("erigon/caplin"), ClientKind::Unknown);
    }
}
