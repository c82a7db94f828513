//! # Req/Resp Protocol Table and Messages
//!
//! Every Req/Resp protocol this node speaks is an entry in
//! [`SupportedProtocol`], carrying its wire name/version, response shape
//! (single chunk vs chunk list), whether response chunks are prefixed with
//! fork-digest context bytes, and per-type size bounds.
//!
//! Requests are small, fully typed, and hand-SSZ'd here (they are all fixed
//! shapes or lists of fixed shapes). Response payloads for block/blob/column
//! protocols stay opaque SSZ bytes plus their fork context; their schemas
//! belong to the application layer.

use crate::codec::ReqRespError;
use crate::metadata::{MetaData, METADATA_V3_SIZE};

/// Root hash type used throughout requests.
pub type Root = [u8; 32];

// ============================================================================
// Size Bounds
// ============================================================================

/// Upper bound on an uncompressed block/blob/column response chunk.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Maximum blocks a single by-range/by-root request may ask for.
pub const MAX_REQUEST_BLOCKS: u64 = 1024;

/// Maximum blob sidecars per request.
pub const MAX_REQUEST_BLOB_SIDECARS: u64 = 768;

/// Maximum data-column sidecars per request.
pub const MAX_REQUEST_DATA_COLUMN_SIDECARS: u64 = 16_384;

/// Status message wire size: digest(4) + root(32) + epoch(8) + root(32) + slot(8).
pub const STATUS_MESSAGE_SIZE: usize = 84;

// ============================================================================
// Supported Protocols
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SupportedProtocol {
    StatusV1,
    GoodbyeV1,
    PingV1,
    MetadataV2,
    MetadataV3,
    BlocksByRangeV2,
    BlocksByRootV2,
    BlobsByRangeV1,
    BlobsByRootV1,
    DataColumnsByRangeV1,
    DataColumnsByRootV1,
}

impl SupportedProtocol {
    pub const ALL: &'static [SupportedProtocol] = &[
        SupportedProtocol::StatusV1,
        SupportedProtocol::GoodbyeV1,
        SupportedProtocol::PingV1,
        SupportedProtocol::MetadataV2,
        SupportedProtocol::MetadataV3,
        SupportedProtocol::BlocksByRangeV2,
        SupportedProtocol::BlocksByRootV2,
        SupportedProtocol::BlobsByRangeV1,
        SupportedProtocol::BlobsByRootV1,
        SupportedProtocol::DataColumnsByRangeV1,
        SupportedProtocol::DataColumnsByRootV1,
    ];

    /// Wire name, also used as the throttle-counter tag.
    pub fn name(&self) -> &'static str {
        match self {
            SupportedProtocol::StatusV1 => "status",
            SupportedProtocol::GoodbyeV1 => "goodbye",
            SupportedProtocol::PingV1 => "ping",
            SupportedProtocol::MetadataV2 | SupportedProtocol::MetadataV3 => "metadata",
            SupportedProtocol::BlocksByRangeV2 => "beacon_blocks_by_range",
            SupportedProtocol::BlocksByRootV2 => "beacon_blocks_by_root",
            SupportedProtocol::BlobsByRangeV1 => "blob_sidecars_by_range",
            SupportedProtocol::BlobsByRootV1 => "blob_sidecars_by_root",
            SupportedProtocol::DataColumnsByRangeV1 => "data_column_sidecars_by_range",
            SupportedProtocol::DataColumnsByRootV1 => "data_column_sidecars_by_root",
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            SupportedProtocol::MetadataV2 | SupportedProtocol::BlocksByRangeV2
            | SupportedProtocol::BlocksByRootV2 => 2,
            SupportedProtocol::MetadataV3 => 3,
            _ => 1,
        }
    }

    /// Full stream identifier written at stream open.
    pub fn protocol_id(&self) -> String {
        format!(
            "/eth2/beacon_chain/req/{}/{}/ssz_snappy",
            self.name(),
            self.version()
        )
    }

    pub fn from_protocol_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| p.protocol_id() == id)
    }

    /// Whether the request body is empty (no request chunk on the wire).
    pub fn request_is_empty(&self) -> bool {
        matches!(
            self,
            SupportedProtocol::MetadataV2 | SupportedProtocol::MetadataV3
        )
    }

    /// Single-chunk response types read exactly one chunk; the rest read
    /// until clean EOF or the chunk cap.
    pub fn is_single_chunk(&self) -> bool {
        matches!(
            self,
            SupportedProtocol::StatusV1
                | SupportedProtocol::GoodbyeV1
                | SupportedProtocol::PingV1
                | SupportedProtocol::MetadataV2
                | SupportedProtocol::MetadataV3
        )
    }

    /// Fork-polymorphic responses carry 4 context bytes per chunk.
    pub fn has_context_bytes(&self) -> bool {
        !self.is_single_chunk()
    }

    pub fn max_request_size(&self) -> usize {
        match self {
            SupportedProtocol::StatusV1 => STATUS_MESSAGE_SIZE,
            SupportedProtocol::GoodbyeV1 | SupportedProtocol::PingV1 => 8,
            SupportedProtocol::MetadataV2 | SupportedProtocol::MetadataV3 => 0,
            SupportedProtocol::BlocksByRangeV2 => 24,
            SupportedProtocol::BlocksByRootV2 => 32 * MAX_REQUEST_BLOCKS as usize,
            SupportedProtocol::BlobsByRangeV1 => 16,
            SupportedProtocol::BlobsByRootV1 => 32 * MAX_REQUEST_BLOB_SIDECARS as usize,
            SupportedProtocol::DataColumnsByRangeV1 => {
                16 + 8 * MAX_REQUEST_DATA_COLUMN_SIDECARS as usize
            }
            SupportedProtocol::DataColumnsByRootV1 => {
                40 * MAX_REQUEST_DATA_COLUMN_SIDECARS as usize
            }
        }
    }

    /// Per-chunk uncompressed response bound.
    pub fn max_response_chunk_size(&self) -> usize {
        match self {
            SupportedProtocol::StatusV1 => STATUS_MESSAGE_SIZE,
            SupportedProtocol::GoodbyeV1 | SupportedProtocol::PingV1 => 8,
            SupportedProtocol::MetadataV2 | SupportedProtocol::MetadataV3 => METADATA_V3_SIZE,
            _ => MAX_PAYLOAD_SIZE,
        }
    }

    /// Hard cap on response chunks, independent of what the request asked
    /// for.
    pub fn max_response_chunks(&self) -> u64 {
        match self {
            p if p.is_single_chunk() => 1,
            SupportedProtocol::BlocksByRangeV2 | SupportedProtocol::BlocksByRootV2 => {
                MAX_REQUEST_BLOCKS
            }
            SupportedProtocol::BlobsByRangeV1 | SupportedProtocol::BlobsByRootV1 => {
                MAX_REQUEST_BLOB_SIDECARS
            }
            _ => MAX_REQUEST_DATA_COLUMN_SIDECARS,
        }
    }
}

// ============================================================================
// Goodbye Reasons
// ============================================================================

/// Reason codes on the `goodbye` wire. Values at and above 128 are
/// implementation-private.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GoodbyeReason {
    ClientShutdown,
    IrrelevantNetwork,
    FaultOrError,
    PeerScoreLow,
    Unknown(u64),
}

impl GoodbyeReason {
    pub fn as_u64(&self) -> u64 {
        match self {
            GoodbyeReason::ClientShutdown => 1,
            GoodbyeReason::IrrelevantNetwork => 2,
            GoodbyeReason::FaultOrError => 3,
            GoodbyeReason::PeerScoreLow => 237,
            GoodbyeReason::Unknown(code) => *code,
        }
    }

    pub fn from_u64(code: u64) -> Self {
        match code {
            1 => GoodbyeReason::ClientShutdown,
            2 => GoodbyeReason::IrrelevantNetwork,
            3 => GoodbyeReason::FaultOrError,
            237 => GoodbyeReason::PeerScoreLow,
            other => GoodbyeReason::Unknown(other),
        }
    }
}

// ============================================================================
// Typed Requests
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusMessage {
    pub fork_digest: [u8; 4],
    pub finalized_root: Root,
    pub finalized_epoch: u64,
    pub head_root: Root,
    pub head_slot: u64,
}

impl StatusMessage {
    pub fn to_ssz_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STATUS_MESSAGE_SIZE);
        out.extend_from_slice(&self.fork_digest);
        out.extend_from_slice(&self.finalized_root);
        out.extend_from_slice(&self.finalized_epoch.to_le_bytes());
        out.extend_from_slice(&self.head_root);
        out.extend_from_slice(&self.head_slot.to_le_bytes());
        out
    }

    pub fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ReqRespError> {
        if bytes.len() != STATUS_MESSAGE_SIZE {
            return Err(ReqRespError::InvalidSszBytes);
        }
        Ok(Self {
            fork_digest: bytes[0..4].try_into().expect("4 bytes"),
            finalized_root: bytes[4..36].try_into().expect("32 bytes"),
            finalized_epoch: u64::from_le_bytes(bytes[36..44].try_into().expect("8 bytes")),
            head_root: bytes[44..76].try_into().expect("32 bytes"),
            head_slot: u64::from_le_bytes(bytes[76..84].try_into().expect("8 bytes")),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlocksByRangeRequest {
    pub start_slot: u64,
    pub count: u64,
    pub step: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlocksByRootRequest {
    pub roots: Vec<Root>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobsByRangeRequest {
    pub start_slot: u64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobsByRootRequest {
    pub roots: Vec<Root>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataColumnsByRangeRequest {
    pub start_slot: u64,
    pub count: u64,
    pub columns: Vec<u64>,
}

/// `(block root, column index)` pair identifying one column sidecar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataColumnIdentifier {
    pub block_root: Root,
    pub index: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataColumnsByRootRequest {
    pub ids: Vec<DataColumnIdentifier>,
}

/// All requests this node can send or serve.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Status(StatusMessage),
    Goodbye(GoodbyeReason),
    Ping(u64),
    Metadata,
    BlocksByRange(BlocksByRangeRequest),
    BlocksByRoot(BlocksByRootRequest),
    BlobsByRange(BlobsByRangeRequest),
    BlobsByRoot(BlobsByRootRequest),
    DataColumnsByRange(DataColumnsByRangeRequest),
    DataColumnsByRoot(DataColumnsByRootRequest),
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, ReqRespError> {
    bytes
        .get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or(ReqRespError::InvalidSszBytes)
}

fn decode_root_list(bytes: &[u8], max: u64) -> Result<Vec<Root>, ReqRespError> {
    if bytes.len() % 32 != 0 {
        return Err(ReqRespError::InvalidSszBytes);
    }
    let count = (bytes.len() / 32) as u64;
    if count == 0 || count > max {
        return Err(ReqRespError::InvalidSszBytes);
    }
    Ok(bytes
        .chunks_exact(32)
        .map(|c| c.try_into().expect("32 bytes"))
        .collect())
}

impl Request {
    /// The concrete protocol this request goes out on. Metadata version is
    /// resolved by the caller against the fork table.
    pub fn protocol(&self, metadata_v3: bool) -> SupportedProtocol {
        match self {
            Request::Status(_) => SupportedProtocol::StatusV1,
            Request::Goodbye(_) => SupportedProtocol::GoodbyeV1,
            Request::Ping(_) => SupportedProtocol::PingV1,
            Request::Metadata => {
                if metadata_v3 {
                    SupportedProtocol::MetadataV3
                } else {
                    SupportedProtocol::MetadataV2
                }
            }
            Request::BlocksByRange(_) => SupportedProtocol::BlocksByRangeV2,
            Request::BlocksByRoot(_) => SupportedProtocol::BlocksByRootV2,
            Request::BlobsByRange(_) => SupportedProtocol::BlobsByRangeV1,
            Request::BlobsByRoot(_) => SupportedProtocol::BlobsByRootV1,
            Request::DataColumnsByRange(_) => SupportedProtocol::DataColumnsByRangeV1,
            Request::DataColumnsByRoot(_) => SupportedProtocol::DataColumnsByRootV1,
        }
    }

    pub fn to_ssz_bytes(&self) -> Vec<u8> {
        match self {
            Request::Status(status) => status.to_ssz_bytes(),
            Request::Goodbye(reason) => reason.as_u64().to_le_bytes().to_vec(),
            Request::Ping(seq) => seq.to_le_bytes().to_vec(),
            Request::Metadata => Vec::new(),
            Request::BlocksByRange(req) => {
                let mut out = Vec::with_capacity(24);
                out.extend_from_slice(&req.start_slot.to_le_bytes());
                out.extend_from_slice(&req.count.to_le_bytes());
                out.extend_from_slice(&req.step.to_le_bytes());
                out
            }
            Request::BlocksByRoot(req) => {
                req.roots.iter().flat_map(|r| r.iter().copied()).collect()
            }
            Request::BlobsByRange(req) => {
                let mut out = Vec::with_capacity(16);
                out.extend_from_slice(&req.start_slot.to_le_bytes());
                out.extend_from_slice(&req.count.to_le_bytes());
                out
            }
            Request::BlobsByRoot(req) => {
                req.roots.iter().flat_map(|r| r.iter().copied()).collect()
            }
            Request::DataColumnsByRange(req) => {
                let mut out = Vec::with_capacity(16 + req.columns.len() * 8);
                out.extend_from_slice(&req.start_slot.to_le_bytes());
                out.extend_from_slice(&req.count.to_le_bytes());
                for col in &req.columns {
                    out.extend_from_slice(&col.to_le_bytes());
                }
                out
            }
            Request::DataColumnsByRoot(req) => {
                let mut out = Vec::with_capacity(req.ids.len() * 40);
                for id in &req.ids {
                    out.extend_from_slice(&id.block_root);
                    out.extend_from_slice(&id.index.to_le_bytes());
                }
                out
            }
        }
    }

    /// Decode a request body for `protocol`. Bounds beyond the chunk size
    /// (element counts, alignment) are enforced here.
    pub fn from_ssz_bytes(
        protocol: SupportedProtocol,
        bytes: &[u8],
    ) -> Result<Self, ReqRespError> {
        match protocol {
            SupportedProtocol::StatusV1 => {
                Ok(Request::Status(StatusMessage::from_ssz_bytes(bytes)?))
            }
            SupportedProtocol::GoodbyeV1 => {
                if bytes.len() != 8 {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                Ok(Request::Goodbye(GoodbyeReason::from_u64(read_u64(bytes, 0)?)))
            }
            SupportedProtocol::PingV1 => {
                if bytes.len() != 8 {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                Ok(Request::Ping(read_u64(bytes, 0)?))
            }
            SupportedProtocol::MetadataV2 | SupportedProtocol::MetadataV3 => {
                if !bytes.is_empty() {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                Ok(Request::Metadata)
            }
            SupportedProtocol::BlocksByRangeV2 => {
                if bytes.len() != 24 {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                let req = BlocksByRangeRequest {
                    start_slot: read_u64(bytes, 0)?,
                    count: read_u64(bytes, 8)?,
                    step: read_u64(bytes, 16)?,
                };
                if req.count == 0 || req.count > MAX_REQUEST_BLOCKS || req.step == 0 {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                Ok(Request::BlocksByRange(req))
            }
            SupportedProtocol::BlocksByRootV2 => Ok(Request::BlocksByRoot(BlocksByRootRequest {
                roots: decode_root_list(bytes, MAX_REQUEST_BLOCKS)?,
            })),
            SupportedProtocol::BlobsByRangeV1 => {
                if bytes.len() != 16 {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                let req = BlobsByRangeRequest {
                    start_slot: read_u64(bytes, 0)?,
                    count: read_u64(bytes, 8)?,
                };
                if req.count == 0 || req.count > MAX_REQUEST_BLOB_SIDECARS {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                Ok(Request::BlobsByRange(req))
            }
            SupportedProtocol::BlobsByRootV1 => Ok(Request::BlobsByRoot(BlobsByRootRequest {
                roots: decode_root_list(bytes, MAX_REQUEST_BLOB_SIDECARS)?,
            })),
            SupportedProtocol::DataColumnsByRangeV1 => {
                if bytes.len() < 16 || (bytes.len() - 16) % 8 != 0 {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                let start_slot = read_u64(bytes, 0)?;
                let count = read_u64(bytes, 8)?;
                let columns: Vec<u64> = bytes[16..]
                    .chunks_exact(8)
                    .map(|c| u64::from_le_bytes(c.try_into().expect("8 bytes")))
                    .collect();
                if count == 0 || count > MAX_REQUEST_DATA_COLUMN_SIDECARS {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                Ok(Request::DataColumnsByRange(DataColumnsByRangeRequest {
                    start_slot,
                    count,
                    columns,
                }))
            }
            SupportedProtocol::DataColumnsByRootV1 => {
                if bytes.is_empty() || bytes.len() % 40 != 0 {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                let ids: Vec<DataColumnIdentifier> = bytes
                    .chunks_exact(40)
                    .map(|c| DataColumnIdentifier {
                        block_root: c[..32].try_into().expect("32 bytes"),
                        index: u64::from_le_bytes(c[32..].try_into().expect("8 bytes")),
                    })
                    .collect();
                if ids.len() as u64 > MAX_REQUEST_DATA_COLUMN_SIDECARS {
                    return Err(ReqRespError::InvalidSszBytes);
                }
                Ok(Request::DataColumnsByRoot(DataColumnsByRootRequest { ids }))
            }
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// One response item as the application hands it over: opaque SSZ payload
/// plus the fork digest for context-carrying protocols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseItem {
    pub context: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl ResponseItem {
    pub fn plain(payload: Vec<u8>) -> Self {
        Self {
            context: None,
            payload,
        }
    }

    pub fn with_context(context: [u8; 4], payload: Vec<u8>) -> Self {
        Self {
            context: Some(context),
            payload,
        }
    }
}

/// Decoded response to an outbound request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Status(StatusMessage),
    Goodbye,
    Pong(u64),
    Metadata(MetaData),
    /// Chunk list for block/blob/column protocols, on-wire order.
    Chunks(Vec<ResponseItem>),
}

/// Failures a request handler can signal; the dispatcher maps them to wire
/// response codes.
#[derive(Debug)]
pub enum HandlerError {
    /// Request payload was semantically invalid → `InvalidRequest`.
    InvalidInputs(String),
    /// We do not hold the requested data → `ResourceUnavailable`.
    ResourceUnavailable(String),
    /// Anything else → `ServerError`.
    Internal(anyhow::Error),
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::InvalidInputs(msg) => write!(f, "invalid inputs: {msg}"),
            HandlerError::ResourceUnavailable(msg) => write!(f, "resource unavailable: {msg}"),
            HandlerError::Internal(err) => write!(f, "internal error: {err}"),
        }
    }
}

impl std::error::Error for HandlerError {}
