//! # Req/Resp Chunk Codec
//!
//! One chunk on the wire is:
//!
//! ```text
//! [response code: 1 byte]?  (responses only)
//! [context bytes: 4 bytes]? (fork-polymorphic message types only)
//! [uncompressed length: LEB128]
//! [framed snappy payload]
//! ```
//!
//! The codec has no knowledge of payload schemas beyond a per-type maximum
//! uncompressed size. Encoding produces a single contiguous buffer so a
//! chunk never fragments across writes. Decoding streams the snappy frames
//! and enforces every bound *before* allocating or decompressing:
//!
//! - the LEB128-declared length is checked against the type bound before any
//!   compressed byte is read
//! - total compressed input is capped at `max_compressed_len(declared)`
//! - each frame's CRC-32C (masked, over decompressed bytes) is verified
//!
//! Errors follow the wire taxonomy: anything from `InvalidResponseCode`
//! onward is a protocol violation and feeds heavy descoring upstream.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound for the error payload carried by a non-success response.
pub const MAX_ERROR_MESSAGE_SIZE: usize = 256;

/// Snappy frame format: stream identifier frame (chunk type 0xff, length 6,
/// magic "sNaPpY").
const STREAM_IDENTIFIER: [u8; 10] = [0xff, 0x06, 0x00, 0x00, b's', b'N', b'a', b'P', b'p', b'Y'];

/// Maximum uncompressed data per snappy frame, per the framing format.
const MAX_FRAME_UNCOMPRESSED: usize = 65_536;

/// Frame chunk types.
const FRAME_COMPRESSED: u8 = 0x00;
const FRAME_UNCOMPRESSED: u8 = 0x01;

/// Worst-case bytes on the wire for a payload of `n` uncompressed bytes:
/// stream header plus per-frame overhead plus incompressible data.
pub fn max_compressed_len(n: usize) -> usize {
    32 + n + n / 6
}

// ============================================================================
// Response Codes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0,
    InvalidRequest = 1,
    ServerError = 2,
    ResourceUnavailable = 3,
}

impl ResponseCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ResponseCode::Success),
            1 => Some(ResponseCode::InvalidRequest),
            2 => Some(ResponseCode::ServerError),
            3 => Some(ResponseCode::ResourceUnavailable),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Error Message
// ============================================================================

/// Bounded error payload of a non-success response chunk. Renders as ASCII
/// when every byte is printable, hex otherwise; operators read these.
#[derive(Clone, PartialEq, Eq)]
pub struct ErrorMessage(Vec<u8>);

impl ErrorMessage {
    pub fn new(bytes: Vec<u8>) -> Self {
        let mut bytes = bytes;
        bytes.truncate(MAX_ERROR_MESSAGE_SIZE);
        Self(bytes)
    }

    pub fn from_str(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printable = !self.0.is_empty()
            && self
                .0
                .iter()
                .all(|b| b.is_ascii_graphic() || *b == b' ');
        if printable {
            write!(f, "{}", String::from_utf8_lossy(&self.0))
        } else {
            write!(f, "0x{}", hex::encode(&self.0))
        }
    }
}

impl fmt::Debug for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ErrorMessage({self})")
    }
}

// ============================================================================
// Error Taxonomy
// ============================================================================

/// Everything that can go wrong reading or writing a chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReqRespError {
    /// Transport failed mid-operation (reset, closed connection).
    BrokenConnection,
    /// Stream ended inside a chunk.
    UnexpectedEof,
    /// Stream ended cleanly at a chunk boundary. Terminates list responses
    /// successfully; an error anywhere else.
    PotentiallyExpectedEof,
    StreamOpenTimeout,
    ReadResponseTimeout,
    /// Response code byte outside the valid range.
    InvalidResponseCode(u8),
    InvalidSnappyBytes,
    InvalidSszBytes,
    /// Malformed LEB128 size prefix.
    InvalidSizePrefix,
    /// Declared uncompressed length of zero.
    ZeroSizePrefix,
    /// Declared uncompressed length exceeds the message-type bound.
    SizePrefixOverflow { declared: u64, limit: usize },
    /// Context bytes do not match any known fork digest.
    InvalidContextBytes([u8; 4]),
    /// More chunks than the response type permits.
    ResponseChunkOverflow,
    /// The peer answered with a non-success response code.
    ReceivedErrorResponse {
        code: ResponseCode,
        message: ErrorMessage,
    },
    UnknownError,
}

impl ReqRespError {
    /// Protocol violations earn `PeerScoreInvalidRequest`; everything else
    /// is transport-benign.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ReqRespError::InvalidResponseCode(_)
                | ReqRespError::InvalidSnappyBytes
                | ReqRespError::InvalidSszBytes
                | ReqRespError::InvalidSizePrefix
                | ReqRespError::ZeroSizePrefix
                | ReqRespError::SizePrefixOverflow { .. }
                | ReqRespError::InvalidContextBytes(_)
                | ReqRespError::ResponseChunkOverflow
                | ReqRespError::UnknownError
        )
    }
}

impl fmt::Display for ReqRespError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReqRespError::BrokenConnection => write!(f, "connection broken"),
            ReqRespError::UnexpectedEof => write!(f, "unexpected end of stream"),
            ReqRespError::PotentiallyExpectedEof => write!(f, "stream ended at chunk boundary"),
            ReqRespError::StreamOpenTimeout => write!(f, "stream open timed out"),
            ReqRespError::ReadResponseTimeout => write!(f, "response read timed out"),
            ReqRespError::InvalidResponseCode(code) => {
                write!(f, "invalid response code {code}")
            }
            ReqRespError::InvalidSnappyBytes => write!(f, "invalid snappy framing"),
            ReqRespError::InvalidSszBytes => write!(f, "invalid ssz payload"),
            ReqRespError::InvalidSizePrefix => write!(f, "malformed size prefix"),
            ReqRespError::ZeroSizePrefix => write!(f, "zero size prefix"),
            ReqRespError::SizePrefixOverflow { declared, limit } => {
                write!(f, "declared size {declared} exceeds limit {limit}")
            }
            ReqRespError::InvalidContextBytes(ctx) => {
                write!(f, "unrecognized context bytes 0x{}", hex::encode(ctx))
            }
            ReqRespError::ResponseChunkOverflow => write!(f, "too many response chunks"),
            ReqRespError::ReceivedErrorResponse { code, message } => {
                write!(f, "peer responded {code:?}: {message}")
            }
            ReqRespError::UnknownError => write!(f, "unknown error"),
        }
    }
}

impl std::error::Error for ReqRespError {}

fn map_io_error(err: &std::io::Error, at_boundary: bool) -> ReqRespError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof if at_boundary => ReqRespError::PotentiallyExpectedEof,
        std::io::ErrorKind::UnexpectedEof => ReqRespError::UnexpectedEof,
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => ReqRespError::BrokenConnection,
        _ => ReqRespError::BrokenConnection,
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn write_leb128(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn masked_crc(data: &[u8]) -> u32 {
    let crc = crc32c::crc32c(data);
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

/// Framed-snappy compress `payload` into `out`. An empty payload encodes
/// as the stream identifier alone.
fn frame_compress(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(&STREAM_IDENTIFIER);
    let mut encoder = snap::raw::Encoder::new();

    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + MAX_FRAME_UNCOMPRESSED).min(payload.len());
        let data = &payload[offset..end];
        let crc = masked_crc(data);

        let compressed = encoder
            .compress_vec(data)
            .expect("snappy compression is infallible for in-memory buffers");
        if compressed.len() < data.len() {
            let frame_len = compressed.len() + 4;
            out.push(FRAME_COMPRESSED);
            out.extend_from_slice(&(frame_len as u32).to_le_bytes()[..3]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&compressed);
        } else {
            let frame_len = data.len() + 4;
            out.push(FRAME_UNCOMPRESSED);
            out.extend_from_slice(&(frame_len as u32).to_le_bytes()[..3]);
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(data);
        }

        offset = end;
    }
}

/// Encode one chunk into a single contiguous buffer: optional response code,
/// optional context bytes, LEB128 of the uncompressed length, framed snappy.
pub fn encode_chunk(
    code: Option<ResponseCode>,
    context: Option<[u8; 4]>,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + payload.len() + payload.len() / 6);
    if let Some(code) = code {
        out.push(code.as_u8());
    }
    if let Some(ctx) = context {
        out.extend_from_slice(&ctx);
    }
    write_leb128(&mut out, payload.len() as u64);
    frame_compress(&mut out, payload);
    out
}

/// Encode a non-success response chunk carrying a bounded error message.
pub fn encode_error_chunk(code: ResponseCode, message: &ErrorMessage) -> Vec<u8> {
    debug_assert_ne!(code, ResponseCode::Success);
    encode_chunk(Some(code), None, message.as_bytes())
}

// ============================================================================
// Decoding
// ============================================================================

/// Decoded chunk: context bytes (when the type carries them) plus the
/// uncompressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub context: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

async fn read_byte<R: AsyncRead + Unpin>(
    reader: &mut R,
    at_boundary: bool,
) -> Result<u8, ReqRespError> {
    let mut buf = [0u8; 1];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(&e, at_boundary))?;
    Ok(buf[0])
}

async fn read_exact_into<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ReqRespError> {
    reader
        .read_exact(buf)
        .await
        .map_err(|e| map_io_error(&e, false))?;
    Ok(())
}

async fn read_leb128<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, ReqRespError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = read_byte(reader, false).await?;
        if shift == 63 && byte > 1 {
            return Err(ReqRespError::InvalidSizePrefix);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(ReqRespError::InvalidSizePrefix);
        }
    }
}

/// Read and verify the LEB128 size prefix against the type bound. Runs
/// before any compressed byte is touched.
async fn read_size_prefix<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<usize, ReqRespError> {
    let declared = read_leb128(reader).await?;
    if declared == 0 {
        return Err(ReqRespError::ZeroSizePrefix);
    }
    if declared > max_size as u64 {
        return Err(ReqRespError::SizePrefixOverflow {
            declared,
            limit: max_size,
        });
    }
    Ok(declared as usize)
}

/// Streaming framed-snappy decode of exactly `declared` uncompressed bytes.
///
/// The output buffer is allocated once from the (already validated) declared
/// length. Total compressed input is bounded by `max_compressed_len`.
async fn frame_decompress<R: AsyncRead + Unpin>(
    reader: &mut R,
    declared: usize,
) -> Result<Vec<u8>, ReqRespError> {
    let input_budget = max_compressed_len(declared);
    let mut consumed = 0usize;

    let mut header = [0u8; 10];
    read_exact_into(reader, &mut header).await?;
    consumed += 10;
    if header != STREAM_IDENTIFIER {
        return Err(ReqRespError::InvalidSnappyBytes);
    }

    let mut out = vec![0u8; declared];
    let mut offset = 0usize;
    let mut decoder = snap::raw::Decoder::new();

    while offset < declared {
        let mut frame_header = [0u8; 4];
        read_exact_into(reader, &mut frame_header).await?;
        consumed += 4;

        let frame_id = frame_header[0];
        let frame_len = u32::from_le_bytes([frame_header[1], frame_header[2], frame_header[3], 0])
            as usize;

        consumed += frame_len;
        if consumed > input_budget {
            return Err(ReqRespError::InvalidSnappyBytes);
        }

        match frame_id {
            FRAME_COMPRESSED => {
                if frame_len < 6 {
                    return Err(ReqRespError::InvalidSnappyBytes);
                }
                let mut frame = vec![0u8; frame_len];
                read_exact_into(reader, &mut frame).await?;
                let expected_crc = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
                let compressed = &frame[4..];

                let size = snap::raw::decompress_len(compressed)
                    .map_err(|_| ReqRespError::InvalidSnappyBytes)?;
                if offset + size > declared {
                    return Err(ReqRespError::InvalidSnappyBytes);
                }
                decoder
                    .decompress(compressed, &mut out[offset..offset + size])
                    .map_err(|_| ReqRespError::InvalidSnappyBytes)?;
                if masked_crc(&out[offset..offset + size]) != expected_crc {
                    return Err(ReqRespError::InvalidSnappyBytes);
                }
                offset += size;
            }
            FRAME_UNCOMPRESSED => {
                if frame_len < 5 {
                    return Err(ReqRespError::InvalidSnappyBytes);
                }
                let mut crc_buf = [0u8; 4];
                read_exact_into(reader, &mut crc_buf).await?;
                let expected_crc = u32::from_le_bytes(crc_buf);
                let size = frame_len - 4;
                if offset + size > declared {
                    return Err(ReqRespError::InvalidSnappyBytes);
                }
                read_exact_into(reader, &mut out[offset..offset + size]).await?;
                if masked_crc(&out[offset..offset + size]) != expected_crc {
                    return Err(ReqRespError::InvalidSnappyBytes);
                }
                offset += size;
            }
            // Reserved unskippable chunk types.
            0x02..=0x7f => return Err(ReqRespError::InvalidSnappyBytes),
            // Skippable: read and discard (padding, future extensions).
            _ => {
                let mut discard = vec![0u8; frame_len];
                read_exact_into(reader, &mut discard).await?;
            }
        }
    }

    Ok(out)
}

/// Decode one request chunk (no response code). `valid_contexts` is `None`
/// for single-schema types; `Some` lists the fork digests currently valid.
pub async fn read_request_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
    valid_contexts: Option<&[[u8; 4]]>,
) -> Result<Chunk, ReqRespError> {
    let context = match valid_contexts {
        None => None,
        Some(valid) => Some(read_context(reader, valid).await?),
    };
    let declared = read_size_prefix(reader, max_size).await?;
    let payload = frame_decompress(reader, declared).await?;
    Ok(Chunk { context, payload })
}

/// Decode one response chunk.
///
/// Returns `Ok(None)` on clean EOF at the chunk boundary (the list
/// terminator); callers reading single-chunk responses convert it into
/// [`ReqRespError::PotentiallyExpectedEof`].
pub async fn read_response_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
    valid_contexts: Option<&[[u8; 4]]>,
) -> Result<Option<Chunk>, ReqRespError> {
    let code_byte = match read_byte(reader, true).await {
        Ok(byte) => byte,
        Err(ReqRespError::PotentiallyExpectedEof) => return Ok(None),
        Err(e) => return Err(e),
    };
    let code =
        ResponseCode::from_u8(code_byte).ok_or(ReqRespError::InvalidResponseCode(code_byte))?;

    if code != ResponseCode::Success {
        // Error messages are an SSZ byte list: zero length is legal.
        let declared = read_leb128(reader).await?;
        if declared > MAX_ERROR_MESSAGE_SIZE as u64 {
            return Err(ReqRespError::SizePrefixOverflow {
                declared,
                limit: MAX_ERROR_MESSAGE_SIZE,
            });
        }
        let payload = frame_decompress(reader, declared as usize).await?;
        return Err(ReqRespError::ReceivedErrorResponse {
            code,
            message: ErrorMessage::new(payload),
        });
    }

    let context = match valid_contexts {
        None => None,
        Some(valid) => Some(read_context(reader, valid).await?),
    };
    let declared = read_size_prefix(reader, max_size).await?;
    let payload = frame_decompress(reader, declared).await?;
    Ok(Some(Chunk { context, payload }))
}

async fn read_context<R: AsyncRead + Unpin>(
    reader: &mut R,
    valid: &[[u8; 4]],
) -> Result<[u8; 4], ReqRespError> {
    let mut ctx = [0u8; 4];
    read_exact_into(reader, &mut ctx).await?;
    if !valid.contains(&ctx) {
        return Err(ReqRespError::InvalidContextBytes(ctx));
    }
    Ok(ctx)
}
