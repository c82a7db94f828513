//! # Req/Resp Engine
//!
//! Outbound request flow and the inbound stream dispatcher. Both sides are
//! generic over the stream halves (`AsyncRead`/`AsyncWrite`), so the whole
//! engine is exercised in tests over in-memory duplex pipes and in
//! production over QUIC bidirectional streams.
//!
//! ## Outbound
//!
//! 1. the caller opens a stream (under `STREAM_OPEN_TIMEOUT`)
//! 2. the protocol id is written as a length-prefixed ASCII line
//! 3. a non-empty request body goes out as one request chunk
//! 4. the write side is half-closed — required, some peers never respond
//!    otherwise
//! 5. responses are read chunk-by-chunk, each under its own
//!    `RESP_TIMEOUT`, so a slow but steady list is not penalized
//!
//! ## Inbound
//!
//! Decode errors map onto wire response codes (`InvalidRequest` for framing
//! garbage, `ServerError` for unrecognized context bytes), the per-peer
//! quota is charged exactly once even for invalid requests, and the stream
//! always ends with a write-EOF. Scoring feedback follows the error
//! taxonomy: protocol violations are heavy, transport noise is light.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::codec::{
    encode_chunk, encode_error_chunk, read_request_chunk, read_response_chunk, ErrorMessage,
    ReqRespError, ResponseCode,
};
use crate::identity::PeerId;
use crate::messages::{
    HandlerError, Request, Response, ResponseItem, StatusMessage, SupportedProtocol,
};
use crate::metadata::MetaData;
use crate::score::PeerAction;

/// Maximum length of the protocol id line on a stream.
const MAX_PROTOCOL_ID_LEN: usize = 128;

// ============================================================================
// Protocol Id Framing
// ============================================================================

/// Write the stream's protocol id as `len(1 byte) ‖ ascii`.
pub async fn write_protocol_id<W: AsyncWrite + Unpin>(
    writer: &mut W,
    protocol: SupportedProtocol,
) -> Result<(), ReqRespError> {
    let id = protocol.protocol_id();
    debug_assert!(id.len() <= MAX_PROTOCOL_ID_LEN);
    let mut buf = Vec::with_capacity(1 + id.len());
    buf.push(id.len() as u8);
    buf.extend_from_slice(id.as_bytes());
    writer
        .write_all(&buf)
        .await
        .map_err(|_| ReqRespError::BrokenConnection)
}

/// Read the raw protocol id line of an accepted stream.
pub async fn read_protocol_line<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<String, ReqRespError> {
    let mut len_buf = [0u8; 1];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| ReqRespError::UnexpectedEof)?;
    let len = len_buf[0] as usize;
    if len == 0 || len > MAX_PROTOCOL_ID_LEN {
        return Err(ReqRespError::UnknownError);
    }
    let mut id_buf = vec![0u8; len];
    reader
        .read_exact(&mut id_buf)
        .await
        .map_err(|_| ReqRespError::UnexpectedEof)?;
    String::from_utf8(id_buf).map_err(|_| ReqRespError::UnknownError)
}

/// Read and resolve the protocol id of an accepted stream.
pub async fn read_protocol_id<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<SupportedProtocol, ReqRespError> {
    let id = read_protocol_line(reader).await?;
    SupportedProtocol::from_protocol_id(&id).ok_or(ReqRespError::UnknownError)
}

// ============================================================================
// Scoring Feedback
// ============================================================================

/// Score action for a failed outbound request.
pub fn action_for_error(err: &ReqRespError) -> PeerAction {
    if err.is_protocol_violation() {
        PeerAction::InvalidRequest
    } else {
        PeerAction::PoorRequest
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Send one request over an already-open stream and read the typed
/// response. Returns the response plus total uncompressed payload bytes
/// received (throughput accounting).
pub async fn send_request_on<W, R>(
    send: &mut W,
    recv: &mut R,
    request: &Request,
    protocol: SupportedProtocol,
    valid_digests: &[[u8; 4]],
    resp_timeout: Duration,
) -> Result<(Response, usize), ReqRespError>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    write_protocol_id(send, protocol).await?;

    let body = request.to_ssz_bytes();
    if !body.is_empty() {
        let chunk = encode_chunk(None, None, &body);
        send.write_all(&chunk)
            .await
            .map_err(|_| ReqRespError::BrokenConnection)?;
    }
    // Half-close the write side to signal end-of-request.
    send.shutdown()
        .await
        .map_err(|_| ReqRespError::BrokenConnection)?;

    // Goodbye is fire-and-forget; no response chunk is owed.
    if matches!(request, Request::Goodbye(_)) {
        return Ok((Response::Goodbye, 0));
    }

    let contexts = protocol.has_context_bytes().then_some(valid_digests);
    let max_size = protocol.max_response_chunk_size();

    if protocol.is_single_chunk() {
        let chunk = tokio::time::timeout(
            resp_timeout,
            read_response_chunk(recv, max_size, contexts),
        )
        .await
        .map_err(|_| ReqRespError::ReadResponseTimeout)??
        .ok_or(ReqRespError::PotentiallyExpectedEof)?;

        let bytes = chunk.payload.len();
        let response = decode_single(protocol, &chunk.payload)?;
        Ok((response, bytes))
    } else {
        let mut items = Vec::new();
        let mut total = 0usize;
        loop {
            let chunk = tokio::time::timeout(
                resp_timeout,
                read_response_chunk(recv, max_size, contexts),
            )
            .await
            .map_err(|_| ReqRespError::ReadResponseTimeout)??;

            let Some(chunk) = chunk else {
                // Clean EOF terminates the list successfully.
                break;
            };
            if items.len() as u64 >= protocol.max_response_chunks() {
                return Err(ReqRespError::ResponseChunkOverflow);
            }
            total += chunk.payload.len();
            items.push(ResponseItem {
                context: chunk.context,
                payload: chunk.payload,
            });
        }
        Ok((Response::Chunks(items), total))
    }
}

fn decode_single(
    protocol: SupportedProtocol,
    payload: &[u8],
) -> Result<Response, ReqRespError> {
    match protocol {
        SupportedProtocol::StatusV1 => {
            Ok(Response::Status(StatusMessage::from_ssz_bytes(payload)?))
        }
        SupportedProtocol::PingV1 => {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| ReqRespError::InvalidSszBytes)?;
            Ok(Response::Pong(u64::from_le_bytes(bytes)))
        }
        SupportedProtocol::MetadataV2 | SupportedProtocol::MetadataV3 => {
            Ok(Response::Metadata(MetaData::from_ssz_bytes(payload)?))
        }
        SupportedProtocol::GoodbyeV1 => Ok(Response::Goodbye),
        _ => Err(ReqRespError::UnknownError),
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// The dispatcher's view of the network: peer admission, quota, handler
/// dispatch, and scoring.
#[async_trait]
pub trait InboundHooks: Send + Sync + 'static {
    /// Resolve the peer (creating it if unknown). False means the peer is
    /// leaving or gone; the stream is dropped.
    async fn peer_usable(&self, peer: &PeerId) -> bool;

    /// Charge the per-peer and global request quotas, awaiting
    /// replenishment when exhausted. Called exactly once per stream.
    async fn charge_quota(&self, peer: &PeerId, protocol: SupportedProtocol);

    /// Dispatch to the mounted protocol handler.
    async fn handle_request(
        &self,
        peer: PeerId,
        protocol: SupportedProtocol,
        request: Request,
    ) -> Result<Vec<ResponseItem>, HandlerError>;

    async fn apply_score(&self, peer: &PeerId, action: PeerAction);

    /// Post-request hook: evaluate scheduled disconnects for this peer.
    async fn release_peer(&self, peer: &PeerId);
}

/// Map a request decode error to the wire response, if any.
/// `None` means silent drop.
fn error_response(err: &ReqRespError) -> Option<(ResponseCode, String)> {
    match err {
        ReqRespError::BrokenConnection => None,
        ReqRespError::InvalidContextBytes(_) => Some((
            ResponseCode::ServerError,
            "Unrecognized context bytes".to_string(),
        )),
        ReqRespError::UnexpectedEof
        | ReqRespError::PotentiallyExpectedEof
        | ReqRespError::InvalidSnappyBytes
        | ReqRespError::InvalidSszBytes
        | ReqRespError::InvalidSizePrefix
        | ReqRespError::ZeroSizePrefix
        | ReqRespError::SizePrefixOverflow { .. }
        | ReqRespError::ResponseChunkOverflow
        | ReqRespError::UnknownError => Some((ResponseCode::InvalidRequest, err.to_string())),
        // Caller-side timeouts on the read path: the peer failed to deliver
        // a request in time, which is its failure, not ours.
        ReqRespError::StreamOpenTimeout | ReqRespError::ReadResponseTimeout => {
            Some((ResponseCode::InvalidRequest, err.to_string()))
        }
        ReqRespError::InvalidResponseCode(_) | ReqRespError::ReceivedErrorResponse { .. } => {
            Some((ResponseCode::InvalidRequest, err.to_string()))
        }
    }
}

/// Serve one accepted inbound stream. The protocol id has already been
/// read by the caller (it needed it to route here).
pub async fn handle_inbound_stream<W, R>(
    hooks: Arc<dyn InboundHooks>,
    peer: PeerId,
    protocol: SupportedProtocol,
    send: &mut W,
    recv: &mut R,
    request_timeout: Duration,
) where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    if !hooks.peer_usable(&peer).await {
        trace!(peer = %peer, "dropping stream from unusable peer");
        return;
    }

    // Read the request under the per-request timeout. Zero-size request
    // types carry no chunk at all.
    let decoded: Result<Request, ReqRespError> = if protocol.request_is_empty() {
        Ok(Request::Metadata)
    } else {
        match tokio::time::timeout(
            request_timeout,
            read_request_chunk(recv, protocol.max_request_size(), None),
        )
        .await
        {
            Ok(Ok(chunk)) => Request::from_ssz_bytes(protocol, &chunk.payload),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReqRespError::ReadResponseTimeout),
        }
    };

    // Charge once per stream, even for invalid requests, so a loop
    // attacker pays regardless of payload validity. Broken connections
    // skip the charge; nothing can loop on a dead transport.
    if !matches!(decoded, Err(ReqRespError::BrokenConnection)) {
        hooks.charge_quota(&peer, protocol).await;
    }

    let request = match decoded {
        Ok(request) => request,
        Err(err) => {
            if let Some((code, message)) = error_response(&err) {
                debug!(peer = %peer, protocol = protocol.name(), error = %err, "invalid inbound request");
                let chunk = encode_error_chunk(code, &ErrorMessage::from_str(&message));
                let _ = send.write_all(&chunk).await;
                let action = action_for_error(&err);
                hooks.apply_score(&peer, action).await;
            }
            let _ = send.shutdown().await;
            hooks.release_peer(&peer).await;
            return;
        }
    };

    // Goodbye carries no response; record it and close.
    if let Request::Goodbye(reason) = &request {
        trace!(peer = %peer, reason = ?reason, "received goodbye");
        let _ = hooks.handle_request(peer, protocol, request).await;
        let _ = send.shutdown().await;
        hooks.release_peer(&peer).await;
        return;
    }

    match hooks.handle_request(peer, protocol, request).await {
        Ok(items) => {
            for item in items {
                let context = protocol.has_context_bytes().then(|| {
                    item.context.unwrap_or_default()
                });
                let chunk = encode_chunk(Some(ResponseCode::Success), context, &item.payload);
                if send.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        }
        Err(err) => {
            let (code, message) = match &err {
                HandlerError::InvalidInputs(msg) => (ResponseCode::InvalidRequest, msg.clone()),
                HandlerError::ResourceUnavailable(msg) => {
                    (ResponseCode::ResourceUnavailable, msg.clone())
                }
                HandlerError::Internal(e) => {
                    warn!(peer = %peer, protocol = protocol.name(), error = %e, "request handler failed");
                    (ResponseCode::ServerError, "internal error".to_string())
                }
            };
            let chunk = encode_error_chunk(code, &ErrorMessage::from_str(&message));
            let _ = send.write_all(&chunk).await;
        }
    }

    let _ = send.shutdown().await;
    hooks.release_peer(&peer).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::messages::BlocksByRootRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    fn id() -> PeerId {
        Keypair::generate().peer_id()
    }

    const RESP_TIMEOUT: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn protocol_id_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_protocol_id(&mut client, SupportedProtocol::BlocksByRootV2)
            .await
            .unwrap();
        let protocol = read_protocol_id(&mut server).await.unwrap();
        assert_eq!(protocol, SupportedProtocol::BlocksByRootV2);
    }

    #[tokio::test]
    async fn unknown_protocol_id_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let bogus = b"/eth2/beacon_chain/req/bogus/1/ssz_snappy";
        let mut framed = vec![bogus.len() as u8];
        framed.extend_from_slice(bogus);
        client.write_all(&framed).await.unwrap();
        assert_eq!(
            read_protocol_id(&mut server).await,
            Err(ReqRespError::UnknownError)
        );
    }

    /// Drives `send_request_on` against a scripted server side.
    async fn roundtrip(
        request: Request,
        protocol: SupportedProtocol,
        server_response: Vec<u8>,
    ) -> Result<(Response, usize), ReqRespError> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let server_task = tokio::spawn(async move {
            // Consume the request side fully, then answer.
            let _ = read_protocol_id(&mut server_read).await;
            let mut sink = Vec::new();
            let _ = server_read.read_to_end(&mut sink).await;
            server_write.write_all(&server_response).await.unwrap();
            server_write.shutdown().await.unwrap();
        });

        let result = send_request_on(
            &mut client_write,
            &mut client_read,
            &request,
            protocol,
            &[[9, 9, 9, 9]],
            RESP_TIMEOUT,
        )
        .await;
        server_task.await.unwrap();
        result
    }

    #[tokio::test]
    async fn ping_round_trip() {
        let response = encode_chunk(
            Some(ResponseCode::Success),
            None,
            &77u64.to_le_bytes(),
        );
        let (resp, bytes) = roundtrip(Request::Ping(42), SupportedProtocol::PingV1, response)
            .await
            .unwrap();
        assert_eq!(resp, Response::Pong(77));
        assert_eq!(bytes, 8);
    }

    #[tokio::test]
    async fn chunk_list_round_trip_with_context() {
        let mut wire = Vec::new();
        wire.extend(encode_chunk(
            Some(ResponseCode::Success),
            Some([9, 9, 9, 9]),
            b"block one",
        ));
        wire.extend(encode_chunk(
            Some(ResponseCode::Success),
            Some([9, 9, 9, 9]),
            b"block two",
        ));

        let request = Request::BlocksByRoot(BlocksByRootRequest {
            roots: vec![[1u8; 32]],
        });
        let (resp, bytes) = roundtrip(request, SupportedProtocol::BlocksByRootV2, wire)
            .await
            .unwrap();
        match resp {
            Response::Chunks(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(items[0].payload, b"block one");
                assert_eq!(items[0].context, Some([9, 9, 9, 9]));
                assert_eq!(items[1].payload, b"block two");
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(bytes, 18);
    }

    #[tokio::test]
    async fn empty_chunk_list_is_success() {
        let request = Request::BlocksByRoot(BlocksByRootRequest {
            roots: vec![[1u8; 32]],
        });
        let (resp, _) = roundtrip(request, SupportedProtocol::BlocksByRootV2, Vec::new())
            .await
            .unwrap();
        assert_eq!(resp, Response::Chunks(Vec::new()));
    }

    #[tokio::test]
    async fn missing_single_chunk_is_eof_error() {
        let err = roundtrip(Request::Ping(1), SupportedProtocol::PingV1, Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, ReqRespError::PotentiallyExpectedEof);
        assert_eq!(action_for_error(&err), PeerAction::PoorRequest);
    }

    #[tokio::test]
    async fn error_response_chunk_surfaces() {
        let wire = encode_error_chunk(
            ResponseCode::ResourceUnavailable,
            &ErrorMessage::from_str("pruned"),
        );
        let err = roundtrip(Request::Ping(1), SupportedProtocol::PingV1, wire)
            .await
            .unwrap_err();
        match err {
            ReqRespError::ReceivedErrorResponse { code, message } => {
                assert_eq!(code, ResponseCode::ResourceUnavailable);
                assert_eq!(message.to_string(), "pruned");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_response_times_out_without_heavy_descore() {
        let (client, _server_kept_open) = tokio::io::duplex(1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let result = send_request_on(
            &mut client_write,
            &mut client_read,
            &Request::Ping(1),
            SupportedProtocol::PingV1,
            &[],
            Duration::from_millis(50),
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err, ReqRespError::ReadResponseTimeout);
        assert_eq!(action_for_error(&err), PeerAction::PoorRequest);
        assert!(!err.is_protocol_violation());
    }

    #[tokio::test]
    async fn goodbye_expects_no_response() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        drop(server);

        // Even with the server gone the goodbye send itself is the result.
        let result = send_request_on(
            &mut client_write,
            &mut client_read,
            &Request::Goodbye(crate::messages::GoodbyeReason::ClientShutdown),
            SupportedProtocol::GoodbyeV1,
            &[],
            RESP_TIMEOUT,
        )
        .await;
        // A torn-down duplex may surface as broken; both are acceptable,
        // never a protocol violation.
        match result {
            Ok((Response::Goodbye, 0)) => {}
            Err(e) => assert!(!e.is_protocol_violation()),
            other => panic!("unexpected {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatcher
    // ------------------------------------------------------------------

    struct TestHooks {
        usable: bool,
        quota_charges: AtomicU32,
        releases: AtomicU32,
        scores: Mutex<Vec<PeerAction>>,
        response: Result<Vec<ResponseItem>, fn() -> HandlerError>,
    }

    impl TestHooks {
        fn ok(items: Vec<ResponseItem>) -> Arc<Self> {
            Arc::new(Self {
                usable: true,
                quota_charges: AtomicU32::new(0),
                releases: AtomicU32::new(0),
                scores: Mutex::new(Vec::new()),
                response: Ok(items),
            })
        }

        fn failing(err: fn() -> HandlerError) -> Arc<Self> {
            Arc::new(Self {
                usable: true,
                quota_charges: AtomicU32::new(0),
                releases: AtomicU32::new(0),
                scores: Mutex::new(Vec::new()),
                response: Err(err),
            })
        }
    }

    #[async_trait]
    impl InboundHooks for TestHooks {
        async fn peer_usable(&self, _peer: &PeerId) -> bool {
            self.usable
        }

        async fn charge_quota(&self, _peer: &PeerId, _protocol: SupportedProtocol) {
            self.quota_charges.fetch_add(1, Ordering::SeqCst);
        }

        async fn handle_request(
            &self,
            _peer: PeerId,
            _protocol: SupportedProtocol,
            _request: Request,
        ) -> Result<Vec<ResponseItem>, HandlerError> {
            match &self.response {
                Ok(items) => Ok(items.clone()),
                Err(make) => Err(make()),
            }
        }

        async fn apply_score(&self, _peer: &PeerId, action: PeerAction) {
            self.scores.lock().await.push(action);
        }

        async fn release_peer(&self, _peer: &PeerId) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Feed `request_bytes` to the dispatcher and return everything it
    /// wrote back.
    async fn serve(
        hooks: Arc<TestHooks>,
        protocol: SupportedProtocol,
        request_bytes: Vec<u8>,
    ) -> Vec<u8> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let feeder = tokio::spawn(async move {
            client_write.write_all(&request_bytes).await.unwrap();
            client_write.shutdown().await.unwrap();
            let mut out = Vec::new();
            client_read.read_to_end(&mut out).await.unwrap();
            out
        });

        handle_inbound_stream(
            hooks,
            id(),
            protocol,
            &mut server_write,
            &mut server_read,
            Duration::from_millis(500),
        )
        .await;
        drop(server_write);
        feeder.await.unwrap()
    }

    #[tokio::test]
    async fn valid_request_gets_success_chunks_and_one_quota_charge() {
        let hooks = TestHooks::ok(vec![ResponseItem::plain(88u64.to_le_bytes().to_vec())]);
        let request = encode_chunk(None, None, &Request::Ping(5).to_ssz_bytes());
        let wire = serve(hooks.clone(), SupportedProtocol::PingV1, request).await;

        let mut reader = wire.as_slice();
        let chunk = read_response_chunk(&mut reader, 8, None)
            .await
            .unwrap()
            .expect("success chunk");
        assert_eq!(chunk.payload, 88u64.to_le_bytes());

        assert_eq!(hooks.quota_charges.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.releases.load(Ordering::SeqCst), 1);
        assert!(hooks.scores.lock().await.is_empty());
    }

    #[tokio::test]
    async fn garbage_request_maps_to_invalid_request_and_descourages() {
        let hooks = TestHooks::ok(vec![]);
        // Valid chunk framing but a bad ssz body (ping must be 8 bytes).
        let request = encode_chunk(None, None, &[1, 2, 3]);
        let wire = serve(hooks.clone(), SupportedProtocol::PingV1, request).await;

        let mut reader = wire.as_slice();
        let err = read_response_chunk(&mut reader, 1024, None)
            .await
            .unwrap_err();
        match err {
            ReqRespError::ReceivedErrorResponse { code, .. } => {
                assert_eq!(code, ResponseCode::InvalidRequest);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Quota charged even though the request was invalid.
        assert_eq!(hooks.quota_charges.load(Ordering::SeqCst), 1);
        assert_eq!(
            hooks.scores.lock().await.as_slice(),
            &[PeerAction::InvalidRequest]
        );
    }

    #[tokio::test]
    async fn handler_errors_map_to_wire_codes() {
        let cases: Vec<(fn() -> HandlerError, ResponseCode)> = vec![
            (
                || HandlerError::InvalidInputs("bad roots".into()),
                ResponseCode::InvalidRequest,
            ),
            (
                || HandlerError::ResourceUnavailable("no block".into()),
                ResponseCode::ResourceUnavailable,
            ),
            (
                || HandlerError::Internal(anyhow::anyhow!("db down")),
                ResponseCode::ServerError,
            ),
        ];

        for (make, expected_code) in cases {
            let hooks = TestHooks::failing(make);
            let request = encode_chunk(None, None, &Request::Ping(5).to_ssz_bytes());
            let wire = serve(hooks, SupportedProtocol::PingV1, request).await;
            let mut reader = wire.as_slice();
            match read_response_chunk(&mut reader, 1024, None).await.unwrap_err() {
                ReqRespError::ReceivedErrorResponse { code, .. } => {
                    assert_eq!(code, expected_code)
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn metadata_request_needs_no_body() {
        let hooks = TestHooks::ok(vec![ResponseItem::plain(
            MetaData::default().to_ssz_bytes(crate::metadata::MetadataVersion::V2),
        )]);
        let wire = serve(hooks.clone(), SupportedProtocol::MetadataV2, Vec::new()).await;
        let mut reader = wire.as_slice();
        let chunk = read_response_chunk(&mut reader, 1024, None)
            .await
            .unwrap()
            .expect("metadata chunk");
        assert!(MetaData::from_ssz_bytes(&chunk.payload).is_ok());
        assert_eq!(hooks.quota_charges.load(Ordering::SeqCst), 1);
    }
}
