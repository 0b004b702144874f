//! Wire format for the driftrpc protocol.
//!
//! Every connection starts with one negotiation frame in each direction,
//! after which the stream carries request frames (client to server) and
//! response frames (server to client). All multi-byte integers are
//! little-endian.
//!
//! # Frame layouts
//!
//! ```text
//! negotiation:            [magic: 8][len: 4][feature records: len]
//! feature record:         [feature id: 4][len: 4][payload: len]
//! request:                [type: 8][msg id: 8][len: 4][payload: len]
//! request (timeout):      [expiration ms: 8] + request
//! response:               [msg id: 8][len: 4][payload: len]
//! compressed envelope:    [len: 4][compressed frame: len]
//! exception payload:      [kind: 4][len: 4][body: len]
//! ```
//!
//! A response with a negative message id carries an exception payload; the
//! magnitude is the id of the request it answers. Once compression is
//! negotiated every frame travels inside the envelope; negotiation frames
//! themselves are never compressed.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compress::SharedCompressor;
use crate::error::{Result, RpcError};

/// Protocol magic, first 8 bytes of every negotiation frame.
pub const RPC_MAGIC: [u8; 8] = *b"DRIFTRPC";

/// Negotiation frame header size (magic + feature-block length).
pub const NEGOTIATION_HEADER_SIZE: usize = 12;

/// Request frame header size without the expiration field.
pub const REQUEST_HEADER_SIZE: usize = 20;

/// Request frame header size once the TIMEOUT feature is negotiated.
pub const REQUEST_HEADER_WITH_TIMEOUT_SIZE: usize = 28;

/// Response frame header size.
pub const RESPONSE_HEADER_SIZE: usize = 12;

/// Upper bound on a declared payload length, checked before allocation.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Feature id for transparent per-frame compression.
pub const FEATURE_COMPRESS: u32 = 0;

/// Feature id for transmitting the remaining call time in request headers.
pub const FEATURE_TIMEOUT: u32 = 1;

const EXCEPTION_USER: u32 = 0;
const EXCEPTION_UNKNOWN_VERB: u32 = 1;

/// Features offered or accepted during negotiation, keyed by feature id.
/// Payloads are opaque to the engine; unknown ids are ignored.
pub type FeatureMap = BTreeMap<u32, Bytes>;

/// Decoded request frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Milliseconds the caller is still willing to wait; 0 means none.
    /// Only present on the wire when the TIMEOUT feature was negotiated.
    pub expiration_ms: u64,
    pub msg_type: u64,
    pub msg_id: i64,
    pub payload_len: u32,
}

impl RequestHeader {
    /// Decodes a header from exactly `header_size(with_timeout)` bytes.
    pub fn decode(mut buf: &[u8], with_timeout: bool) -> Self {
        let expiration_ms = if with_timeout { buf.get_u64_le() } else { 0 };
        Self {
            expiration_ms,
            msg_type: buf.get_u64_le(),
            msg_id: buf.get_i64_le(),
            payload_len: buf.get_u32_le(),
        }
    }

    /// Fills the full 28-byte header prefix in place.
    ///
    /// The request buffer is always marshalled with the full prefix; when
    /// the TIMEOUT feature was not negotiated the sender trims the leading
    /// 8 expiration bytes before enqueueing the frame.
    pub fn encode_into(&self, mut buf: &mut [u8]) {
        buf.put_u64_le(self.expiration_ms);
        buf.put_u64_le(self.msg_type);
        buf.put_i64_le(self.msg_id);
        buf.put_u32_le(self.payload_len);
    }

    pub fn header_size(with_timeout: bool) -> usize {
        if with_timeout {
            REQUEST_HEADER_WITH_TIMEOUT_SIZE
        } else {
            REQUEST_HEADER_SIZE
        }
    }
}

/// Decoded response frame header. A negative `msg_id` marks an exception
/// reply for the request with id `-msg_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub msg_id: i64,
    pub payload_len: u32,
}

impl ResponseHeader {
    pub fn decode(mut buf: &[u8]) -> Self {
        Self { msg_id: buf.get_i64_le(), payload_len: buf.get_u32_le() }
    }

    pub fn encode_into(&self, mut buf: &mut [u8]) {
        buf.put_i64_le(self.msg_id);
        buf.put_u32_le(self.payload_len);
    }
}

/// Exception record carried in the payload of a negative-id response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExceptionPayload {
    /// A handler failed; carries the handler's error message.
    User(String),
    /// The requested message type has no registered handler.
    UnknownVerb(u64),
}

impl ExceptionPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ExceptionPayload::User(msg) => {
                buf.put_u32_le(EXCEPTION_USER);
                buf.put_u32_le(msg.len() as u32);
                buf.put_slice(msg.as_bytes());
            }
            ExceptionPayload::UnknownVerb(msg_type) => {
                buf.put_u32_le(EXCEPTION_UNKNOWN_VERB);
                buf.put_u32_le(8);
                buf.put_u64_le(*msg_type);
            }
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        if buf.remaining() < 8 {
            return Err(RpcError::Protocol("truncated exception record".into()));
        }
        let kind = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if buf.remaining() < len {
            return Err(RpcError::Protocol("truncated exception record".into()));
        }
        match kind {
            EXCEPTION_USER => {
                let msg = String::from_utf8_lossy(&buf[..len]).into_owned();
                Ok(ExceptionPayload::User(msg))
            }
            EXCEPTION_UNKNOWN_VERB => {
                if len != 8 {
                    return Err(RpcError::Protocol(
                        "bad unknown-verb exception length".into(),
                    ));
                }
                Ok(ExceptionPayload::UnknownVerb(buf.get_u64_le()))
            }
            other => Err(RpcError::Protocol(format!("unknown exception kind {other}"))),
        }
    }

    /// The error a client surfaces for this record.
    pub fn into_error(self) -> RpcError {
        match self {
            ExceptionPayload::User(msg) => RpcError::Remote(msg),
            ExceptionPayload::UnknownVerb(msg_type) => RpcError::UnknownVerb(msg_type),
        }
    }
}

/// Builds a complete exception response frame. `msg_id` must already carry
/// the negative sign.
pub fn encode_exception_frame(msg_id: i64, ex: &ExceptionPayload) -> Bytes {
    let payload = ex.encode();
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
    buf.resize(RESPONSE_HEADER_SIZE, 0);
    buf.extend_from_slice(&payload);
    let header = ResponseHeader { msg_id, payload_len: payload.len() as u32 };
    header.encode_into(&mut buf[..RESPONSE_HEADER_SIZE]);
    buf.freeze()
}

pub fn encode_negotiation_frame(features: &FeatureMap) -> Bytes {
    let extra: usize = features.values().map(|v| 8 + v.len()).sum();
    let mut buf = BytesMut::with_capacity(NEGOTIATION_HEADER_SIZE + extra);
    buf.put_slice(&RPC_MAGIC);
    buf.put_u32_le(extra as u32);
    for (id, payload) in features {
        buf.put_u32_le(*id);
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
    }
    buf.freeze()
}

pub fn decode_feature_map(body: &[u8]) -> Result<FeatureMap> {
    let mut buf = body;
    let mut map = FeatureMap::new();
    while !buf.is_empty() {
        if buf.remaining() < 8 {
            return Err(RpcError::Protocol(
                "bad feature data format in negotiation frame".into(),
            ));
        }
        let id = buf.get_u32_le();
        let len = buf.get_u32_le() as usize;
        if len > buf.remaining() {
            return Err(RpcError::Protocol(
                "buffer underflow in feature data in negotiation frame".into(),
            ));
        }
        map.insert(id, Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }
    Ok(map)
}

pub async fn write_negotiation_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    features: &FeatureMap,
) -> Result<()> {
    writer.write_all(&encode_negotiation_frame(features)).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and validates the peer's negotiation frame.
///
/// Returns `RpcError::Closed` if the peer hung up before sending one and a
/// protocol error for a wrong magic, a truncated frame or malformed feature
/// records.
pub async fn read_negotiation_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FeatureMap> {
    let mut header = [0u8; NEGOTIATION_HEADER_SIZE];
    if !read_exact_or_eof(reader, &mut header).await? {
        return Err(RpcError::Closed);
    }
    if header[..8] != RPC_MAGIC {
        return Err(RpcError::Protocol("wrong protocol magic".into()));
    }
    let len = u32::from_le_bytes(header[8..12].try_into().unwrap());
    if len > MAX_PAYLOAD_SIZE {
        return Err(RpcError::Protocol(format!(
            "negotiation frame too large: {len} bytes"
        )));
    }
    let mut body = vec![0u8; len as usize];
    read_fully(reader, &mut body, "negotiation frame").await?;
    decode_feature_map(&body)
}

/// Reads exactly `buf.len()` bytes unless the stream is already at EOF.
///
/// Returns `Ok(false)` for a clean EOF before the first byte, which is the
/// only legitimate way for a peer to end the stream between frames. A
/// partial read is a protocol error reported by [`read_fully`] callers.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(RpcError::Protocol(format!(
                "unexpected eof while reading frame: expected {} got {}",
                buf.len(),
                filled
            )));
        }
        filled += n;
    }
    Ok(true)
}

async fn read_fully<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(RpcError::Protocol(
            format!("unexpected eof while reading {what}"),
        )),
        Err(e) => Err(e.into()),
    }
}

/// Reads one frame at a time from an ordered byte stream, transparently
/// unwrapping the compressed envelope once a compressor is installed.
pub struct FrameReader<R> {
    inner: R,
    compressor: Option<SharedCompressor>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, compressor: Option<SharedCompressor>) -> Self {
        Self { inner, compressor }
    }

    /// Reads one request frame. `Ok(None)` means the peer closed the stream
    /// at a frame boundary.
    pub async fn read_request(
        &mut self,
        timeout_negotiated: bool,
    ) -> Result<Option<(RequestHeader, Bytes)>> {
        let header_size = RequestHeader::header_size(timeout_negotiated);
        let len_offset = header_size - 4;
        let frame = self
            .next_frame(header_size, move |h| {
                u32::from_le_bytes(h[len_offset..len_offset + 4].try_into().unwrap())
            })
            .await?;
        Ok(frame.map(|(header, payload)| {
            (RequestHeader::decode(&header, timeout_negotiated), payload)
        }))
    }

    /// Reads one response frame. `Ok(None)` means the peer closed the
    /// stream at a frame boundary.
    pub async fn read_response(&mut self) -> Result<Option<(ResponseHeader, Bytes)>> {
        let frame = self
            .next_frame(RESPONSE_HEADER_SIZE, |h| {
                u32::from_le_bytes(h[8..12].try_into().unwrap())
            })
            .await?;
        Ok(frame.map(|(header, payload)| (ResponseHeader::decode(&header), payload)))
    }

    async fn next_frame(
        &mut self,
        header_size: usize,
        payload_len: impl Fn(&[u8]) -> u32,
    ) -> Result<Option<(Bytes, Bytes)>> {
        if let Some(compressor) = &self.compressor {
            let mut len_buf = [0u8; 4];
            if !read_exact_or_eof(&mut self.inner, &mut len_buf).await? {
                return Ok(None);
            }
            let len = u32::from_le_bytes(len_buf);
            if len > MAX_PAYLOAD_SIZE {
                return Err(RpcError::Protocol(format!(
                    "compressed frame too large: {len} bytes"
                )));
            }
            let mut blob = vec![0u8; len as usize];
            read_fully(&mut self.inner, &mut blob, "compressed frame").await?;
            let mut frame = compressor.decompress(&blob)?;
            if frame.len() < header_size {
                return Err(RpcError::Protocol("short compressed frame".into()));
            }
            let header = frame.split_to(header_size);
            let declared = payload_len(&header);
            if frame.len() != declared as usize {
                return Err(RpcError::Protocol(
                    "compressed frame length mismatch".into(),
                ));
            }
            Ok(Some((header, frame)))
        } else {
            let mut header = vec![0u8; header_size];
            if !read_exact_or_eof(&mut self.inner, &mut header).await? {
                return Ok(None);
            }
            let declared = payload_len(&header);
            if declared > MAX_PAYLOAD_SIZE {
                return Err(RpcError::Protocol(format!(
                    "frame payload too large: {declared} bytes"
                )));
            }
            let mut payload = vec![0u8; declared as usize];
            read_fully(&mut self.inner, &mut payload, "frame payload").await?;
            Ok(Some((header.into(), payload.into())))
        }
    }
}

/// Writes frames to an ordered byte stream, wrapping each one in the
/// compressed envelope once a compressor is installed. The send loop is the
/// only owner, which keeps frame writes atomic.
pub struct FrameWriter<W> {
    inner: W,
    compressor: Option<SharedCompressor>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, compressor: Option<SharedCompressor>) -> Self {
        Self { inner, compressor }
    }

    pub async fn write_frame(&mut self, frame: Bytes) -> Result<()> {
        if let Some(compressor) = &self.compressor {
            let compressed = compressor.compress(&frame)?;
            let mut buf = BytesMut::with_capacity(4 + compressed.len());
            buf.put_u32_le(compressed.len() as u32);
            buf.put_slice(&compressed);
            self.inner.write_all(&buf).await?;
        } else {
            self.inner.write_all(&frame).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Drains a FIFO queue of outgoing frames into the writer.
///
/// Producers enqueue fully-encoded frames; this loop is the single consumer
/// and the only task that touches the stream, so no two frames interleave.
/// The loop drains remaining frames after the last sender is dropped, then
/// closes the writer.
pub async fn run_send_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut queue: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
) -> Result<()> {
    while let Some(frame) = queue.recv().await {
        writer.write_frame(frame).await?;
    }
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::{noop_compressor, NoopCompressor};

    #[test]
    fn test_request_header_roundtrip() {
        let header = RequestHeader {
            expiration_ms: 1500,
            msg_type: 7,
            msg_id: 42,
            payload_len: 13,
        };
        let mut buf = [0u8; REQUEST_HEADER_WITH_TIMEOUT_SIZE];
        header.encode_into(&mut buf);

        let decoded = RequestHeader::decode(&buf, true);
        assert_eq!(decoded, header);

        // Trimming the expiration field yields the baseline header.
        let decoded = RequestHeader::decode(&buf[8..], false);
        assert_eq!(decoded.expiration_ms, 0);
        assert_eq!(decoded.msg_type, 7);
        assert_eq!(decoded.msg_id, 42);
        assert_eq!(decoded.payload_len, 13);
    }

    #[test]
    fn test_response_header_roundtrip() {
        let header = ResponseHeader { msg_id: -9, payload_len: 5 };
        let mut buf = [0u8; RESPONSE_HEADER_SIZE];
        header.encode_into(&mut buf);
        assert_eq!(ResponseHeader::decode(&buf), header);
    }

    #[test]
    fn test_header_sizes() {
        assert_eq!(NEGOTIATION_HEADER_SIZE, 12);
        assert_eq!(REQUEST_HEADER_SIZE, 20);
        assert_eq!(REQUEST_HEADER_WITH_TIMEOUT_SIZE, 28);
        assert_eq!(RESPONSE_HEADER_SIZE, 12);
        assert_eq!(RPC_MAGIC.len(), 8);
    }

    #[test]
    fn test_exception_user_roundtrip() {
        let ex = ExceptionPayload::User("boom".into());
        let decoded = ExceptionPayload::decode(&ex.encode()).unwrap();
        assert_eq!(decoded, ex);
        assert!(matches!(decoded.into_error(), RpcError::Remote(m) if m == "boom"));
    }

    #[test]
    fn test_exception_unknown_verb_roundtrip() {
        let ex = ExceptionPayload::UnknownVerb(999);
        let encoded = ex.encode();
        assert_eq!(encoded.len(), 16);
        let decoded = ExceptionPayload::decode(&encoded).unwrap();
        assert!(matches!(decoded.into_error(), RpcError::UnknownVerb(999)));
    }

    #[test]
    fn test_exception_unknown_kind_is_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(7);
        buf.put_u32_le(0);
        assert!(matches!(
            ExceptionPayload::decode(&buf),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_unknown_verb_frame_admits_28_bytes() {
        let frame = encode_exception_frame(-3, &ExceptionPayload::UnknownVerb(999));
        assert_eq!(frame.len(), 28);
        let header = ResponseHeader::decode(&frame[..RESPONSE_HEADER_SIZE]);
        assert_eq!(header.msg_id, -3);
        assert_eq!(header.payload_len, 16);
    }

    #[test]
    fn test_negotiation_roundtrip() {
        let mut features = FeatureMap::new();
        features.insert(FEATURE_COMPRESS, Bytes::from_static(b"noop"));
        features.insert(FEATURE_TIMEOUT, Bytes::new());

        let frame = encode_negotiation_frame(&features);
        assert_eq!(&frame[..8], &RPC_MAGIC);
        let decoded = decode_feature_map(&frame[NEGOTIATION_HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, features);
    }

    #[test]
    fn test_feature_record_shorter_than_eight_bytes_rejected() {
        assert!(matches!(
            decode_feature_map(&[1, 0, 0]),
            Err(RpcError::Protocol(_))
        ));
    }

    #[test]
    fn test_feature_record_overrunning_buffer_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(FEATURE_COMPRESS);
        buf.put_u32_le(100);
        buf.put_slice(b"xy");
        assert!(matches!(
            decode_feature_map(&buf),
            Err(RpcError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_magic_rejected() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut tx, b"NOTDRIFT\0\0\0\0")
            .await
            .unwrap();
        let err = read_negotiation_frame(&mut rx).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol(m) if m.contains("wrong protocol magic")));
    }

    #[tokio::test]
    async fn test_clean_eof_before_negotiation_is_closed() {
        let (tx, mut rx) = tokio::io::duplex(64);
        drop(tx);
        assert!(matches!(
            read_negotiation_frame(&mut rx).await,
            Err(RpcError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_partial_header_is_protocol_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut tx, &[1, 2, 3]).await.unwrap();
        drop(tx);
        let mut reader = FrameReader::new(rx, None);
        assert!(matches!(
            reader.read_response().await,
            Err(RpcError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_clean_eof_at_frame_boundary_is_none() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = FrameReader::new(rx, None);
        assert!(reader.read_response().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_uncompressed_response_roundtrip() {
        let (tx, rx) = tokio::io::duplex(256);

        let mut buf = BytesMut::new();
        buf.resize(RESPONSE_HEADER_SIZE, 0);
        buf.extend_from_slice(b"hello");
        ResponseHeader { msg_id: 4, payload_len: 5 }
            .encode_into(&mut buf[..RESPONSE_HEADER_SIZE]);

        let mut writer = FrameWriter::new(tx, None);
        writer.write_frame(buf.freeze()).await.unwrap();

        let mut reader = FrameReader::new(rx, None);
        let (header, payload) = reader.read_response().await.unwrap().unwrap();
        assert_eq!(header.msg_id, 4);
        assert_eq!(&payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_compressed_frames_carry_length_envelope() {
        let (tx, rx) = tokio::io::duplex(256);

        let mut buf = BytesMut::new();
        buf.resize(RESPONSE_HEADER_SIZE, 0);
        buf.extend_from_slice(b"zip");
        ResponseHeader { msg_id: 1, payload_len: 3 }
            .encode_into(&mut buf[..RESPONSE_HEADER_SIZE]);
        let frame = buf.freeze();

        let mut writer = FrameWriter::new(tx, Some(noop_compressor()));
        writer.write_frame(frame.clone()).await.unwrap();
        writer.shutdown().await.unwrap();

        // The identity compressor makes the envelope visible on the wire.
        let mut raw = Vec::new();
        let mut rx = rx;
        tokio::io::AsyncReadExt::read_to_end(&mut rx, &mut raw).await.unwrap();
        assert_eq!(raw.len(), 4 + frame.len());
        assert_eq!(u32::from_le_bytes(raw[..4].try_into().unwrap()), frame.len() as u32);

        let mut reader = FrameReader::new(std::io::Cursor::new(raw), Some(noop_compressor()));
        let (header, payload) = reader.read_response().await.unwrap().unwrap();
        assert_eq!(header.msg_id, 1);
        assert_eq!(&payload[..], b"zip");
    }

    #[tokio::test]
    async fn test_compressed_length_mismatch_is_protocol_error() {
        // A decompressed frame whose declared payload length disagrees with
        // the bytes present must not be delivered.
        let mut inner = BytesMut::new();
        inner.resize(RESPONSE_HEADER_SIZE, 0);
        inner.extend_from_slice(b"abc");
        ResponseHeader { msg_id: 1, payload_len: 99 }
            .encode_into(&mut inner[..RESPONSE_HEADER_SIZE]);

        let mut wire = BytesMut::new();
        wire.put_u32_le(inner.len() as u32);
        wire.put_slice(&inner);

        let mut reader = FrameReader::new(
            std::io::Cursor::new(wire.to_vec()),
            Some(std::sync::Arc::new(NoopCompressor)),
        );
        assert!(matches!(
            reader.read_response().await,
            Err(RpcError::Protocol(_))
        ));
    }
}
