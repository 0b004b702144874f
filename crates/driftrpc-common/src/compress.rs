//! Optional per-connection frame compression.
//!
//! Compression is negotiated through the `COMPRESS` feature: each side
//! advertises its factory's `supported()` payload and installs the
//! compressor the factory returns for the peer's payload. Once installed,
//! every frame after negotiation travels inside a 4-byte length envelope;
//! negotiation frames are never compressed.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

/// Transforms whole frames. One instance serves both directions of a
/// connection, so implementations with per-direction state must manage it
/// internally.
pub trait Compressor: Send + Sync {
    fn compress(&self, frame: &[u8]) -> Result<Bytes>;
    fn decompress(&self, data: &[u8]) -> Result<Bytes>;
}

/// A compressor shared between a connection's read and send loops.
pub type SharedCompressor = Arc<dyn Compressor>;

/// Negotiates a [`Compressor`] for a connection.
pub trait CompressorFactory: Send + Sync {
    /// The opaque feature payload advertised during negotiation.
    fn supported(&self) -> Bytes;

    /// Inspects the peer's feature payload and returns the compressor to
    /// install, or `None` when no common algorithm exists.
    fn negotiate(&self, peer_payload: &[u8], is_server: bool) -> Option<SharedCompressor>;
}

/// Identity compressor. Frames still travel inside the length envelope,
/// which makes the compressed path testable without a real algorithm.
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, frame: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(frame))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

pub fn noop_compressor() -> SharedCompressor {
    Arc::new(NoopCompressor)
}

/// Factory for [`NoopCompressor`], advertising the payload `b"noop"`.
pub struct NoopCompressorFactory;

impl CompressorFactory for NoopCompressorFactory {
    fn supported(&self) -> Bytes {
        Bytes::from_static(b"noop")
    }

    fn negotiate(&self, peer_payload: &[u8], _is_server: bool) -> Option<SharedCompressor> {
        if peer_payload == b"noop" {
            Some(noop_compressor())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_roundtrip() {
        let compressor = NoopCompressor;
        let frame = b"some frame bytes";
        let compressed = compressor.compress(frame).unwrap();
        assert_eq!(compressor.decompress(&compressed).unwrap(), &frame[..]);
    }

    #[test]
    fn test_factory_agrees_on_noop() {
        let factory = NoopCompressorFactory;
        assert!(factory.negotiate(&factory.supported(), true).is_some());
        assert!(factory.negotiate(b"zstd", false).is_none());
    }
}
