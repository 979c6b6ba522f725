//! Pluggable payload codecs
//!
//! A codec turns a typed value into opaque bytes and back. Transports never
//! look inside the bytes; the codec only matters at the edges where callers
//! build and open envelopes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{CodecError, Result};

// ----------------------------------------------------------------------------
// Codec Trait
// ----------------------------------------------------------------------------

/// Encode/decode pair for envelope payloads
pub trait Codec: Send + Sync + 'static {
    /// Encode `value` into payload bytes
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode payload bytes into a `T`
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

// ----------------------------------------------------------------------------
// Binary Codec
// ----------------------------------------------------------------------------

/// Compact binary codec backed by bincode
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| CodecError::Bincode(e).into())
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Bincode(e).into())
    }

    fn name(&self) -> &'static str {
        "bincode"
    }
}

// ----------------------------------------------------------------------------
// JSON Codec
// ----------------------------------------------------------------------------

/// Human-readable JSON codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| CodecError::Json(e).into())
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e).into())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
        tags: Vec<u8>,
    }

    fn sample() -> Reading {
        Reading {
            sensor: "thermo".into(),
            value: 21.5,
            tags: vec![1, 2, 3],
        }
    }

    #[test]
    fn bincode_roundtrip() {
        let codec = BincodeCodec;
        let bytes = codec.encode(&sample()).unwrap();
        let back: Reading = codec.decode(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn json_is_readable() {
        let codec = JsonCodec;
        let bytes = codec.encode(&sample()).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"sensor\":\"thermo\""));
        let back: Reading = codec.decode(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn decode_garbage_is_codec_error() {
        let err = JsonCodec.decode::<Reading>(b"{not json").unwrap_err();
        assert!(err.is_codec());

        let err = BincodeCodec.decode::<Reading>(&[0xFF]).unwrap_err();
        assert!(err.is_codec());
    }
}
