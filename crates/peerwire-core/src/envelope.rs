//! Message envelope: a one-byte type tag followed by codec payload bytes
//!
//! Wire layout: `[type_code: u8][payload ...]`.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Codec;
use crate::errors::{CodecError, ProtocolError, Result};

/// Type code reserved for the identification handshake
pub const IDENTIFY_TYPE_CODE: u8 = 0xFF;

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// Tagged opaque payload moved by every transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub type_code: u8,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an application envelope from raw payload bytes
    pub fn new(type_code: u8, payload: Vec<u8>) -> Result<Self> {
        if type_code == IDENTIFY_TYPE_CODE {
            return Err(ProtocolError::ReservedTypeCode { code: type_code }.into());
        }
        Ok(Self { type_code, payload })
    }

    /// Encode `value` with `codec` and tag it with `type_code`
    pub fn from_value<C, T>(codec: &C, type_code: u8, value: &T) -> Result<Self>
    where
        C: Codec,
        T: Serialize + ?Sized,
    {
        let payload = codec.encode(value)?;
        Self::new(type_code, payload)
    }

    /// Identification envelope carrying `logical_name`
    pub fn identification<C: Codec>(codec: &C, logical_name: &str) -> Result<Self> {
        Ok(Self {
            type_code: IDENTIFY_TYPE_CODE,
            payload: codec.encode(logical_name)?,
        })
    }

    pub fn is_identification(&self) -> bool {
        self.type_code == IDENTIFY_TYPE_CODE
    }

    /// Decode the name carried by an identification envelope
    pub fn logical_name<C: Codec>(&self, codec: &C) -> Result<String> {
        if !self.is_identification() {
            return Err(CodecError::UnexpectedType {
                expected: IDENTIFY_TYPE_CODE,
                actual: self.type_code,
            }
            .into());
        }
        codec.decode(&self.payload)
    }

    /// Decode the payload as a `T`
    pub fn to_object<C, T>(&self, codec: &C) -> Result<T>
    where
        C: Codec,
        T: DeserializeOwned,
    {
        codec.decode(&self.payload)
    }

    /// Decode the payload as a `T`, checking the tag first
    pub fn to_object_tagged<C, T>(&self, codec: &C, expected: u8) -> Result<T>
    where
        C: Codec,
        T: DeserializeOwned,
    {
        if self.type_code != expected {
            return Err(CodecError::UnexpectedType {
                expected,
                actual: self.type_code,
            }
            .into());
        }
        self.to_object(codec)
    }

    /// Serialized length on the wire
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Serialize to `[tag][payload]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.type_code);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse `[tag][payload]`; the identification tag is accepted here
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&type_code, payload) = bytes.split_first().ok_or(ProtocolError::EmptyEnvelope)?;
        Ok(Self {
            type_code,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BincodeCodec, JsonCodec};
    use crate::errors::PeerwireError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[test]
    fn tag_precedes_payload() {
        let env = Envelope::from_value(&JsonCodec, 7, &Ping { seq: 3 }).unwrap();
        let bytes = env.to_bytes();
        assert_eq!(bytes[0], 7);
        assert_eq!(&bytes[1..], br#"{"seq":3}"#);
        assert_eq!(bytes.len(), env.encoded_len());

        let parsed = Envelope::from_bytes(&bytes).unwrap();
        let ping: Ping = parsed.to_object(&JsonCodec).unwrap();
        assert_eq!(ping, Ping { seq: 3 });
    }

    #[test]
    fn reserved_code_rejected_for_application_envelopes() {
        let err = Envelope::new(IDENTIFY_TYPE_CODE, vec![]).unwrap_err();
        assert!(matches!(
            err,
            PeerwireError::Protocol(ProtocolError::ReservedTypeCode { code: 0xFF })
        ));
    }

    #[test]
    fn identification_roundtrip() {
        let env = Envelope::identification(&BincodeCodec, "peerA").unwrap();
        assert!(env.is_identification());
        let parsed = Envelope::from_bytes(&env.to_bytes()).unwrap();
        assert_eq!(parsed.logical_name(&BincodeCodec).unwrap(), "peerA");
    }

    #[test]
    fn logical_name_on_regular_envelope_fails() {
        let env = Envelope::new(1, vec![1, 2]).unwrap();
        assert!(env.logical_name(&BincodeCodec).unwrap_err().is_codec());
    }

    #[test]
    fn empty_bytes_is_protocol_error() {
        let err = Envelope::from_bytes(&[]).unwrap_err();
        assert!(matches!(
            err,
            PeerwireError::Protocol(ProtocolError::EmptyEnvelope)
        ));
    }

    #[test]
    fn tagged_decode_checks_type() {
        let env = Envelope::from_value(&BincodeCodec, 2, &Ping { seq: 1 }).unwrap();
        assert!(env.to_object_tagged::<_, Ping>(&BincodeCodec, 3).is_err());
        assert_eq!(
            env.to_object_tagged::<_, Ping>(&BincodeCodec, 2).unwrap(),
            Ping { seq: 1 }
        );
    }
}
