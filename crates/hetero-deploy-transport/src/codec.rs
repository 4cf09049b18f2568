//! JSON encode/decode helpers for the `bytes`-typed payload fields
//! carried by the generated protobuf messages. The control-plane
//! envelopes stay thin (ids, node names, status) while the actual
//! `hetero-deploy` domain types ride inside as opaque JSON, since they
//! already derive `Serialize`/`Deserialize` for the core crate's own
//! fixture-driven tests.

use crate::error::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

pub(crate) fn encode_str<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn decode_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| Error::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn bytes_round_trip() {
        let value = Sample { a: 7, b: "x".into() };
        let bytes = encode(&value).unwrap();
        let decoded: Sample = decode(&bytes).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn str_round_trip() {
        let value = Sample { a: 1, b: "y".into() };
        let s = encode_str(&value).unwrap();
        let decoded: Sample = decode_str(&s).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn decode_rejects_malformed_bytes() {
        let err = decode::<Sample>(b"not json").unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }
}
