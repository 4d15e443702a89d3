//! Byte codec for on-disk records.
//!
//! One record per file, encoded as JSON. The layout is an implementation
//! detail of this module; everything else treats the bytes as opaque.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub(crate) fn encode<R: Serialize>(record: &R) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(record)
}

pub(crate) fn decode<R: DeserializeOwned>(bytes: &[u8]) -> Result<R, serde_json::Error> {
    serde_json::from_slice(bytes)
}
