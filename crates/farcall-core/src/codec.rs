//! Value serialization for arguments, results and property values.
//!
//! The RPC layer treats payloads as opaque bytes; this is the one place that
//! decides how typed values become those bytes.

use crate::error::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Decode an optional payload, treating absence as `T::default()`.
pub fn decode_or_default<T: DeserializeOwned + Default>(bytes: Option<&Bytes>) -> Result<T> {
    match bytes {
        Some(bytes) => decode(bytes),
        None => Ok(T::default()),
    }
}

/// Decode positional argument `index` of a method call.
pub fn arg<T: DeserializeOwned>(args: &[Bytes], index: usize) -> Result<T> {
    let raw = args.get(index).ok_or_else(|| {
        crate::error::RpcError::InvalidArguments(format!(
            "expected at least {} arguments, got {}",
            index + 1,
            args.len()
        ))
    })?;
    decode(raw)
}
