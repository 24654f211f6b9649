//! SHA-256 digests for the attendance hash chain.
//!
//! Records are hashed over a canonical JSON rendering: object keys sorted,
//! no insignificant whitespace. `serde_json::Value` keeps objects in a
//! `BTreeMap` unless `preserve_order` is enabled, so going through `Value`
//! gives sorted keys for free.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Canonical JSON bytes of `value`.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    let value =
        serde_json::to_value(value).map_err(|e| CryptoError::SerializationError(e.to_string()))?;
    serde_json::to_vec(&value).map_err(|e| CryptoError::SerializationError(e.to_string()))
}

/// Hex SHA-256 over the canonical JSON of `value`.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String, CryptoError> {
    Ok(sha256_hex(&canonical_json(value)?))
}
