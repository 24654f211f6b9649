//! Terminal token codec.
//!
//! A token is `payload_b64.signature_b64`: the JSON payload and its
//! HMAC-SHA256 tag, both base64url. Padding is omitted on encode and
//! tolerated on decode. The tag covers the raw payload bytes, so a padded
//! and an unpadded rendering of the same token verify alike.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::formats::{self, TokenFormat};
use crate::key::SigningKey;

/// Current payload format version.
pub const TOKEN_VERSION: u8 = 1;

/// Nonce entropy in bytes.
pub const NONCE_LEN: usize = 16;

const MAX_TOKEN_LEN: usize = 2048;

/// base64url, no padding on encode, padding optional on decode.
pub(crate) const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Signed content of a terminal token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Public id of the issuing terminal.
    #[serde(rename = "tid")]
    pub terminal_id: String,
    /// Issuance time (Unix seconds).
    #[serde(rename = "iat")]
    pub issued_at: i64,
    /// Validity window in seconds.
    #[serde(rename = "ttl")]
    pub validity_secs: i64,
    #[serde(rename = "n")]
    pub nonce: String,
    #[serde(rename = "v", default = "default_version")]
    pub version: u8,
}

const fn default_version() -> u8 {
    TOKEN_VERSION
}

impl TokenPayload {
    /// Build a current-version payload with a fresh random nonce.
    pub fn new(terminal_id: impl Into<String>, issued_at: i64, validity_secs: i64) -> Self {
        Self {
            terminal_id: terminal_id.into(),
            issued_at,
            validity_secs,
            nonce: random_nonce(),
            version: TOKEN_VERSION,
        }
    }

    pub const fn expires_at(&self) -> i64 {
        self.issued_at + self.validity_secs
    }
}

/// A token split into its raw parts, before signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedToken {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// 16 random bytes, base64url.
pub fn random_nonce() -> String {
    let mut bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut bytes);
    B64.encode(bytes)
}

/// Serialize and sign a payload. Returns the token string and the
/// base64url signature (stored alongside the issuance).
pub fn encode(payload: &TokenPayload, key: &SigningKey) -> Result<(String, String), CryptoError> {
    let payload_bytes = serde_json::to_vec(payload)
        .map_err(|e| CryptoError::SerializationError(e.to_string()))?;
    let signature = B64.encode(key.sign(&payload_bytes));
    Ok((format!("{}.{}", B64.encode(&payload_bytes), signature), signature))
}

/// Split a token into raw payload and signature, trying every known format
/// in order.
pub fn split(token: &str) -> Result<SignedToken, CryptoError> {
    split_with(token, formats::DEFAULT_FORMATS)
}

/// [`split`] with an explicit, ordered format list.
pub fn split_with(token: &str, formats: &[&dyn TokenFormat]) -> Result<SignedToken, CryptoError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(CryptoError::Malformed("empty token".into()));
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(CryptoError::Malformed("token exceeds max length".into()));
    }
    for format in formats {
        if let formats::Decoded::Recognized(signed) = format.decode(token)? {
            return Ok(signed);
        }
    }
    Err(CryptoError::Malformed("unrecognized token format".into()))
}

/// Parse raw payload bytes. Every field except the version is required.
pub fn decode_payload(bytes: &[u8]) -> Result<TokenPayload, CryptoError> {
    let payload: TokenPayload =
        serde_json::from_slice(bytes).map_err(|e| CryptoError::InvalidPayload(e.to_string()))?;
    if payload.terminal_id.is_empty() {
        return Err(CryptoError::InvalidPayload("empty terminal id".into()));
    }
    if payload.nonce.is_empty() {
        return Err(CryptoError::InvalidPayload("empty nonce".into()));
    }
    if payload.validity_secs <= 0 {
        return Err(CryptoError::InvalidPayload("non-positive validity window".into()));
    }
    Ok(payload)
}

/// Split, verify the signature in constant time, then parse the payload.
pub fn decode(token: &str, key: &SigningKey) -> Result<TokenPayload, CryptoError> {
    let signed = split(token)?;
    if !key.verify(&signed.payload, &signed.signature) {
        return Err(CryptoError::InvalidSignature);
    }
    decode_payload(&signed.payload)
}
