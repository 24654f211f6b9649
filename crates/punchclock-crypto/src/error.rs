//! Crypto error types.

/// Errors from token encoding, decoding and signing.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The token string does not have the expected shape.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The payload decoded but lacks required fields or does not parse.
    #[error("Invalid token payload: {0}")]
    InvalidPayload(String),

    #[error("Token signature mismatch")]
    InvalidSignature,

    #[error("Invalid key length: expected at least {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}
