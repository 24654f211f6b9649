//! Punchclock token and record cryptography
//!
//! Signs the short-lived tokens shown on attendance terminals and hashes
//! attendance records into per-subject chains.
//!
//! ## Primitives
//!
//! - **Tokens**: JSON payload, HMAC-SHA256 tag, both base64url (`payload.sig`)
//! - **Legacy formats**: `qr1.`-prefixed and JSON-envelope tokens still verify
//! - **Chain digests**: SHA-256 over canonical (sorted-key) JSON, hex encoded

pub mod codec;
pub mod digest;
pub mod error;
pub mod formats;
pub mod key;

pub use codec::{SignedToken, TOKEN_VERSION, TokenPayload};
pub use digest::{canonical_digest, sha256_hex};
pub use error::CryptoError;
pub use formats::{Decoded, TokenFormat};
pub use key::{SigningKey, constant_time_eq, constant_time_str_eq};
