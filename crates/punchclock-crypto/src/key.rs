//! Shared-secret signing key for terminal tokens.

use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Minimum secret length accepted for HMAC-SHA256 (256-bit strength).
pub const MIN_KEY_LEN: usize = 32;

/// Length of an HMAC-SHA256 tag in bytes.
pub const SIGNATURE_LEN: usize = 32;

/// HMAC-SHA256 key shared by token issuer and verifier.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SigningKey {
    secret: Vec<u8>,
}

impl SigningKey {
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        if secret.len() < MIN_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: MIN_KEY_LEN,
                actual: secret.len(),
            });
        }
        Ok(Self {
            secret: secret.to_vec(),
        })
    }

    /// Generate a random key (for tests and first-run setup).
    pub fn generate() -> Self {
        let mut secret = vec![0u8; MIN_KEY_LEN];
        OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    // HMAC accepts keys of any length.
    #[allow(clippy::expect_used)]
    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts any key length")
    }

    /// HMAC-SHA256 tag over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let mut mac = self.mac();
        mac.update(message);
        mac.finalize().into_bytes().into()
    }

    /// Check a tag in constant time.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        constant_time_eq(&self.sign(message), signature)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey").finish_non_exhaustive()
    }
}

/// Constant-time byte comparison. Lengths are not secret.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Constant-time string comparison.
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}
