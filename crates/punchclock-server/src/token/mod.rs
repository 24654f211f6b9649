//! Terminal token issuance and verification.

mod issuer;
mod verifier;

pub use issuer::{IssuedToken, TokenIssuer};
pub use verifier::TokenVerifier;

use punchclock_core::Error;
use punchclock_crypto::CryptoError;

use crate::storage::{AttendanceDatabase, Terminal};

/// Map codec failures onto the caller-facing taxonomy.
pub(crate) fn crypto_error(e: CryptoError) -> Error {
    match e {
        CryptoError::InvalidSignature => Error::InvalidSignature,
        CryptoError::Malformed(msg) | CryptoError::InvalidPayload(msg) => {
            Error::MalformedToken(msg)
        }
        CryptoError::InvalidKeyLength { .. } | CryptoError::SerializationError(_) => {
            Error::Config(e.to_string())
        }
    }
}

/// Terminal with `public_id`, failing unless it exists and is active.
pub(crate) async fn active_terminal(
    db: &AttendanceDatabase,
    public_id: &str,
) -> Result<Terminal, Error> {
    let terminal = db
        .get_terminal_by_public_id(public_id)
        .await?
        .ok_or_else(|| Error::TerminalNotFound(public_id.to_string()))?;
    if !terminal.active {
        return Err(Error::TerminalInactive(public_id.to_string()));
    }
    Ok(terminal)
}
