//! Token verification and single-use consumption.

use std::sync::Arc;

use punchclock_core::{Clock, Error, Result};
use punchclock_crypto::{SigningKey, TokenPayload, codec};
use tracing::{error, instrument, warn};

use super::crypto_error;
use crate::nonce::NonceStore;
use crate::storage::AttendanceDatabase;

#[derive(Clone)]
pub struct TokenVerifier {
    db: AttendanceDatabase,
    key: SigningKey,
    nonces: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
}

impl TokenVerifier {
    pub fn new(
        db: AttendanceDatabase,
        key: SigningKey,
        nonces: Arc<dyn NonceStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            key,
            nonces,
            clock,
        }
    }

    /// Check a presented token without side effects.
    ///
    /// Checks run in order: shape, signature, age, nonce liveness. A token
    /// issued at `T` with window `W` is accepted up to and including
    /// `T + W`.
    #[instrument(skip_all)]
    pub async fn verify(&self, token: &str) -> Result<TokenPayload> {
        let payload = codec::decode(token, &self.key).map_err(|e| {
            warn!(error = %e, "Token rejected");
            crypto_error(e)
        })?;

        let age = self.clock.now() - payload.issued_at;
        if age > payload.validity_secs {
            return Err(Error::TokenExpired {
                expired_secs: age - payload.validity_secs,
            });
        }

        if self.nonces.get(&payload.nonce).await.is_none() {
            return Err(Error::TokenAlreadyUsedOrExpired);
        }

        Ok(payload)
    }

    /// Burn a verified token on behalf of `subject_id`.
    ///
    /// The nonce is taken atomically first; a second consumer gets
    /// [`Error::TokenAlreadyUsedOrExpired`]. A storage failure after the take
    /// leaves the token burnt.
    #[instrument(skip(self, payload), fields(terminal = %payload.terminal_id))]
    pub async fn consume(&self, payload: &TokenPayload, subject_id: &str) -> Result<()> {
        if self.nonces.take(&payload.nonce).await.is_none() {
            return Err(Error::TokenAlreadyUsedOrExpired);
        }

        let consumed = self
            .db
            .consume_issuance(
                &payload.terminal_id,
                &payload.nonce,
                subject_id,
                self.clock.now(),
            )
            .await
            .inspect_err(|e| error!(error = %e, "Nonce taken but issuance not marked"))?;

        if !consumed {
            warn!("Live nonce without an unconsumed issuance");
            return Err(Error::TokenAlreadyUsedOrExpired);
        }
        Ok(())
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}
