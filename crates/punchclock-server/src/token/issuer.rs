//! Token issuance for attendance terminals.

use std::sync::Arc;

use punchclock_core::config::TokenConfig;
use punchclock_core::{Clock, Error, Result};
use punchclock_crypto::{SigningKey, TokenPayload, codec};
use serde::Serialize;
use tracing::{debug, info, instrument};

use super::{active_terminal, crypto_error};
use crate::nonce::NonceStore;
use crate::storage::{AttendanceDatabase, NewIssuance};

/// A token ready to be rendered by a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub token: String,
    #[serde(skip)]
    pub nonce: String,
    pub terminal_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
    #[serde(rename = "expires_in_seconds")]
    pub expires_in_secs: i64,
}

/// Signs, records and registers terminal tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    db: AttendanceDatabase,
    key: SigningKey,
    nonces: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
    validity_secs: i64,
    nonce_margin_secs: i64,
}

impl TokenIssuer {
    pub fn new(
        db: AttendanceDatabase,
        key: SigningKey,
        nonces: Arc<dyn NonceStore>,
        clock: Arc<dyn Clock>,
        config: &TokenConfig,
    ) -> Self {
        Self {
            db,
            key,
            nonces,
            clock,
            validity_secs: config.validity_secs,
            nonce_margin_secs: config.nonce_margin_secs,
        }
    }

    /// Issue a fresh token for an active terminal. Earlier tokens of the
    /// same terminal stay valid until they expire.
    #[instrument(skip(self))]
    pub async fn issue(&self, terminal_public_id: &str) -> Result<IssuedToken> {
        let terminal = active_terminal(&self.db, terminal_public_id).await?;
        let now = self.clock.now();

        let payload = TokenPayload::new(&terminal.public_id, now, self.validity_secs);
        let (token, signature) = codec::encode(&payload, &self.key).map_err(crypto_error)?;
        let payload_json = serde_json::to_string(&payload)?;
        let expires_at = payload.expires_at();

        self.db
            .insert_issuance(&NewIssuance {
                terminal_id: &terminal.id,
                token: &token,
                payload: &payload_json,
                signature: &signature,
                nonce: &payload.nonce,
                generated_at: now,
                expires_at,
            })
            .await?;

        self.nonces
            .set_with_ttl(
                &payload.nonce,
                &terminal.public_id,
                self.validity_secs + self.nonce_margin_secs,
            )
            .await;

        debug!(terminal = %terminal.public_id, expires_at, "Token issued");

        Ok(IssuedToken {
            token,
            nonce: payload.nonce,
            terminal_id: terminal.public_id,
            issued_at: now,
            expires_at,
            expires_in_secs: self.validity_secs,
        })
    }

    /// The terminal's newest live token, issuing one if none is live.
    #[instrument(skip(self))]
    pub async fn current(&self, terminal_public_id: &str) -> Result<IssuedToken> {
        let terminal = active_terminal(&self.db, terminal_public_id).await?;
        let now = self.clock.now();

        match self.db.current_issuance(&terminal.id, now).await? {
            Some(issuance) => Ok(IssuedToken {
                token: issuance.token,
                nonce: issuance.nonce,
                terminal_id: terminal.public_id,
                issued_at: issuance.generated_at,
                expires_at: issuance.expires_at,
                expires_in_secs: issuance.expires_at - now,
            }),
            None => {
                info!(terminal = %terminal.public_id, "No live token, issuing");
                self.issue(terminal_public_id).await
            }
        }
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("validity_secs", &self.validity_secs)
            .field("nonce_margin_secs", &self.nonce_margin_secs)
            .finish_non_exhaustive()
    }
}
