//! Wiring of the server's shared components.

use std::sync::Arc;

use punchclock_core::{AttendanceRules, Clock, Config, Error, LocalCalendar, Result};
use punchclock_crypto::SigningKey;
use tokio::sync::mpsc;

use crate::ledger::Ledger;
use crate::nonce::{MemoryNonceStore, NonceStore};
use crate::service::AttendanceService;
use crate::storage::AttendanceDatabase;
use crate::summary::{SummaryJob, SummaryQueue, SummaryService};
use crate::token::{TokenIssuer, TokenVerifier};

/// Everything request handlers and background tasks share.
#[derive(Clone)]
pub struct AppState {
    pub db: AttendanceDatabase,
    pub issuer: TokenIssuer,
    pub attendance: AttendanceService,
    pub summaries: SummaryService,
    pub nonces: Arc<dyn NonceStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Build the state with an in-process nonce store. The returned receiver
    /// feeds the summary worker.
    pub fn new(
        db: AttendanceDatabase,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, mpsc::Receiver<SummaryJob>)> {
        let nonces: Arc<dyn NonceStore> = Arc::new(MemoryNonceStore::new(Arc::clone(&clock)));
        Self::with_nonce_store(db, config, clock, nonces)
    }

    pub fn with_nonce_store(
        db: AttendanceDatabase,
        config: Config,
        clock: Arc<dyn Clock>,
        nonces: Arc<dyn NonceStore>,
    ) -> Result<(Self, mpsc::Receiver<SummaryJob>)> {
        config.validate()?;
        let key = SigningKey::new(config.tokens.signing_secret.as_bytes())
            .map_err(|e| Error::Config(e.to_string()))?;
        let calendar = LocalCalendar::from_offset_minutes(config.server.utc_offset_minutes);

        let issuer = TokenIssuer::new(
            db.clone(),
            key.clone(),
            Arc::clone(&nonces),
            Arc::clone(&clock),
            &config.tokens,
        );
        let verifier = TokenVerifier::new(db.clone(), key, Arc::clone(&nonces), Arc::clone(&clock));
        let ledger = Ledger::new(db.clone(), Arc::clone(&clock));
        let rules = Arc::new(AttendanceRules::new(
            config.rules.clone(),
            config.schedule.clone(),
            calendar,
        ));
        let (queue, rx) = SummaryQueue::channel();
        let attendance = AttendanceService::new(
            db.clone(),
            verifier,
            ledger,
            rules,
            queue,
            Arc::clone(&clock),
        );
        let summaries = SummaryService::new(
            db.clone(),
            config.rules.clone(),
            calendar,
            Arc::clone(&clock),
        );

        Ok((
            Self {
                db,
                issuer,
                attendance,
                summaries,
                nonces,
                clock,
                config: Arc::new(config),
            },
            rx,
        ))
    }
}
