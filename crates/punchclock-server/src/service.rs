//! Scan registration: the full path from a presented token to a chained
//! attendance record.

use std::sync::Arc;

use punchclock_core::{
    AttendanceKind, AttendanceRules, Clock, Confidence, Error, Result, ScanContext,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::ledger::{Ledger, NewRecord};
use crate::storage::{AttendanceDatabase, AttendanceRecord};
use crate::summary::{SummaryJob, SummaryQueue};
use crate::token::{TokenVerifier, active_terminal};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// A scan as submitted by an authenticated subject.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanRequest {
    pub token: String,
    #[serde(default)]
    pub declared_type: Option<AttendanceKind>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub device_info: Option<String>,
    /// Device clock at scan time. Stored for audit, never trusted.
    #[serde(default)]
    pub client_timestamp: Option<i64>,
    /// Accept an EXIT beyond the daily limit (supervisor-approved overtime).
    #[serde(default)]
    pub allow_overtime: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanTerminal {
    pub public_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanOutcome {
    pub record: AttendanceRecord,
    pub terminal: ScanTerminal,
    pub confidence: Confidence,
    pub reason: String,
    pub warnings: Vec<String>,
}

#[derive(Clone)]
pub struct AttendanceService {
    db: AttendanceDatabase,
    verifier: TokenVerifier,
    ledger: Ledger,
    rules: Arc<AttendanceRules>,
    summaries: SummaryQueue,
    clock: Arc<dyn Clock>,
}

impl AttendanceService {
    pub fn new(
        db: AttendanceDatabase,
        verifier: TokenVerifier,
        ledger: Ledger,
        rules: Arc<AttendanceRules>,
        summaries: SummaryQueue,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            verifier,
            ledger,
            rules,
            summaries,
            clock,
        }
    }

    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Verify, evaluate, consume and record a scan.
    ///
    /// The token is consumed only after every check has passed, including
    /// the integrity of the chain head, so a rejected scan can be retried
    /// with the same token while it is still valid. Once consumed, a retry fails with
    /// [`Error::TokenAlreadyUsedOrExpired`].
    #[instrument(skip(self, request), fields(subject = subject_id))]
    pub async fn register_scan(&self, subject_id: &str, request: ScanRequest) -> Result<ScanOutcome> {
        if subject_id.trim().is_empty() {
            return Err(Error::InvalidRequest("missing subject id".into()));
        }

        let payload = self.verifier.verify(&request.token).await?;
        let terminal = active_terminal(&self.db, &payload.terminal_id).await?;

        let guard = self.ledger.lock(subject_id).await;
        let now = self.clock.now();
        let calendar = self.rules.calendar();
        let date = calendar.date_of(now);

        let head = self.ledger.head(&guard).await?;
        let last = match &head {
            Some(record) => Some(record.punch()?),
            None => None,
        };
        let (start, end) = calendar.day_bounds(date);
        let today = self
            .db
            .records_between(subject_id, start, end)
            .await?
            .iter()
            .map(AttendanceRecord::punch)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let contract = self.db.contract_or_default(subject_id).await?;

        let ctx = ScanContext {
            now,
            last,
            today: &today,
            contract: &contract,
        };
        let decision = self
            .rules
            .evaluate(&ctx, request.declared_type, request.allow_overtime)
            .map_err(|violations| {
                warn!(?violations, "Scan rejected");
                Error::Rejected(violations)
            })?;

        self.verifier.consume(&payload, subject_id).await?;

        let record = self
            .ledger
            .append(
                &guard,
                head.as_ref(),
                NewRecord {
                    subject_id: subject_id.to_string(),
                    terminal_id: terminal.public_id.clone(),
                    kind: decision.kind,
                    client_timestamp: request.client_timestamp,
                    server_timestamp: now,
                    nonce: payload.nonce,
                    latitude: request.geo.map(|g| g.latitude),
                    longitude: request.geo.map(|g| g.longitude),
                    device_info: request.device_info,
                },
            )
            .await?;
        drop(guard);

        self.summaries.enqueue(SummaryJob {
            subject_id: subject_id.to_string(),
            date,
        });

        info!(
            kind = %decision.kind,
            confidence = %decision.confidence,
            terminal = %terminal.public_id,
            "Scan registered"
        );

        Ok(ScanOutcome {
            record,
            terminal: ScanTerminal {
                public_id: terminal.public_id,
                name: terminal.name,
            },
            confidence: decision.confidence,
            reason: decision.reason,
            warnings: decision.warnings,
        })
    }
}

impl std::fmt::Debug for AttendanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttendanceService").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use punchclock_core::{ErrorCode, FixedClock};
    use tokio::sync::mpsc;

    use super::*;
    use crate::state::AppState;
    use crate::token::test_support::NOW;

    fn config() -> punchclock_core::Config {
        let mut config = punchclock_core::Config::default();
        config.tokens.signing_secret = "s".repeat(punchclock_core::config::MIN_SECRET_LEN);
        config
    }

    async fn setup() -> (AppState, FixedClock, mpsc::Receiver<SummaryJob>) {
        let db = AttendanceDatabase::open_in_memory().await.unwrap();
        db.create_terminal("t-int", "t-pub", "Lobby", None, NOW)
            .await
            .unwrap();
        let clock = FixedClock::new(NOW);
        let (state, rx) = AppState::new(db, config(), Arc::new(clock.clone())).unwrap();
        (state, clock, rx)
    }

    async fn token(state: &AppState) -> String {
        state.issuer.issue("t-pub").await.unwrap().token
    }

    fn scan(token: String) -> ScanRequest {
        ScanRequest {
            token,
            ..ScanRequest::default()
        }
    }

    fn rejected_codes(err: Error) -> Vec<ErrorCode> {
        match err {
            Error::Rejected(violations) => violations.iter().map(|v| v.code).collect(),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_scan_records_entry_and_burns_token() {
        let (state, _clock, mut rx) = setup().await;
        let token = token(&state).await;

        let outcome = state
            .attendance
            .register_scan("s1", scan(token.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.record.attendance_kind().unwrap(), AttendanceKind::Entry);
        assert_eq!(outcome.record.seq, 1);
        assert_eq!(outcome.record.terminal_id, "t-pub");
        assert_eq!(outcome.terminal.name, "Lobby");
        assert_eq!(outcome.confidence, Confidence::High);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.subject_id, "s1");

        let err = state
            .attendance
            .register_scan("s1", scan(token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenAlreadyUsedOrExpired));

        let report = state.attendance.ledger().verify_chain("s1").await.unwrap();
        assert!(report.valid);
        assert_eq!(report.checked, 1);
    }

    #[tokio::test]
    async fn rejected_scan_leaves_token_usable() {
        let (state, clock, _rx) = setup().await;
        state
            .attendance
            .register_scan("s1", scan(token(&state).await))
            .await
            .unwrap();

        clock.advance(30);
        let second = token(&state).await;
        let err = state
            .attendance
            .register_scan(
                "s1",
                ScanRequest {
                    declared_type: Some(AttendanceKind::Entry),
                    ..scan(second.clone())
                },
            )
            .await
            .unwrap_err();
        let codes = rejected_codes(err);
        assert!(codes.contains(&ErrorCode::DuplicateRecord));
        assert!(codes.contains(&ErrorCode::SequenceViolation));

        let outcome = state
            .attendance
            .register_scan("s1", scan(second))
            .await
            .unwrap();
        assert_eq!(outcome.record.attendance_kind().unwrap(), AttendanceKind::Exit);
        assert_eq!(outcome.record.seq, 2);
    }

    #[tokio::test]
    async fn scan_outside_hours_is_rejected() {
        let (state, clock, _rx) = setup().await;
        clock.set(NOW + 14 * 3600);
        let err = state
            .attendance
            .register_scan("s1", scan(token(&state).await))
            .await
            .unwrap_err();
        assert_eq!(rejected_codes(err), vec![ErrorCode::OutOfHours]);
        assert!(state.db.latest_record("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tampered_head_rejects_without_spending_token() {
        let (state, clock, _rx) = setup().await;
        let first = state
            .attendance
            .register_scan("s1", scan(token(&state).await))
            .await
            .unwrap();
        sqlx::query("UPDATE attendance_records SET client_timestamp = 1 WHERE id = ?")
            .bind(&first.record.id)
            .execute(state.db.pool())
            .await
            .unwrap();

        clock.advance(3600);
        let issued = state.issuer.issue("t-pub").await.unwrap();
        let err = state
            .attendance
            .register_scan("s1", scan(issued.token.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChainIntegrityViolation(_)));

        assert!(state.nonces.get(&issued.nonce).await.is_some());
        let issuance = state
            .db
            .get_issuance_by_nonce(&issued.nonce)
            .await
            .unwrap()
            .unwrap();
        assert!(!issuance.consumed);
        assert!(state.db.get_consumption(&issued.nonce).await.unwrap().is_none());
        assert_eq!(state.db.chain_records("s1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_terminal_tokens_are_refused() {
        let (state, _clock, _rx) = setup().await;
        let token = token(&state).await;
        state.db.set_terminal_active("t-pub", false, NOW).await.unwrap();

        let err = state
            .attendance
            .register_scan("s1", scan(token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TerminalInactive(_)));
    }

    #[tokio::test]
    async fn expired_token_is_refused() {
        let (state, clock, _rx) = setup().await;
        let token = token(&state).await;
        clock.advance(61);
        let err = state
            .attendance
            .register_scan("s1", scan(token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExpired { .. }));
    }

    #[tokio::test]
    async fn blank_subject_is_invalid() {
        let (state, _clock, _rx) = setup().await;
        let err = state
            .attendance
            .register_scan("  ", scan(token(&state).await))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn concurrent_scans_with_one_token_record_once() {
        let (state, _clock, _rx) = setup().await;
        let token = token(&state).await;

        let a = state.attendance.clone();
        let b = state.attendance.clone();
        let (ta, tb) = (token.clone(), token);
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.register_scan("s1", scan(ta)).await }),
            tokio::spawn(async move { b.register_scan("s2", scan(tb)).await }),
        );
        let results = [ra.unwrap(), rb.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(Error::TokenAlreadyUsedOrExpired)))
        );
    }
}
