//! Tamper-evident attendance ledger.
//!
//! Each subject has its own hash chain. A record's hash covers its
//! identifying fields and the hash of the subject's previous record, so
//! editing, deleting or reordering any stored record breaks verification
//! from that point on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use punchclock_core::{AttendanceKind, Clock, Error, Result};
use punchclock_crypto::canonical_digest;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};

use crate::storage::{AttendanceDatabase, AttendanceRecord};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// Per-subject append locks. An entry lives only while some task holds or
/// waits for that subject's lock.
#[derive(Default)]
pub struct ChainLocks {
    locks: Arc<StdMutex<LockMap>>,
}

/// Exclusive right to extend one subject's chain.
pub struct ChainGuard {
    subject_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    locks: Arc<StdMutex<LockMap>>,
}

impl ChainGuard {
    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here: nobody else is waiting.
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.subject_id);
        }
    }
}

impl ChainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, subject_id: &str) -> ChainGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(subject_id.to_string()).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        ChainGuard {
            subject_id: subject_id.to_string(),
            guard: Some(guard),
            lock,
            locks: Arc::clone(&self.locks),
        }
    }

    /// Subjects currently locked or waited on.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Input for a new ledger record. Chain fields are filled in on append.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub subject_id: String,
    pub terminal_id: String,
    pub kind: AttendanceKind,
    pub client_timestamp: Option<i64>,
    pub server_timestamp: i64,
    pub nonce: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub device_info: Option<String>,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    id: &'a str,
    subject_id: &'a str,
    terminal_id: &'a str,
    kind: &'a str,
    client_timestamp: Option<i64>,
    server_timestamp: i64,
    nonce: &'a str,
    prev_hash: Option<&'a str>,
}

/// SHA-256 (hex) over the canonical JSON of the record's hashed fields.
pub fn compute_record_hash(record: &AttendanceRecord) -> Result<String> {
    canonical_digest(&HashedFields {
        id: &record.id,
        subject_id: &record.subject_id,
        terminal_id: &record.terminal_id,
        kind: &record.kind,
        client_timestamp: record.client_timestamp,
        server_timestamp: record.server_timestamp,
        nonce: &record.nonce,
        prev_hash: record.prev_hash.as_deref(),
    })
    .map_err(|e| Error::ChainIntegrityViolation(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainErrorKind {
    /// Stored hash differs from the recomputed one.
    HashMismatch,
    /// `prev_hash` does not match the preceding record.
    BrokenLink,
    /// Sequence numbers skip or repeat.
    SequenceGap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainError {
    pub record_id: String,
    pub seq: i64,
    pub kind: ChainErrorKind,
}

/// Result of walking a subject's chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub subject_id: String,
    pub valid: bool,
    pub checked: usize,
    pub head_hash: Option<String>,
    pub errors: Vec<ChainError>,
}

#[derive(Clone)]
pub struct Ledger {
    db: AttendanceDatabase,
    locks: Arc<ChainLocks>,
    clock: Arc<dyn Clock>,
}

impl Ledger {
    pub fn new(db: AttendanceDatabase, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            locks: Arc::new(ChainLocks::new()),
            clock,
        }
    }

    /// Take the subject's append lock. Hold it across everything that reads
    /// the chain head and then extends it.
    pub async fn lock(&self, subject_id: &str) -> ChainGuard {
        self.locks.lock(subject_id).await
    }

    /// Current head of the subject's chain, checked against its stored hash.
    ///
    /// Call before anything irreversible happens for the scan: a tampered
    /// head fails here with [`Error::ChainIntegrityViolation`].
    pub async fn head(&self, guard: &ChainGuard) -> Result<Option<AttendanceRecord>> {
        let head = self.db.latest_record(guard.subject_id()).await?;
        if let Some(head) = &head {
            if compute_record_hash(head)? != head.record_hash {
                error!(record = %head.id, seq = head.seq, "Chain head hash mismatch");
                return Err(Error::ChainIntegrityViolation(format!(
                    "head record {} does not match its hash",
                    head.id
                )));
            }
        }
        Ok(head)
    }

    /// Append after `head`, which must come from [`Ledger::head`] under the
    /// same guard.
    #[instrument(skip_all, fields(subject = %guard.subject_id()))]
    pub async fn append(
        &self,
        guard: &ChainGuard,
        head: Option<&AttendanceRecord>,
        new: NewRecord,
    ) -> Result<AttendanceRecord> {
        if guard.subject_id() != new.subject_id
            || head.is_some_and(|h| h.subject_id != new.subject_id)
        {
            return Err(Error::InvalidRequest(format!(
                "chain lock held for {} but record is for {}",
                guard.subject_id(),
                new.subject_id
            )));
        }

        let mut record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            subject_id: new.subject_id,
            terminal_id: new.terminal_id,
            kind: new.kind.as_str().to_string(),
            client_timestamp: new.client_timestamp,
            server_timestamp: new.server_timestamp,
            nonce: new.nonce,
            latitude: new.latitude,
            longitude: new.longitude,
            device_info: new.device_info,
            prev_hash: head.map(|h| h.record_hash.clone()),
            record_hash: String::new(),
            seq: head.map_or(1, |h| h.seq + 1),
            created_at: self.clock.now(),
        };
        record.record_hash = compute_record_hash(&record)?;

        self.db.insert_record(&record).await?;
        info!(record = %record.id, seq = record.seq, kind = %record.kind, "Attendance recorded");
        Ok(record)
    }

    /// Lock, append, unlock.
    pub async fn append_record(&self, new: NewRecord) -> Result<AttendanceRecord> {
        let guard = self.lock(&new.subject_id).await;
        let head = self.head(&guard).await?;
        self.append(&guard, head.as_ref(), new).await
    }

    /// Walk the subject's chain and report every inconsistency. Never
    /// repairs anything.
    #[instrument(skip(self))]
    pub async fn verify_chain(&self, subject_id: &str) -> Result<ChainReport> {
        let records = self.db.chain_records(subject_id).await?;
        let mut errors = Vec::new();
        let mut expected_prev: Option<&str> = None;
        let mut expected_seq = 1;

        for record in &records {
            let mut flag = |kind| {
                errors.push(ChainError {
                    record_id: record.id.clone(),
                    seq: record.seq,
                    kind,
                });
            };
            if record.seq != expected_seq {
                flag(ChainErrorKind::SequenceGap);
            }
            if record.prev_hash.as_deref() != expected_prev {
                flag(ChainErrorKind::BrokenLink);
            }
            if compute_record_hash(record)? != record.record_hash {
                flag(ChainErrorKind::HashMismatch);
            }
            expected_prev = Some(&record.record_hash);
            expected_seq = record.seq + 1;
        }

        if !errors.is_empty() {
            warn!(subject = subject_id, errors = errors.len(), "Chain verification failed");
        }

        Ok(ChainReport {
            subject_id: subject_id.to_string(),
            valid: errors.is_empty(),
            checked: records.len(),
            head_hash: records.last().map(|r| r.record_hash.clone()),
            errors,
        })
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use punchclock_core::FixedClock;

    use super::*;

    const NOW: i64 = 1_709_542_800;

    async fn ledger() -> (AttendanceDatabase, Ledger) {
        let db = AttendanceDatabase::open_in_memory().await.unwrap();
        let ledger = Ledger::new(db.clone(), Arc::new(FixedClock::new(NOW)));
        (db, ledger)
    }

    fn new_record(subject: &str, kind: AttendanceKind, at: i64) -> NewRecord {
        NewRecord {
            subject_id: subject.into(),
            terminal_id: "t-pub".into(),
            kind,
            client_timestamp: Some(at - 1),
            server_timestamp: at,
            nonce: format!("{subject}-{at}"),
            latitude: None,
            longitude: None,
            device_info: None,
        }
    }

    async fn build_chain(ledger: &Ledger, subject: &str, n: i64) -> Vec<AttendanceRecord> {
        let mut out = Vec::new();
        for i in 0..n {
            let kind = if i % 2 == 0 {
                AttendanceKind::Entry
            } else {
                AttendanceKind::Exit
            };
            out.push(ledger.append_record(new_record(subject, kind, NOW + i * 3600)).await.unwrap());
        }
        out
    }

    async fn tamper(db: &AttendanceDatabase, sql: &str, id: &str) {
        sqlx::query(sql).bind(id).execute(db.pool()).await.unwrap();
    }

    #[tokio::test]
    async fn records_link_to_predecessor() {
        let (_, ledger) = ledger().await;
        let records = build_chain(&ledger, "s1", 3).await;

        assert_eq!(records[0].prev_hash, None);
        assert_eq!(records[0].seq, 1);
        assert_eq!(records[1].prev_hash.as_deref(), Some(records[0].record_hash.as_str()));
        assert_eq!(records[2].prev_hash.as_deref(), Some(records[1].record_hash.as_str()));
        for record in &records {
            assert_eq!(compute_record_hash(record).unwrap(), record.record_hash);
        }
    }

    #[tokio::test]
    async fn chains_are_per_subject() {
        let (_, ledger) = ledger().await;
        build_chain(&ledger, "s1", 2).await;
        let other = build_chain(&ledger, "s2", 1).await;
        assert_eq!(other[0].prev_hash, None);
        assert_eq!(other[0].seq, 1);
    }

    #[tokio::test]
    async fn untouched_chain_is_valid() {
        let (_, ledger) = ledger().await;
        let records = build_chain(&ledger, "s1", 4).await;
        let report = ledger.verify_chain("s1").await.unwrap();
        assert!(report.valid);
        assert_eq!(report.checked, 4);
        assert_eq!(report.head_hash.as_deref(), Some(records[3].record_hash.as_str()));

        let empty = ledger.verify_chain("nobody").await.unwrap();
        assert!(empty.valid);
        assert_eq!(empty.checked, 0);
    }

    #[tokio::test]
    async fn field_tampering_is_reported_at_the_record() {
        let (db, ledger) = ledger().await;
        let records = build_chain(&ledger, "s1", 4).await;
        tamper(
            &db,
            "UPDATE attendance_records SET server_timestamp = server_timestamp + 60 WHERE id = ?",
            &records[1].id,
        )
        .await;

        let report = ledger.verify_chain("s1").await.unwrap();
        assert!(!report.valid);
        assert_eq!(
            report.errors,
            vec![ChainError {
                record_id: records[1].id.clone(),
                seq: 2,
                kind: ChainErrorKind::HashMismatch,
            }]
        );
    }

    #[tokio::test]
    async fn deletion_breaks_the_next_link() {
        let (db, ledger) = ledger().await;
        let records = build_chain(&ledger, "s1", 4).await;
        tamper(&db, "DELETE FROM attendance_records WHERE id = ?", &records[1].id).await;

        let report = ledger.verify_chain("s1").await.unwrap();
        assert!(!report.valid);
        assert!(report.errors.iter().all(|e| e.record_id == records[2].id));
        assert!(report.errors.iter().any(|e| e.kind == ChainErrorKind::BrokenLink));
        assert!(report.errors.iter().any(|e| e.kind == ChainErrorKind::SequenceGap));
    }

    #[tokio::test]
    async fn reordering_is_detected() {
        let (db, ledger) = ledger().await;
        let records = build_chain(&ledger, "s1", 3).await;
        tamper(&db, "UPDATE attendance_records SET seq = 99 WHERE id = ?", &records[0].id).await;
        tamper(&db, "UPDATE attendance_records SET seq = 1 WHERE id = ?", &records[1].id).await;
        tamper(&db, "UPDATE attendance_records SET seq = 2 WHERE id = ?", &records[0].id).await;

        let report = ledger.verify_chain("s1").await.unwrap();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.kind == ChainErrorKind::BrokenLink));
    }

    #[tokio::test]
    async fn tampered_head_blocks_append() {
        let (db, ledger) = ledger().await;
        let records = build_chain(&ledger, "s1", 2).await;
        tamper(
            &db,
            "UPDATE attendance_records SET kind = 'ENTRY' WHERE id = ?",
            &records[1].id,
        )
        .await;

        let result = ledger
            .append_record(new_record("s1", AttendanceKind::Entry, NOW + 9000))
            .await;
        assert!(matches!(result, Err(Error::ChainIntegrityViolation(_))));
    }

    #[tokio::test]
    async fn head_is_checked_before_append() {
        let (db, ledger) = ledger().await;
        let records = build_chain(&ledger, "s1", 1).await;

        let guard = ledger.lock("s1").await;
        let head = ledger.head(&guard).await.unwrap().unwrap();
        assert_eq!(head.id, records[0].id);
        drop(guard);

        tamper(
            &db,
            "UPDATE attendance_records SET client_timestamp = 0 WHERE id = ?",
            &records[0].id,
        )
        .await;
        let guard = ledger.lock("s1").await;
        assert!(matches!(
            ledger.head(&guard).await,
            Err(Error::ChainIntegrityViolation(_))
        ));
    }

    #[tokio::test]
    async fn released_locks_are_pruned() {
        let (_, ledger) = ledger().await;
        let first = ledger.lock("s1").await;
        let other = ledger.lock("s2").await;
        assert_eq!(ledger.locks.tracked(), 2);

        let waiter = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let _guard = ledger.lock("s1").await;
            })
        };
        tokio::task::yield_now().await;
        drop(first);
        waiter.await.unwrap();
        drop(other);
        assert_eq!(ledger.locks.tracked(), 0);

        build_chain(&ledger, "s3", 2).await;
        assert_eq!(ledger.locks.tracked(), 0);
    }

    #[tokio::test]
    async fn guard_must_match_subject() {
        let (_, ledger) = ledger().await;
        let guard = ledger.lock("s1").await;
        let result = ledger
            .append(&guard, None, new_record("s2", AttendanceKind::Entry, NOW))
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_the_chain_linear() {
        let (_, ledger) = ledger().await;
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .append_record(new_record("s1", AttendanceKind::Entry, NOW + i))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let report = ledger.verify_chain("s1").await.unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert_eq!(report.checked, 10);
    }
}
