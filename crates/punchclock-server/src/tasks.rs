//! Background tasks owned by the server process.
//!
//! Every task stops when the shared shutdown signal changes. Stopping token
//! rotation only stops new issuance; tokens already shown stay valid until
//! they expire.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use punchclock_core::{Clock, Error};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::nonce::NonceStore;
use crate::storage::AttendanceDatabase;
use crate::summary::{SummaryJob, SummaryService};
use crate::token::TokenIssuer;

/// Issue a fresh token for one terminal every `interval`.
pub fn spawn_token_rotation(
    issuer: TokenIssuer,
    terminal_public_id: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match issuer.issue(&terminal_public_id).await {
                        Ok(issued) => debug!(terminal = %terminal_public_id, expires_at = issued.expires_at, "Token rotated"),
                        Err(e @ (Error::TerminalNotFound(_) | Error::TerminalInactive(_))) => {
                            info!(terminal = %terminal_public_id, reason = %e, "Token rotation stopped");
                            return;
                        }
                        Err(e) => warn!(terminal = %terminal_public_id, error = %e, "Token rotation failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(terminal = %terminal_public_id, "Token rotation shutting down");
                    return;
                }
            }
        }
    })
}

/// Keep one rotation task per active terminal. Terminals registered or
/// re-enabled after startup are picked up on the next pass; tasks for
/// disabled terminals end on their own.
pub fn spawn_rotation_supervisor(
    db: AttendanceDatabase,
    issuer: TokenIssuer,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut running: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut timer = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    running.retain(|_, handle| !handle.is_finished());
                    match db.list_active_terminals().await {
                        Ok(terminals) => {
                            for terminal in terminals {
                                if running.contains_key(&terminal.public_id) {
                                    continue;
                                }
                                info!(terminal = %terminal.public_id, "Starting token rotation");
                                let handle = spawn_token_rotation(
                                    issuer.clone(),
                                    terminal.public_id.clone(),
                                    interval,
                                    shutdown.clone(),
                                );
                                running.insert(terminal.public_id, handle);
                            }
                        }
                        Err(e) => warn!(error = %e, "Listing terminals for rotation failed"),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        for (terminal, handle) in running {
            if let Err(e) = handle.await {
                warn!(terminal = %terminal, error = %e, "Token rotation ended abnormally");
            }
        }
        info!("Token rotation supervisor stopped");
    })
}

/// One cleanup pass: drop unconsumed issuances expired longer than `grace`
/// ago and purge expired nonces.
pub async fn cleanup_once(
    db: &AttendanceDatabase,
    nonces: &dyn NonceStore,
    clock: &dyn Clock,
    grace_secs: i64,
) -> Result<(u64, usize), Error> {
    let issuances = db.delete_expired_issuances(clock.now() - grace_secs).await?;
    let purged = nonces.purge_expired().await;
    Ok((issuances, purged))
}

pub fn spawn_issuance_cleanup(
    db: AttendanceDatabase,
    nonces: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    grace_secs: i64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match cleanup_once(&db, nonces.as_ref(), clock.as_ref(), grace_secs).await {
                        Ok((issuances, purged)) if issuances > 0 || purged > 0 => {
                            info!(issuances, nonces = purged, "Background token cleanup completed");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Background token cleanup failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Token cleanup shutting down");
                    return;
                }
            }
        }
    })
}

/// Process summary jobs until every sender is gone. On shutdown the queue
/// is closed and the jobs already in it are still processed.
pub fn spawn_summary_worker(
    service: SummaryService,
    mut rx: mpsc::Receiver<SummaryJob>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => service.process(&job).await,
                    None => {
                        debug!("Summary queue closed");
                        return;
                    }
                },
                _ = shutdown.changed() => {
                    rx.close();
                    let mut drained = 0usize;
                    while let Some(job) = rx.recv().await {
                        service.process(&job).await;
                        drained += 1;
                    }
                    info!(drained, "Summary worker shutting down");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use punchclock_core::FixedClock;
    use punchclock_core::config::TokenConfig;
    use punchclock_crypto::SigningKey;

    use super::*;
    use crate::nonce::MemoryNonceStore;

    const NOW: i64 = 1_709_542_800;

    struct Setup {
        db: AttendanceDatabase,
        clock: FixedClock,
        nonces: Arc<dyn NonceStore>,
        issuer: TokenIssuer,
    }

    async fn setup() -> Setup {
        let db = AttendanceDatabase::open_in_memory().await.unwrap();
        db.create_terminal("t-int", "t-pub", "Lobby", None, NOW)
            .await
            .unwrap();
        let clock = FixedClock::new(NOW);
        let nonces: Arc<dyn NonceStore> = Arc::new(MemoryNonceStore::new(Arc::new(clock.clone())));
        let issuer = TokenIssuer::new(
            db.clone(),
            SigningKey::new(&[5u8; 32]).unwrap(),
            Arc::clone(&nonces),
            Arc::new(clock.clone()),
            &TokenConfig::default(),
        );
        Setup {
            db,
            clock,
            nonces,
            issuer,
        }
    }

    #[tokio::test]
    async fn cleanup_removes_expired_unconsumed_only() {
        let s = setup().await;
        let stale = s.issuer.issue("t-pub").await.unwrap();
        let used = s.issuer.issue("t-pub").await.unwrap();
        s.db
            .consume_issuance("t-pub", &used.nonce, "s1", NOW + 1)
            .await
            .unwrap();

        s.clock.advance(60 + 3600 + 1);
        let live = s.issuer.issue("t-pub").await.unwrap();

        let (issuances, nonces) = cleanup_once(&s.db, s.nonces.as_ref(), &s.clock, 3600)
            .await
            .unwrap();
        assert_eq!(issuances, 1);
        assert_eq!(nonces, 2);
        assert!(s.db.get_issuance_by_nonce(&stale.nonce).await.unwrap().is_none());
        assert!(s.db.get_issuance_by_nonce(&used.nonce).await.unwrap().is_some());
        assert!(s.db.get_issuance_by_nonce(&live.nonce).await.unwrap().is_some());
        assert!(s.nonces.get(&live.nonce).await.is_some());
    }

    #[tokio::test]
    async fn rotation_issues_until_shutdown() {
        let s = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = spawn_token_rotation(
            s.issuer.clone(),
            "t-pub".into(),
            Duration::from_millis(10),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let issued = s.db.count_issuances("t-int").await.unwrap();
        assert!(issued >= 2, "issued {issued}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(s.db.count_issuances("t-int").await.unwrap(), issued);
    }

    #[tokio::test]
    async fn rotation_stops_for_disabled_terminal() {
        let s = setup().await;
        s.db.set_terminal_active("t-pub", false, NOW).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let handle = spawn_token_rotation(s.issuer, "t-pub".into(), Duration::from_millis(5), rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn supervisor_picks_up_new_terminals() {
        let s = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = spawn_rotation_supervisor(
            s.db.clone(),
            s.issuer.clone(),
            Duration::from_millis(10),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        s.db.create_terminal("t2-int", "t2-pub", "Dock", None, NOW)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(s.db.count_issuances("t-int").await.unwrap() >= 1);
        assert!(s.db.count_issuances("t2-int").await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn summary_worker_drains_queue_on_shutdown() {
        use chrono::NaiveDate;

        use crate::summary::SummaryQueue;

        let s = setup().await;
        let service = SummaryService::new(
            s.db.clone(),
            punchclock_core::config::RulesConfig::default(),
            punchclock_core::LocalCalendar::utc(),
            Arc::new(s.clock.clone()),
        );
        let (queue, rx) = SummaryQueue::channel();
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();
        for subject in ["s1", "s2", "s3"] {
            queue.enqueue(SummaryJob {
                subject_id: subject.into(),
                date,
            });
        }

        let handle = spawn_summary_worker(service, rx, shutdown);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        for subject in ["s1", "s2", "s3"] {
            assert!(s.db.get_daily_summary(subject, date).await.unwrap().is_some());
        }
        drop(queue);
    }

    #[tokio::test]
    async fn cleanup_task_stops_on_shutdown() {
        let s = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = spawn_issuance_cleanup(
            s.db,
            s.nonces,
            Arc::new(s.clock),
            Duration::from_secs(3600),
            3600,
            rx,
        );
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
