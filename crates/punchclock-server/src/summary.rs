//! Daily summary maintenance and period rollups.

use std::sync::Arc;

use chrono::NaiveDate;
use punchclock_core::aggregate::{
    self, ContractProgress, DailySummary, Period, PeriodSummary, summarize_day,
};
use punchclock_core::config::RulesConfig;
use punchclock_core::{Clock, Error, LocalCalendar, Result};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::storage::{AttendanceDatabase, AttendanceRecord};

/// Recompute one subject-day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryJob {
    pub subject_id: String,
    pub date: NaiveDate,
}

/// Queue capacity for pending recomputations.
pub const SUMMARY_QUEUE_CAPACITY: usize = 1024;

/// Sending half handed to the scan path.
#[derive(Debug, Clone)]
pub struct SummaryQueue {
    tx: mpsc::Sender<SummaryJob>,
}

impl SummaryQueue {
    pub fn channel() -> (Self, mpsc::Receiver<SummaryJob>) {
        let (tx, rx) = mpsc::channel(SUMMARY_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Never blocks. A dropped job only delays the summary until the next
    /// scan or read of that day.
    pub fn enqueue(&self, job: SummaryJob) {
        if let Err(e) = self.tx.try_send(job) {
            warn!(error = %e, "Summary job dropped");
        }
    }
}

#[derive(Clone)]
pub struct SummaryService {
    db: AttendanceDatabase,
    rules: RulesConfig,
    calendar: LocalCalendar,
    clock: Arc<dyn Clock>,
}

impl SummaryService {
    pub fn new(
        db: AttendanceDatabase,
        rules: RulesConfig,
        calendar: LocalCalendar,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            rules,
            calendar,
            clock,
        }
    }

    /// Rebuild and store the summary of one local day from its records.
    #[instrument(skip(self))]
    pub async fn recompute(&self, subject_id: &str, date: NaiveDate) -> Result<DailySummary> {
        let (start, end) = self.calendar.day_bounds(date);
        let punches = self
            .db
            .records_between(subject_id, start, end)
            .await?
            .iter()
            .map(AttendanceRecord::punch)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let contract = self.db.contract_or_default(subject_id).await?;

        let summary = summarize_day(subject_id, date, &punches, &contract, &self.rules);
        self.db.upsert_daily_summary(&summary, self.clock.now()).await?;
        debug!(worked = summary.worked_minutes, violation = summary.has_violation, "Summary stored");
        Ok(summary)
    }

    /// Stored summary, recomputed when missing or when the day has gained
    /// records since it was stored.
    pub async fn daily(&self, subject_id: &str, date: NaiveDate) -> Result<DailySummary> {
        let Some(summary) = self.db.get_daily_summary(subject_id, date).await? else {
            return self.recompute(subject_id, date).await;
        };
        let (start, end) = self.calendar.day_bounds(date);
        let records = self.db.count_records_between(subject_id, start, end).await?;
        if records == summary.entry_count + summary.exit_count {
            Ok(summary)
        } else {
            debug!(stored = summary.entry_count + summary.exit_count, records, "Stale summary");
            self.recompute(subject_id, date).await
        }
    }

    /// Monday-to-Sunday week containing `date`.
    pub async fn week(&self, subject_id: &str, date: NaiveDate) -> Result<PeriodSummary> {
        let (start, end) = aggregate::week_range(date);
        self.period(subject_id, Period::Week, start, end).await
    }

    pub async fn month(&self, subject_id: &str, year: i32, month: u32) -> Result<PeriodSummary> {
        let (start, end) = aggregate::month_range(year, month)
            .ok_or_else(|| Error::InvalidRequest(format!("invalid month {year}-{month}")))?;
        self.period(subject_id, Period::Month, start, end).await
    }

    async fn period(
        &self,
        subject_id: &str,
        period: Period,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PeriodSummary> {
        let days = self
            .db
            .summaries_between(subject_id, Some(start), Some(end))
            .await?;
        let contract = self.db.contract_or_default(subject_id).await?;
        Ok(aggregate::rollup(subject_id, period, start, end, &days, &contract))
    }

    /// Progress towards the subject's contract total as of today.
    pub async fn contract(&self, subject_id: &str) -> Result<ContractProgress> {
        let contract = self.db.contract_or_default(subject_id).await?;
        let today = self.calendar.date_of(self.clock.now());
        let days = self
            .db
            .summaries_between(subject_id, contract.start_date, Some(today))
            .await?;
        Ok(aggregate::contract_progress(&contract, &days, today))
    }

    pub async fn process(&self, job: &SummaryJob) {
        if let Err(e) = self.recompute(&job.subject_id, job.date).await {
            warn!(subject = %job.subject_id, date = %job.date, error = %e, "Summary recomputation failed");
        }
    }

    /// Drain jobs until every sender is gone.
    pub async fn run_worker(&self, mut rx: mpsc::Receiver<SummaryJob>) {
        while let Some(job) = rx.recv().await {
            self.process(&job).await;
        }
    }
}

impl std::fmt::Debug for SummaryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryService")
            .field("calendar", &self.calendar)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use punchclock_core::{AttendanceKind, ContractProfile, FixedClock};

    use super::*;
    use crate::ledger::{Ledger, NewRecord};

    /// Monday 2024-03-04 00:00 UTC.
    const MONDAY: i64 = 1_709_510_400;

    fn at(h: i64, m: i64) -> i64 {
        MONDAY + h * 3600 + m * 60
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    async fn setup() -> (AttendanceDatabase, Ledger, SummaryService) {
        let db = AttendanceDatabase::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(at(20, 0)));
        let ledger = Ledger::new(db.clone(), Arc::clone(&clock));
        let service = SummaryService::new(
            db.clone(),
            RulesConfig::default(),
            LocalCalendar::utc(),
            clock,
        );
        (db, ledger, service)
    }

    async fn punch(ledger: &Ledger, kind: AttendanceKind, ts: i64) {
        ledger
            .append_record(NewRecord {
                subject_id: "s1".into(),
                terminal_id: "t-pub".into(),
                kind,
                client_timestamp: None,
                server_timestamp: ts,
                nonce: format!("n-{ts}"),
                latitude: None,
                longitude: None,
                device_info: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recompute_flags_excess_over_contract() {
        let (db, ledger, service) = setup().await;
        let mut contract = ContractProfile::standard("s1");
        contract.daily_hours = 6.0;
        db.upsert_contract(&contract).await.unwrap();

        punch(&ledger, AttendanceKind::Entry, at(8, 0)).await;
        punch(&ledger, AttendanceKind::Exit, at(12, 0)).await;
        punch(&ledger, AttendanceKind::Entry, at(12, 40)).await;
        punch(&ledger, AttendanceKind::Exit, at(16, 0)).await;

        let summary = service.recompute("s1", monday()).await.unwrap();
        assert_eq!(summary.worked_minutes, 7 * 60 + 20);
        assert_eq!(summary.break_minutes, 40);
        assert!(summary.has_violation);
        assert!(summary.violation_reason.unwrap().contains("exceeds daily limit"));

        let stored = db.get_daily_summary("s1", monday()).await.unwrap().unwrap();
        assert_eq!(stored.worked_minutes, 440);
    }

    #[tokio::test]
    async fn week_and_month_roll_up_stored_days() {
        let (_, ledger, service) = setup().await;
        punch(&ledger, AttendanceKind::Entry, at(8, 0)).await;
        punch(&ledger, AttendanceKind::Exit, at(16, 0)).await;
        service.recompute("s1", monday()).await.unwrap();

        let week = service.week("s1", monday().succ_opt().unwrap()).await.unwrap();
        assert_eq!(week.worked_minutes, 480);
        assert_eq!(week.days_worked, 1);
        assert!(!week.exceeds_weekly_limit);

        let month = service.month("s1", 2024, 3).await.unwrap();
        assert_eq!(month.worked_minutes, 480);
        assert!(matches!(
            service.month("s1", 2024, 13).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn daily_computes_missing_day() {
        let (db, ledger, service) = setup().await;
        punch(&ledger, AttendanceKind::Entry, at(9, 0)).await;

        assert!(db.get_daily_summary("s1", monday()).await.unwrap().is_none());
        let summary = service.daily("s1", monday()).await.unwrap();
        assert!(summary.has_incomplete);
        assert!(db.get_daily_summary("s1", monday()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn daily_heals_summary_missing_later_records() {
        let (_, ledger, service) = setup().await;
        punch(&ledger, AttendanceKind::Entry, at(8, 0)).await;
        let partial = service.recompute("s1", monday()).await.unwrap();
        assert!(partial.has_incomplete);

        punch(&ledger, AttendanceKind::Exit, at(16, 0)).await;
        let summary = service.daily("s1", monday()).await.unwrap();
        assert_eq!(summary.worked_minutes, 480);
        assert!(!summary.has_incomplete);
        assert_eq!(summary.exit_count, 1);
    }

    #[tokio::test]
    async fn worker_drains_queue_until_closed() {
        let (db, ledger, service) = setup().await;
        punch(&ledger, AttendanceKind::Entry, at(8, 0)).await;
        punch(&ledger, AttendanceKind::Exit, at(12, 0)).await;

        let (queue, rx) = SummaryQueue::channel();
        queue.enqueue(SummaryJob {
            subject_id: "s1".into(),
            date: monday(),
        });
        drop(queue);
        service.run_worker(rx).await;

        let stored = db.get_daily_summary("s1", monday()).await.unwrap().unwrap();
        assert_eq!(stored.worked_minutes, 240);
    }
}
