//! Attendance record, summary and contract queries.

use chrono::NaiveDate;
use punchclock_core::ContractProfile;
use punchclock_core::aggregate::DailySummary;

use super::db::{AttendanceDatabase, DatabaseError};
use super::models::{AttendanceRecord, ContractRow, DailySummaryRow};

const DATE_FORMAT: &str = "%Y-%m-%d";

impl AttendanceDatabase {
    // =========================================================================
    // Attendance record queries
    // =========================================================================

    /// Head of a subject's chain.
    pub async fn latest_record(
        &self,
        subject_id: &str,
    ) -> Result<Option<AttendanceRecord>, DatabaseError> {
        let record = sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE subject_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(subject_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(record)
    }

    pub async fn insert_record(&self, record: &AttendanceRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO attendance_records (id, subject_id, terminal_id, kind, client_timestamp, server_timestamp, nonce, latitude, longitude, device_info, prev_hash, record_hash, seq, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.subject_id)
        .bind(&record.terminal_id)
        .bind(&record.kind)
        .bind(record.client_timestamp)
        .bind(record.server_timestamp)
        .bind(&record.nonce)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(&record.device_info)
        .bind(&record.prev_hash)
        .bind(&record.record_hash)
        .bind(record.seq)
        .bind(record.created_at)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_record(&self, id: &str) -> Result<Option<AttendanceRecord>, DatabaseError> {
        let record =
            sqlx::query_as::<_, AttendanceRecord>("SELECT * FROM attendance_records WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool())
                .await?;

        Ok(record)
    }

    /// Every record of a subject in chain order.
    pub async fn chain_records(
        &self,
        subject_id: &str,
    ) -> Result<Vec<AttendanceRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE subject_id = ? ORDER BY seq ASC",
        )
        .bind(subject_id)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    /// Records of a subject with `start <= server_timestamp < end`, oldest
    /// first.
    pub async fn records_between(
        &self,
        subject_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<AttendanceRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, AttendanceRecord>(
            "SELECT * FROM attendance_records WHERE subject_id = ? AND server_timestamp >= ? AND server_timestamp < ? ORDER BY server_timestamp ASC, seq ASC",
        )
        .bind(subject_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await?;

        Ok(records)
    }

    pub async fn count_records_between(
        &self,
        subject_id: &str,
        start: i64,
        end: i64,
    ) -> Result<i64, DatabaseError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM attendance_records WHERE subject_id = ? AND server_timestamp >= ? AND server_timestamp < ?",
        )
        .bind(subject_id)
        .bind(start)
        .bind(end)
        .fetch_one(self.pool())
        .await?;

        Ok(count.0)
    }

    // =========================================================================
    // Daily summary queries
    // =========================================================================

    /// Insert or replace the summary for (subject, date).
    pub async fn upsert_daily_summary(
        &self,
        summary: &DailySummary,
        now: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO daily_summaries (subject_id, date, first_entry, last_exit, total_minutes, break_minutes, worked_minutes, has_incomplete, has_extra_hours, has_violation, violation_reason, entry_count, exit_count, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(subject_id, date) DO UPDATE SET \
             first_entry = excluded.first_entry, last_exit = excluded.last_exit, \
             total_minutes = excluded.total_minutes, break_minutes = excluded.break_minutes, \
             worked_minutes = excluded.worked_minutes, has_incomplete = excluded.has_incomplete, \
             has_extra_hours = excluded.has_extra_hours, has_violation = excluded.has_violation, \
             violation_reason = excluded.violation_reason, entry_count = excluded.entry_count, \
             exit_count = excluded.exit_count, updated_at = excluded.updated_at",
        )
        .bind(&summary.subject_id)
        .bind(summary.date.format(DATE_FORMAT).to_string())
        .bind(summary.first_entry)
        .bind(summary.last_exit)
        .bind(summary.total_minutes)
        .bind(summary.break_minutes)
        .bind(summary.worked_minutes)
        .bind(summary.has_incomplete)
        .bind(summary.has_extra_hours)
        .bind(summary.has_violation)
        .bind(&summary.violation_reason)
        .bind(summary.entry_count)
        .bind(summary.exit_count)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_daily_summary(
        &self,
        subject_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailySummary>, DatabaseError> {
        sqlx::query_as::<_, DailySummaryRow>(
            "SELECT * FROM daily_summaries WHERE subject_id = ? AND date = ?",
        )
        .bind(subject_id)
        .bind(date.format(DATE_FORMAT).to_string())
        .fetch_optional(self.pool())
        .await?
        .map(DailySummary::try_from)
        .transpose()
    }

    /// Summaries for `start..=end`, oldest first. Pass `None` for an open
    /// upper bound.
    pub async fn summaries_between(
        &self,
        subject_id: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<DailySummary>, DatabaseError> {
        // ISO dates compare correctly as text.
        let start = start.map_or_else(String::new, |d| d.format(DATE_FORMAT).to_string());
        let end = end.map_or_else(|| "9999-12-31".to_string(), |d| d.format(DATE_FORMAT).to_string());

        let rows = sqlx::query_as::<_, DailySummaryRow>(
            "SELECT * FROM daily_summaries WHERE subject_id = ? AND date >= ? AND date <= ? ORDER BY date ASC",
        )
        .bind(subject_id)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(DailySummary::try_from).collect()
    }

    // =========================================================================
    // Contract profile queries
    // =========================================================================

    pub async fn get_contract(
        &self,
        subject_id: &str,
    ) -> Result<Option<ContractProfile>, DatabaseError> {
        sqlx::query_as::<_, ContractRow>("SELECT * FROM contract_profiles WHERE subject_id = ?")
            .bind(subject_id)
            .fetch_optional(self.pool())
            .await?
            .map(ContractProfile::try_from)
            .transpose()
    }

    /// Stored contract, or the standard profile when none exists.
    pub async fn contract_or_default(
        &self,
        subject_id: &str,
    ) -> Result<ContractProfile, DatabaseError> {
        Ok(self
            .get_contract(subject_id)
            .await?
            .unwrap_or_else(|| ContractProfile::standard(subject_id)))
    }

    pub async fn upsert_contract(&self, contract: &ContractProfile) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO contract_profiles (subject_id, start_date, end_date, total_hours, daily_hours, weekly_hours) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(subject_id) DO UPDATE SET \
             start_date = excluded.start_date, end_date = excluded.end_date, \
             total_hours = excluded.total_hours, daily_hours = excluded.daily_hours, \
             weekly_hours = excluded.weekly_hours",
        )
        .bind(&contract.subject_id)
        .bind(contract.start_date.map(|d| d.format(DATE_FORMAT).to_string()))
        .bind(contract.end_date.map(|d| d.format(DATE_FORMAT).to_string()))
        .bind(contract.total_hours)
        .bind(contract.daily_hours)
        .bind(contract.weekly_hours)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}
