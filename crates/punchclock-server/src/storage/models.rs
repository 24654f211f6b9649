//! Data models for Punchclock storage.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use punchclock_core::aggregate::DailySummary;
use punchclock_core::{AttendanceKind, ContractProfile, Punch};

use super::db::DatabaseError;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Terminal {
    /// Internal id. Never leaves the server.
    #[serde(skip_serializing)]
    pub id: String,
    pub public_id: String,
    pub name: String,
    pub location: Option<String>,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenIssuance {
    pub id: i64,
    pub terminal_id: String,
    pub token: String,
    /// Serialized token payload (JSON).
    pub payload: String,
    pub signature: String,
    pub nonce: String,
    pub generated_at: i64,
    pub expires_at: i64,
    pub consumed: bool,
    pub consumed_by: Option<String>,
    pub consumed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TokenConsumption {
    pub id: i64,
    pub terminal_id: String,
    pub nonce: String,
    pub subject_id: String,
    pub consumed_at: i64,
}

/// A stored, hash-chained attendance record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AttendanceRecord {
    pub id: String,
    pub subject_id: String,
    /// Public id of the terminal that was scanned.
    pub terminal_id: String,
    /// `ENTRY` or `EXIT`.
    pub kind: String,
    pub client_timestamp: Option<i64>,
    pub server_timestamp: i64,
    pub nonce: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub device_info: Option<String>,
    pub prev_hash: Option<String>,
    pub record_hash: String,
    /// 1-based position in the subject's chain.
    pub seq: i64,
    pub created_at: i64,
}

impl AttendanceRecord {
    pub fn attendance_kind(&self) -> Result<AttendanceKind, DatabaseError> {
        self.kind
            .parse()
            .map_err(|e: String| DatabaseError::Query(format!("record {}: {e}", self.id)))
    }

    pub fn punch(&self) -> Result<Punch, DatabaseError> {
        Ok(Punch::new(self.attendance_kind()?, self.server_timestamp))
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct DailySummaryRow {
    pub subject_id: String,
    pub date: String,
    pub first_entry: Option<i64>,
    pub last_exit: Option<i64>,
    pub total_minutes: i64,
    pub break_minutes: i64,
    pub worked_minutes: i64,
    pub has_incomplete: bool,
    pub has_extra_hours: bool,
    pub has_violation: bool,
    pub violation_reason: Option<String>,
    pub entry_count: i64,
    pub exit_count: i64,
}

impl TryFrom<DailySummaryRow> for DailySummary {
    type Error = DatabaseError;

    fn try_from(row: DailySummaryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            date: parse_date(&row.date)?,
            subject_id: row.subject_id,
            first_entry: row.first_entry,
            last_exit: row.last_exit,
            total_minutes: row.total_minutes,
            break_minutes: row.break_minutes,
            worked_minutes: row.worked_minutes,
            has_incomplete: row.has_incomplete,
            has_extra_hours: row.has_extra_hours,
            has_violation: row.has_violation,
            violation_reason: row.violation_reason,
            entry_count: row.entry_count,
            exit_count: row.exit_count,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ContractRow {
    pub subject_id: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub total_hours: Option<f64>,
    pub daily_hours: f64,
    pub weekly_hours: f64,
}

impl TryFrom<ContractRow> for ContractProfile {
    type Error = DatabaseError;

    fn try_from(row: ContractRow) -> Result<Self, Self::Error> {
        Ok(Self {
            start_date: row.start_date.as_deref().map(parse_date).transpose()?,
            end_date: row.end_date.as_deref().map(parse_date).transpose()?,
            subject_id: row.subject_id,
            total_hours: row.total_hours,
            daily_hours: row.daily_hours,
            weekly_hours: row.weekly_hours,
        })
    }
}

pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| DatabaseError::Query(format!("invalid stored date {s}: {e}")))
}
