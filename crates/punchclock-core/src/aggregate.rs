//! Work-hours aggregation.
//!
//! Turns a day's ENTRY/EXIT punches into worked and break minutes, flags
//! incomplete or rule-violating days, and rolls daily summaries up into
//! weekly, monthly and contract-level views.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::config::RulesConfig;
use crate::types::{AttendanceKind, ContractProfile, Punch};

/// One complete ENTRY→EXIT interval (Unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkPair {
    pub entry: i64,
    pub exit: i64,
}

impl WorkPair {
    pub const fn seconds(&self) -> i64 {
        self.exit - self.entry
    }
}

/// Result of pairing a day's punches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pairing {
    pub pairs: Vec<WorkPair>,
    /// Trailing ENTRY with no EXIT yet.
    pub open_entry: Option<i64>,
    /// EXITs with no preceding ENTRY (e.g. the day started with an EXIT).
    pub stray_exits: usize,
}

/// Pair punches in time order. A second ENTRY while one is open replaces it;
/// the ledger's alternation check keeps that from happening in practice.
pub fn pair_punches(punches: &[Punch]) -> Pairing {
    let mut sorted = punches.to_vec();
    sorted.sort_by_key(|p| p.at);

    let mut pairing = Pairing::default();
    for punch in sorted {
        match punch.kind {
            AttendanceKind::Entry => pairing.open_entry = Some(punch.at),
            AttendanceKind::Exit => match pairing.open_entry.take() {
                Some(entry) => pairing.pairs.push(WorkPair {
                    entry,
                    exit: punch.at,
                }),
                None => pairing.stray_exits += 1,
            },
        }
    }
    pairing
}

/// Minutes worked in `punches`, counting an open entry up to `until`.
pub fn worked_minutes_until(punches: &[Punch], until: i64) -> i64 {
    let pairing = pair_punches(punches);
    let closed: i64 = pairing.pairs.iter().map(WorkPair::seconds).sum();
    let open = pairing.open_entry.map_or(0, |entry| (until - entry).max(0));
    (closed + open) / 60
}

/// Aggregated work time and flags for one subject-day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub subject_id: String,
    pub date: NaiveDate,
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

/// Summarize one day of punches against the subject's contract.
pub fn summarize_day(
    subject_id: &str,
    date: NaiveDate,
    punches: &[Punch],
    contract: &ContractProfile,
    rules: &RulesConfig,
) -> DailySummary {
    let pairing = pair_punches(punches);

    let worked_secs: i64 = pairing.pairs.iter().map(WorkPair::seconds).sum();
    let break_secs: i64 = pairing
        .pairs
        .windows(2)
        .map(|w| (w[1].entry - w[0].exit).max(0))
        .sum();

    let first_entry = punches
        .iter()
        .filter(|p| p.kind == AttendanceKind::Entry)
        .map(|p| p.at)
        .min();
    let last_exit = punches
        .iter()
        .filter(|p| p.kind == AttendanceKind::Exit)
        .map(|p| p.at)
        .max();
    let total_secs = match (first_entry, last_exit) {
        (Some(first), Some(last)) if last > first => last - first,
        _ => 0,
    };

    let worked_minutes = worked_secs / 60;
    let break_minutes = break_secs / 60;
    let limit = contract.daily_limit_minutes();
    let has_incomplete = pairing.open_entry.is_some();

    let mut reasons = Vec::new();
    if worked_minutes > limit + rules.daily_tolerance_minutes {
        reasons.push(format!(
            "exceeds daily limit of {} by {} min",
            format_minutes(limit),
            worked_minutes - limit
        ));
    }
    if worked_minutes > rules.break_required_after_minutes
        && break_minutes < rules.min_break_minutes
    {
        reasons.push(format!(
            "missing mandated {} min break after {}",
            rules.min_break_minutes,
            format_minutes(rules.break_required_after_minutes)
        ));
    }
    if has_incomplete {
        reasons.push("incomplete entry/exit pair".to_string());
    }

    let count = |kind: AttendanceKind| -> i64 {
        punches
            .iter()
            .filter(|p| p.kind == kind)
            .count()
            .try_into()
            .unwrap_or(i64::MAX)
    };

    DailySummary {
        subject_id: subject_id.to_string(),
        date,
        first_entry,
        last_exit,
        total_minutes: total_secs / 60,
        break_minutes,
        worked_minutes,
        has_incomplete,
        has_extra_hours: worked_minutes > limit,
        has_violation: !reasons.is_empty(),
        violation_reason: (!reasons.is_empty()).then(|| reasons.join("; ")),
        entry_count: count(AttendanceKind::Entry),
        exit_count: count(AttendanceKind::Exit),
    }
}

/// Render minutes as `7h20m`.
pub fn format_minutes(minutes: i64) -> String {
    let (h, m) = (minutes / 60, minutes % 60);
    if m == 0 {
        format!("{h}h")
    } else {
        format!("{h}h{m:02}m")
    }
}

/// Granularity of a rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Week,
    Month,
    Contract,
}

/// Sum of daily summaries over an inclusive date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub subject_id: String,
    pub period: Period,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days_worked: i64,
    pub worked_minutes: i64,
    pub break_minutes: i64,
    pub incomplete_days: i64,
    pub extra_hours_days: i64,
    pub violation_days: i64,
    /// Only computed for weekly rollups.
    pub exceeds_weekly_limit: bool,
}

/// Monday-to-Sunday week containing `date`.
pub fn week_range(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let week = date.week(Weekday::Mon);
    (week.first_day(), week.last_day())
}

/// First and last day of a calendar month.
pub fn month_range(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next.pred_opt()?))
}

/// Roll daily summaries inside `[start, end]` up into one period summary.
pub fn rollup(
    subject_id: &str,
    period: Period,
    start: NaiveDate,
    end: NaiveDate,
    days: &[DailySummary],
    contract: &ContractProfile,
) -> PeriodSummary {
    let in_range: Vec<&DailySummary> = days
        .iter()
        .filter(|d| d.subject_id == subject_id && d.date >= start && d.date <= end)
        .collect();

    let flagged = |pred: fn(&DailySummary) -> bool| -> i64 {
        in_range.iter().filter(|d| pred(d)).count().try_into().unwrap_or(i64::MAX)
    };

    let worked_minutes: i64 = in_range.iter().map(|d| d.worked_minutes).sum();

    PeriodSummary {
        subject_id: subject_id.to_string(),
        period,
        start,
        end,
        days_worked: flagged(|d| d.worked_minutes > 0),
        worked_minutes,
        break_minutes: in_range.iter().map(|d| d.break_minutes).sum(),
        incomplete_days: flagged(|d| d.has_incomplete),
        extra_hours_days: flagged(|d| d.has_extra_hours),
        violation_days: flagged(|d| d.has_violation),
        exceeds_weekly_limit: period == Period::Week
            && worked_minutes > contract.weekly_limit_minutes(),
    }
}

/// Progress towards a contract's total hours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractProgress {
    pub subject_id: String,
    pub total_minutes: Option<i64>,
    pub completed_minutes: i64,
    pub remaining_minutes: Option<i64>,
    pub days_worked: i64,
    pub average_minutes_per_day: f64,
    pub end_date: Option<NaiveDate>,
    /// Date the contract total is reached at the historical pace.
    pub projected_completion: Option<NaiveDate>,
    pub is_on_track: bool,
}

/// Project contract completion from the average pace of worked days.
///
/// The projection advances over weekdays only, starting the day after
/// `today`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn contract_progress(
    contract: &ContractProfile,
    days: &[DailySummary],
    today: NaiveDate,
) -> ContractProgress {
    let relevant: Vec<&DailySummary> = days
        .iter()
        .filter(|d| d.subject_id == contract.subject_id)
        .filter(|d| contract.start_date.is_none_or(|start| d.date >= start))
        .filter(|d| d.date <= today)
        .collect();

    let completed_minutes: i64 = relevant.iter().map(|d| d.worked_minutes).sum();
    let days_worked: i64 = relevant
        .iter()
        .filter(|d| d.worked_minutes > 0)
        .count()
        .try_into()
        .unwrap_or(i64::MAX);
    let average = if days_worked > 0 {
        completed_minutes as f64 / days_worked as f64
    } else {
        0.0
    };

    let total_minutes = contract.total_minutes();
    let remaining_minutes = total_minutes.map(|total| (total - completed_minutes).max(0));

    let projected_completion = match remaining_minutes {
        Some(0) => Some(today),
        Some(remaining) if average > 0.0 => {
            let days_needed = (remaining as f64 / average).ceil() as u64;
            Some(add_working_days(today, days_needed))
        }
        _ => None,
    };

    let is_on_track = match (remaining_minutes, contract.end_date) {
        (Some(0), _) | (None, _) => true,
        (Some(_), None) => projected_completion.is_some(),
        (Some(_), Some(end)) => projected_completion.is_some_and(|p| p <= end),
    };

    ContractProgress {
        subject_id: contract.subject_id.clone(),
        total_minutes,
        completed_minutes,
        remaining_minutes,
        days_worked,
        average_minutes_per_day: average,
        end_date: contract.end_date,
        projected_completion,
        is_on_track,
    }
}

fn add_working_days(from: NaiveDate, count: u64) -> NaiveDate {
    let mut date = from;
    let mut left = count;
    while left > 0 {
        let Some(next) = date.checked_add_days(Days::new(1)) else {
            return date;
        };
        date = next;
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            left -= 1;
        }
    }
    date
}
