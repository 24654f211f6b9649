//! Attendance type resolution and scan plausibility rules.
//!
//! [`AttendanceRules::resolve`] infers ENTRY or EXIT from the subject's
//! previous punch and grades the guess against the expected daily pattern.
//! [`AttendanceRules::validate`] independently rejects scans that break the
//! labor-time rules. Both are pure functions of their inputs.

use chrono::{NaiveTime, Timelike};
use serde::Serialize;

use crate::aggregate::{format_minutes, worked_minutes_until};
use crate::clock::LocalCalendar;
use crate::config::{RulesConfig, ScheduleConfig};
use crate::error::{ErrorCode, Violation};
use crate::types::{AttendanceKind, Confidence, ContractProfile, Punch};

/// Everything the rules know about a scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanContext<'a> {
    /// Server time of the scan (Unix seconds).
    pub now: i64,
    /// The subject's most recent punch, on any day.
    pub last: Option<Punch>,
    /// The subject's punches on the scan's local date, oldest first.
    pub today: &'a [Punch],
    pub contract: &'a ContractProfile,
}

/// Inferred attendance type with advisory metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub kind: AttendanceKind,
    pub confidence: Confidence,
    pub reason: String,
    pub warnings: Vec<String>,
}

/// Accepted scan: the type to record plus everything the caller reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanDecision {
    pub kind: AttendanceKind,
    pub confidence: Confidence,
    pub reason: String,
    pub warnings: Vec<String>,
}

/// Rule engine for attendance scans.
#[derive(Debug, Clone, Default)]
pub struct AttendanceRules {
    rules: RulesConfig,
    schedule: ScheduleConfig,
    calendar: LocalCalendar,
}

impl AttendanceRules {
    pub const fn new(rules: RulesConfig, schedule: ScheduleConfig, calendar: LocalCalendar) -> Self {
        Self {
            rules,
            schedule,
            calendar,
        }
    }

    pub const fn rules(&self) -> &RulesConfig {
        &self.rules
    }

    pub const fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    /// Infer the attendance type for a scan. Never fails; confidence is
    /// advisory only.
    pub fn resolve(&self, ctx: &ScanContext<'_>) -> Resolution {
        let time = self.calendar.local(ctx.now).time();
        let is_weekend = self.calendar.is_weekend(ctx.now);
        let mut warnings = Vec::new();

        let (kind, mut confidence, reason) = match ctx.last {
            None => {
                if self.is_unusual(time) {
                    warnings.push(format!("first record at unusual hour {}", hhmm(time)));
                }
                (
                    AttendanceKind::Entry,
                    Confidence::High,
                    "first recorded entry".to_string(),
                )
            }
            Some(last) if last.kind == AttendanceKind::Exit => {
                let (confidence, reason) = self.grade_entry(ctx, time);
                (AttendanceKind::Entry, confidence, reason)
            }
            Some(last) => {
                let last_date = self.calendar.date_of(last.at);
                if last_date == self.calendar.date_of(ctx.now) {
                    let (confidence, reason) = self.grade_exit(ctx, time);
                    (AttendanceKind::Exit, confidence, reason)
                } else {
                    warnings.push(format!("entry from {last_date} was never closed"));
                    (
                        AttendanceKind::Exit,
                        Confidence::Low,
                        format!("closing open entry from {last_date}"),
                    )
                }
            }
        };

        if is_weekend {
            warnings.push("scan on a weekend".to_string());
            if confidence == Confidence::High {
                confidence = confidence.downgrade();
            }
        }

        Resolution {
            kind,
            confidence,
            reason,
            warnings,
        }
    }

    fn is_unusual(&self, time: NaiveTime) -> bool {
        time < self.schedule.unusual_before || time >= self.schedule.unusual_after
    }

    fn grade_entry(&self, ctx: &ScanContext<'_>, time: NaiveTime) -> (Confidence, String) {
        let exited_today = ctx.today.iter().any(|p| p.kind == AttendanceKind::Exit);

        if self.is_unusual(time) {
            (Confidence::Low, "unusual hour for clock-in".to_string())
        } else if exited_today && self.schedule.lunch_return.contains(time) {
            (Confidence::High, "return from lunch".to_string())
        } else if self.schedule.arrival.contains(time) {
            (Confidence::High, "regular arrival".to_string())
        } else if exited_today {
            (Confidence::Medium, "return after break".to_string())
        } else if time >= self.schedule.arrival.end {
            (Confidence::Medium, "late arrival".to_string())
        } else {
            (Confidence::Medium, "early arrival".to_string())
        }
    }

    fn grade_exit(&self, ctx: &ScanContext<'_>, time: NaiveTime) -> (Confidence, String) {
        let worked = worked_minutes_until(ctx.today, ctx.now);

        if self.is_unusual(time) {
            (Confidence::Low, "unusual hour for clock-out".to_string())
        } else if worked >= ctx.contract.daily_limit_minutes() {
            (Confidence::High, "end of working day".to_string())
        } else if self.schedule.lunch_departure.contains(time) {
            (Confidence::High, "lunch break".to_string())
        } else {
            (
                Confidence::Medium,
                format!("early departure after {}", format_minutes(worked)),
            )
        }
    }

    /// Check a scan of `kind` against the hard rules. Returns warnings on
    /// success and every blocking violation on failure.
    pub fn validate(
        &self,
        ctx: &ScanContext<'_>,
        kind: AttendanceKind,
        allow_overtime: bool,
    ) -> Result<Vec<String>, Vec<Violation>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let recent = ctx
            .today
            .iter()
            .chain(ctx.last.iter())
            .filter(|p| ctx.now - p.at < self.rules.duplicate_window_secs && p.at <= ctx.now)
            .find(|p| p.kind == kind);
        if let Some(dup) = recent {
            errors.push(Violation::new(
                ErrorCode::DuplicateRecord,
                format!("{kind} already recorded {}s ago", ctx.now - dup.at),
            ));
        }

        match ctx.last {
            Some(last) if last.kind == kind => errors.push(Violation::new(
                ErrorCode::SequenceViolation,
                format!("{kind} cannot follow {}", last.kind),
            )),
            None if kind == AttendanceKind::Exit => errors.push(Violation::new(
                ErrorCode::SequenceViolation,
                "first record must be an ENTRY",
            )),
            Some(last) if ctx.now - last.at < self.rules.min_spacing_secs => warnings.push(format!(
                "only {}s since previous {}",
                ctx.now - last.at,
                last.kind
            )),
            _ => {}
        }

        let hour = self.calendar.local(ctx.now).hour();
        if hour < self.rules.earliest_hour || hour >= self.rules.latest_hour {
            errors.push(Violation::new(
                ErrorCode::OutOfHours,
                format!(
                    "scans are accepted between {:02}:00 and {:02}:00",
                    self.rules.earliest_hour, self.rules.latest_hour
                ),
            ));
        }

        if kind == AttendanceKind::Exit {
            let worked = worked_minutes_until(ctx.today, ctx.now);
            let limit = ctx.contract.daily_limit_minutes();
            if worked > limit + self.rules.daily_tolerance_minutes {
                if allow_overtime {
                    warnings.push(format!(
                        "overtime approved: {} worked against {}",
                        format_minutes(worked),
                        format_minutes(limit)
                    ));
                } else {
                    errors.push(Violation::new(
                        ErrorCode::DailyLimitExceeded,
                        format!(
                            "{} worked exceeds the daily limit of {}",
                            format_minutes(worked),
                            format_minutes(limit)
                        ),
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(warnings)
        } else {
            Err(errors)
        }
    }

    /// Resolve the type (or take the declared one) and validate it.
    pub fn evaluate(
        &self,
        ctx: &ScanContext<'_>,
        declared: Option<AttendanceKind>,
        allow_overtime: bool,
    ) -> Result<ScanDecision, Vec<Violation>> {
        let resolution = self.resolve(ctx);
        let mut warnings = resolution.warnings;
        let mut confidence = resolution.confidence;
        let mut reason = resolution.reason;

        let kind = match declared {
            Some(declared) if declared != resolution.kind => {
                warnings.push(format!(
                    "declared {declared} differs from inferred {}",
                    resolution.kind
                ));
                confidence = Confidence::Low;
                reason = format!("declared {declared}");
                declared
            }
            Some(declared) => declared,
            None => resolution.kind,
        };

        let rule_warnings = self.validate(ctx, kind, allow_overtime)?;
        warnings.extend(rule_warnings);

        Ok(ScanDecision {
            kind,
            confidence,
            reason,
            warnings,
        })
    }
}

fn hhmm(time: NaiveTime) -> String {
    format!("{:02}:{:02}", time.hour(), time.minute())
}
