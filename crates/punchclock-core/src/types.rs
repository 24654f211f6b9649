//! Attendance domain types shared by the resolver, the aggregator and the
//! server storage layer.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Whether a scan clocks the subject in or out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttendanceKind {
    Entry,
    Exit,
}

impl AttendanceKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::Exit => "EXIT",
        }
    }

    /// The type that must follow this one.
    pub const fn opposite(self) -> Self {
        match self {
            Self::Entry => Self::Exit,
            Self::Exit => Self::Entry,
        }
    }
}

impl std::fmt::Display for AttendanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttendanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ENTRY" | "IN" => Ok(Self::Entry),
            "EXIT" | "OUT" => Ok(Self::Exit),
            other => Err(format!("unknown attendance type: {other}")),
        }
    }
}

/// Advisory confidence attached to a resolved attendance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// One step lower, saturating at `Low`.
    pub const fn downgrade(self) -> Self {
        match self {
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The minimal view of a stored attendance record that the rules need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Punch {
    pub kind: AttendanceKind,
    /// Server timestamp (Unix seconds).
    pub at: i64,
}

impl Punch {
    pub const fn new(kind: AttendanceKind, at: i64) -> Self {
        Self { kind, at }
    }
}

/// Contract attributes of a subject used by validation and aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractProfile {
    pub subject_id: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Total hours the contract requires, if bounded.
    pub total_hours: Option<f64>,
    pub daily_hours: f64,
    pub weekly_hours: f64,
}

impl ContractProfile {
    /// Profile applied when a subject has no stored contract.
    pub fn standard(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            start_date: None,
            end_date: None,
            total_hours: None,
            daily_hours: 8.0,
            weekly_hours: 40.0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn daily_limit_minutes(&self) -> i64 {
        (self.daily_hours * 60.0).round() as i64
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn weekly_limit_minutes(&self) -> i64 {
        (self.weekly_hours * 60.0).round() as i64
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn total_minutes(&self) -> Option<i64> {
        self.total_hours.map(|h| (h * 60.0).round() as i64)
    }
}
