//! Punchclock Core Library
//!
//! Shared functionality for Punchclock components:
//! - Attendance domain types and the clock abstraction
//! - ENTRY/EXIT resolution and scan plausibility rules
//! - Work-hours aggregation and contract rollups
//! - Configuration resolution, tracing setup and `SQLite` helpers
//! - Common error types

pub mod aggregate;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod resolver;
pub mod tracing_init;
pub mod types;

pub use clock::{Clock, FixedClock, LocalCalendar, SystemClock};
pub use config::Config;
pub use error::{Error, ErrorCode, Result, Violation};
pub use resolver::{AttendanceRules, Resolution, ScanContext, ScanDecision};
pub use types::{AttendanceKind, Confidence, ContractProfile, Punch};
