//! SQLite storage for the Punchclock attendance server.
//!
//! Provides persistence for terminals, token issuances, consumption audit
//! rows, hash-chained attendance records, daily summaries and contract
//! profiles.

mod db;
mod models;
mod queries;
mod queries_records;


pub use db::{AttendanceDatabase, DatabaseError};
pub use models::*;
pub use queries::NewIssuance;
