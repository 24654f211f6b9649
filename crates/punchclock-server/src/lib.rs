//! Punchclock Server Library
//!
//! Attendance integrity service:
//! - Short-lived signed terminal tokens with single-use nonces
//! - Scan validation against schedule and sequence rules
//! - Per-subject hash-chained attendance ledger in `SQLite`
//! - Daily summaries with weekly, monthly and contract rollups
//! - Axum HTTP API and background rotation and cleanup tasks

pub mod http;
pub mod ledger;
pub mod nonce;
pub mod service;
pub mod state;
pub mod storage;
pub mod summary;
pub mod tasks;
pub mod token;
