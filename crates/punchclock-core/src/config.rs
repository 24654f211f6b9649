//! Configuration resolution for Punchclock.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/punchclock/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`PUNCHCLOCK_*`)
//! 5. CLI arguments (highest priority, applied by the binary)

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Minimum accepted length of the token signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Complete Punchclock configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// HTTP server and storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub database_path: Option<PathBuf>,
    /// Offset of the site's local time from UTC, in minutes.
    pub utc_offset_minutes: i32,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            database_path: None,
            utc_offset_minutes: 0,
            log_json: false,
        }
    }
}

/// Token issuance and replay-protection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Shared HMAC secret. Must be at least [`MIN_SECRET_LEN`] bytes.
    pub signing_secret: String,
    pub validity_secs: i64,
    /// Extra nonce lifetime beyond the validity window.
    pub nonce_margin_secs: i64,
    pub rotation_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// How long expired, unconsumed issuance rows are kept before pruning.
    pub cleanup_grace_secs: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            validity_secs: 60,
            nonce_margin_secs: 30,
            rotation_interval_secs: 60,
            cleanup_interval_secs: 300,
            cleanup_grace_secs: 3600,
        }
    }
}

/// Labor-time rules applied to every scan and every daily summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// First permitted clock hour (inclusive).
    pub earliest_hour: u32,
    /// Last permitted clock hour (exclusive).
    pub latest_hour: u32,
    /// Same-type scans inside this window are rejected as duplicates.
    pub duplicate_window_secs: i64,
    /// Opposite-type scans inside this window only raise a warning.
    pub min_spacing_secs: i64,
    pub daily_tolerance_minutes: i64,
    /// Worked time after which a break becomes mandatory.
    pub break_required_after_minutes: i64,
    pub min_break_minutes: i64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            earliest_hour: 6,
            latest_hour: 22,
            duplicate_window_secs: 60,
            min_spacing_secs: 120,
            daily_tolerance_minutes: 30,
            break_required_after_minutes: 6 * 60,
            min_break_minutes: 30,
        }
    }
}

/// A local time-of-day window, `start` inclusive and `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or(NaiveTime::MIN),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        t >= self.start && t < self.end
    }
}

/// Expected daily patterns used to grade resolver confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub arrival: TimeWindow,
    pub lunch_departure: TimeWindow,
    pub lunch_return: TimeWindow,
    /// Scans before this time are graded low confidence.
    pub unusual_before: NaiveTime,
    /// Scans at or after this time are graded low confidence.
    pub unusual_after: NaiveTime,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            arrival: TimeWindow::new((6, 0), (9, 30)),
            lunch_departure: TimeWindow::new((11, 30), (14, 30)),
            lunch_return: TimeWindow::new((12, 0), (15, 0)),
            unusual_before: NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN),
            unusual_after: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

impl Config {
    /// Reject configurations the server must not start with.
    pub fn validate(&self) -> Result<()> {
        if self.tokens.signing_secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "signing secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.tokens.validity_secs <= 0 {
            return Err(Error::Config("token validity must be positive".into()));
        }
        if self.tokens.nonce_margin_secs < 0 {
            return Err(Error::Config("nonce margin must not be negative".into()));
        }
        if self.tokens.rotation_interval_secs == 0 || self.tokens.cleanup_interval_secs == 0 {
            return Err(Error::Config("task intervals must be positive".into()));
        }
        if self.rules.earliest_hour >= self.rules.latest_hour || self.rules.latest_hour > 24 {
            return Err(Error::Config(format!(
                "invalid permitted hours {}..{}",
                self.rules.earliest_hour, self.rules.latest_hour
            )));
        }
        if self.rules.duplicate_window_secs < 0 || self.rules.daily_tolerance_minutes < 0 {
            return Err(Error::Config("rule windows must not be negative".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the global file is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
        }
    }

    if let Some(path) = path {
        config = load_config_file(path)?;
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
        .map(|p| p.join("punchclock").join("settings.json"))
}

/// Default database location when none is configured.
pub fn default_database_path() -> Option<PathBuf> {
    global_config_path().and_then(|p| p.parent().map(|dir| dir.join("attendance.db")))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("PUNCHCLOCK_SIGNING_SECRET") {
        config.tokens.signing_secret = val;
    }
    if let Ok(val) = std::env::var("PUNCHCLOCK_TOKEN_VALIDITY_SECS") {
        if let Ok(n) = val.parse() {
            config.tokens.validity_secs = n;
        }
    }
    if let Ok(val) = std::env::var("PUNCHCLOCK_LISTEN_ADDR") {
        config.server.listen_addr = val;
    }
    if let Ok(val) = std::env::var("PUNCHCLOCK_DATABASE_PATH") {
        config.server.database_path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("PUNCHCLOCK_UTC_OFFSET_MINUTES") {
        if let Ok(n) = val.parse() {
            config.server.utc_offset_minutes = n;
        }
    }
}
