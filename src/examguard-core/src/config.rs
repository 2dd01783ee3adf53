//! Configuration for the monitoring engine.
//!
//! Every tunable lives here and is passed at construction. There are no
//! ambient switches: a detection-only deployment sets
//! `policy.lock_enabled = false`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::fingerprint::{FingerprintScheme, DEFAULT_MISMATCH_TOLERANCE};
use crate::types::DriftClassification;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Serialize `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Enforcement policy: thresholds and the lock switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementPolicy {
    /// Whether crossing the alert threshold locks. When false the monitor
    /// stops at SUSPICIOUS (detection-only deployments).
    pub lock_enabled: bool,
    /// Violations across all categories within `violation_window` that lock.
    pub alert_threshold: usize,
    /// Window for the lock rule.
    #[serde(with = "duration_ms")]
    pub violation_window: Duration,
    /// Subscription/payment violations within `tamper_window` that mark
    /// the device SUSPICIOUS.
    pub tamper_threshold: usize,
    /// Window for the tamper rule.
    #[serde(with = "duration_ms")]
    pub tamper_window: Duration,
    /// TIME_MISMATCH events within `time_mismatch_window` that warn.
    pub time_mismatch_threshold: usize,
    /// Window for the time-mismatch rule.
    #[serde(with = "duration_ms")]
    pub time_mismatch_window: Duration,
    /// Concurrent sessions with distinct fingerprints that mark SUSPICIOUS.
    pub session_threshold: usize,
    /// Hex SHA-256 of the administrative unlock token. Unlock is refused
    /// when unset.
    pub unlock_token_sha256: Option<String>,
}

impl Default for EnforcementPolicy {
    fn default() -> Self {
        Self {
            lock_enabled: true,
            alert_threshold: 10,
            violation_window: Duration::from_secs(DAY),
            tamper_threshold: 3,
            tamper_window: Duration::from_secs(HOUR),
            time_mismatch_threshold: 3,
            time_mismatch_window: Duration::from_secs(HOUR),
            session_threshold: 2,
            unlock_token_sha256: None,
        }
    }
}

/// Drift tolerance bands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftThresholds {
    /// Upper bound (inclusive) of OK.
    #[serde(with = "duration_ms")]
    pub ok_max: Duration,
    /// Upper bound (inclusive) of MINOR.
    #[serde(with = "duration_ms")]
    pub minor_max: Duration,
    /// Upper bound (inclusive) of MAJOR. Anything above is EXTREME.
    #[serde(with = "duration_ms")]
    pub major_max: Duration,
    /// A MINOR reading recurring within this window records TIME_MISMATCH.
    #[serde(with = "duration_ms")]
    pub minor_recurrence_window: Duration,
}

impl DriftThresholds {
    /// Classify an absolute drift.
    pub fn classify(&self, drift: Duration) -> DriftClassification {
        if drift <= self.ok_max {
            DriftClassification::Ok
        } else if drift <= self.minor_max {
            DriftClassification::Minor
        } else if drift <= self.major_max {
            DriftClassification::Major
        } else {
            DriftClassification::Extreme
        }
    }
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            ok_max: Duration::from_secs(5 * MINUTE),
            minor_max: Duration::from_secs(30 * MINUTE),
            major_max: Duration::from_secs(60 * MINUTE),
            minor_recurrence_window: Duration::from_secs(HOUR),
        }
    }
}

/// Notification throttle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Minimum interval between two notifications of one category.
    #[serde(with = "duration_ms")]
    pub min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(5 * MINUTE),
        }
    }
}

/// Subscription and payment heuristic settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TamperConfig {
    /// Active subscriptions expiring further out than this are implausible.
    pub max_future_years: u32,
    /// Payment attempts allowed within `payment_window`.
    pub max_payment_attempts: usize,
    /// Rolling window for payment attempts.
    #[serde(with = "duration_ms")]
    pub payment_window: Duration,
    /// Slack added to purchased terms before flagging an extended expiry.
    #[serde(with = "duration_ms")]
    pub term_grace: Duration,
    /// How far in the future `last_modified` may be before it is flagged.
    #[serde(with = "duration_ms")]
    pub modified_tolerance: Duration,
}

impl Default for TamperConfig {
    fn default() -> Self {
        Self {
            max_future_years: 5,
            max_payment_attempts: 3,
            payment_window: Duration::from_secs(10 * MINUTE),
            term_grace: Duration::from_secs(7 * DAY),
            modified_tolerance: Duration::from_secs(10 * MINUTE),
        }
    }
}

/// Exam-session anomaly settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExamConfig {
    /// Longest tolerated gap between exam heartbeats.
    #[serde(with = "duration_ms")]
    pub max_heartbeat_gap: Duration,
    /// Answers faster than this count as rapid.
    #[serde(with = "duration_ms")]
    pub min_answer_time: Duration,
    /// Rapid answers that produce one anomaly.
    pub rapid_answer_threshold: usize,
}

impl Default for ExamConfig {
    fn default() -> Self {
        Self {
            max_heartbeat_gap: Duration::from_secs(90),
            min_answer_time: Duration::from_secs(2),
            rapid_answer_threshold: 5,
        }
    }
}

/// Top-level configuration for a [`crate::SecurityMonitor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Account the session belongs to. Enables the multi-session rule.
    pub account_id: Option<String>,
    /// Session identifier; random when unset.
    pub session_id: Option<String>,
    /// Enforcement policy.
    pub policy: EnforcementPolicy,
    /// Drift bands.
    pub drift: DriftThresholds,
    /// Notification throttle.
    pub throttle: ThrottleConfig,
    /// Tamper heuristics.
    pub tamper: TamperConfig,
    /// Exam anomaly detection.
    pub exam: ExamConfig,
    /// Fingerprint digest scheme.
    pub fingerprint_scheme: FingerprintScheme,
    /// Component changes tolerated before the fingerprint counts as
    /// mismatched.
    pub fingerprint_tolerance: usize,
    /// Periodic check cadence.
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    /// Minimum spacing between periodic drift checks.
    #[serde(with = "duration_ms")]
    pub time_check_interval: Duration,
    /// Upper bound on one trusted-time fetch.
    #[serde(with = "duration_ms")]
    pub trusted_time_timeout: Duration,
    /// Sessions not seen for this long are inactive.
    #[serde(with = "duration_ms")]
    pub session_ttl: Duration,
    /// Ledger retention cap.
    pub ledger_capacity: usize,
    /// Pages reachable in TIME_CORRECTION_NEEDED.
    pub safe_pages: Vec<String>,
    /// Pages reachable in LOCKED.
    pub unlock_pages: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            account_id: None,
            session_id: None,
            policy: EnforcementPolicy::default(),
            drift: DriftThresholds::default(),
            throttle: ThrottleConfig::default(),
            tamper: TamperConfig::default(),
            exam: ExamConfig::default(),
            fingerprint_scheme: FingerprintScheme::default(),
            fingerprint_tolerance: DEFAULT_MISMATCH_TOLERANCE,
            check_interval: Duration::from_secs(30),
            time_check_interval: Duration::from_secs(5 * MINUTE),
            trusted_time_timeout: Duration::from_secs(3),
            session_ttl: Duration::from_secs(2 * MINUTE),
            ledger_capacity: 1000,
            safe_pages: vec![
                "/".into(),
                "/login".into(),
                "/register".into(),
                "/help/time".into(),
            ],
            unlock_pages: vec!["/unlock".into(), "/support".into()],
        }
    }
}

impl MonitorConfig {
    /// Parse a configuration from JSON. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, MonitorError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), MonitorError> {
        let d = &self.drift;
        if !(d.ok_max < d.minor_max && d.minor_max < d.major_max) {
            return Err(MonitorError::config(
                "drift bands must satisfy ok_max < minor_max < major_max",
            ));
        }
        if self.policy.alert_threshold == 0 {
            return Err(MonitorError::config("alert_threshold must be at least 1"));
        }
        if self.policy.tamper_threshold == 0 || self.policy.time_mismatch_threshold == 0 {
            return Err(MonitorError::config("escalation thresholds must be at least 1"));
        }
        if self.policy.session_threshold < 2 {
            return Err(MonitorError::config("session_threshold must be at least 2"));
        }
        if self.ledger_capacity == 0 {
            return Err(MonitorError::config("ledger_capacity must be at least 1"));
        }
        if self.trusted_time_timeout.is_zero() {
            return Err(MonitorError::config("trusted_time_timeout must be non-zero"));
        }
        if self.check_interval.is_zero() {
            return Err(MonitorError::config("check_interval must be non-zero"));
        }
        Ok(())
    }
}
