//! Shared data model: events, states, enforcement actions and the read-only
//! subscription records supplied by the host.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::security::{constant_time_eq, random_id, sha256_hex};

/// Salt mixed into every event seal.
const SEAL_DOMAIN: &str = "examguard-event-seal:v1:";

/// Kind of recorded security event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    /// A MINOR clock drift that recurred within the recurrence window.
    TimeMismatch,
    /// Clock drift between 30 and 60 minutes.
    ClockDriftMajor,
    /// Clock drift above 60 minutes.
    ClockDriftExtreme,
    /// Implausible subscription record.
    SubscriptionTamper,
    /// Too many payment attempts in a short window.
    PaymentAbuse,
    /// Trial used from several devices.
    TrialAbuse,
    /// Concurrent sessions with differing fingerprints under one account.
    MultiDeviceSession,
    /// Environment drifted beyond the fingerprint tolerance.
    FingerprintMismatch,
    /// Anomalous exam-taking behaviour.
    ExamAnomaly,
    /// Persisted engine records failed their integrity seal.
    StorageTamper,
    /// Violation reported by the host application.
    External,
}

impl SecurityEventType {
    /// Every event type, in declaration order.
    pub const ALL: [SecurityEventType; 11] = [
        Self::TimeMismatch,
        Self::ClockDriftMajor,
        Self::ClockDriftExtreme,
        Self::SubscriptionTamper,
        Self::PaymentAbuse,
        Self::TrialAbuse,
        Self::MultiDeviceSession,
        Self::FingerprintMismatch,
        Self::ExamAnomaly,
        Self::StorageTamper,
        Self::External,
    ];

    /// Category used for windowed aggregation.
    pub fn category(self) -> EventCategory {
        match self {
            Self::TimeMismatch | Self::ClockDriftMajor | Self::ClockDriftExtreme => {
                EventCategory::Time
            },
            Self::SubscriptionTamper | Self::TrialAbuse => EventCategory::Subscription,
            Self::PaymentAbuse => EventCategory::Payment,
            Self::MultiDeviceSession | Self::FingerprintMismatch => EventCategory::Device,
            Self::ExamAnomaly => EventCategory::Exam,
            Self::StorageTamper => EventCategory::Storage,
            Self::External => EventCategory::External,
        }
    }

    /// Stable identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TimeMismatch => "time_mismatch",
            Self::ClockDriftMajor => "clock_drift_major",
            Self::ClockDriftExtreme => "clock_drift_extreme",
            Self::SubscriptionTamper => "subscription_tamper",
            Self::PaymentAbuse => "payment_abuse",
            Self::TrialAbuse => "trial_abuse",
            Self::MultiDeviceSession => "multi_device_session",
            Self::FingerprintMismatch => "fingerprint_mismatch",
            Self::ExamAnomaly => "exam_anomaly",
            Self::StorageTamper => "storage_tamper",
            Self::External => "external",
        }
    }
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation category for security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Clock integrity.
    Time,
    /// Subscription and trial records.
    Subscription,
    /// Payment flow.
    Payment,
    /// Device identity and session multiplicity.
    Device,
    /// Exam behaviour.
    Exam,
    /// Local storage integrity.
    Storage,
    /// Host-reported.
    External,
}

impl EventCategory {
    /// Whether this category counts toward the tamper (SUSPICIOUS) rule.
    pub fn is_tamper(self) -> bool {
        matches!(self, Self::Subscription | Self::Payment)
    }
}

/// An immutable, sealed record in the violation ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    /// Random event identifier.
    pub id: String,
    /// Event type.
    pub event_type: SecurityEventType,
    /// Local wall-clock time of recording (Unix milliseconds).
    pub timestamp_ms: i64,
    /// Detector-specific evidence.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Fingerprint of the device that recorded the event.
    pub device_fingerprint: String,
    /// SHA-256 integrity seal over the fields above.
    #[serde(default)]
    pub seal: String,
}

impl SecurityEvent {
    /// Create and seal a new event.
    pub fn new(
        event_type: SecurityEventType,
        timestamp_ms: i64,
        payload: serde_json::Value,
        device_fingerprint: impl Into<String>,
    ) -> Self {
        let mut event = Self {
            id: random_id(),
            event_type,
            timestamp_ms,
            payload,
            device_fingerprint: device_fingerprint.into(),
            seal: String::new(),
        };
        event.seal = event.compute_seal();
        event
    }

    /// Compute the expected seal for this event.
    ///
    /// The canonical form is a JSON object; `serde_json` maps are ordered,
    /// so the encoding is stable.
    pub fn compute_seal(&self) -> String {
        let canonical = serde_json::json!({
            "id": self.id,
            "event_type": self.event_type,
            "timestamp_ms": self.timestamp_ms,
            "payload": self.payload,
            "device_fingerprint": self.device_fingerprint,
        });
        let canonical_json = serde_json::to_string(&canonical).unwrap_or_default();
        sha256_hex(format!("{SEAL_DOMAIN}{canonical_json}").as_bytes())
    }

    /// Verify the stored seal.
    pub fn verify_seal(&self) -> bool {
        constant_time_eq(self.compute_seal().as_bytes(), self.seal.as_bytes())
    }

    /// Category of this event.
    pub fn category(&self) -> EventCategory {
        self.event_type.category()
    }
}

/// Per-device security state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityState {
    /// No restrictions.
    #[default]
    Normal,
    /// User is warned.
    Warning,
    /// Navigation restricted until the clock is fixed.
    TimeCorrectionNeeded,
    /// Tamper evidence; warned and reported.
    Suspicious,
    /// Everything denied except the unlock flow. Terminal until unlock.
    Locked,
}

impl SecurityState {
    /// Enforcement action the host must apply in this state.
    pub fn enforcement_action(self) -> EnforcementAction {
        match self {
            Self::Normal => EnforcementAction::None,
            Self::Warning => EnforcementAction::Warn,
            Self::TimeCorrectionNeeded => EnforcementAction::RestrictToSafePages,
            Self::Suspicious => EnforcementAction::WarnAndReport,
            Self::Locked => EnforcementAction::DenyAllExceptUnlock,
        }
    }

    /// Severity rank, higher is more restrictive.
    pub fn severity(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Warning => 1,
            Self::TimeCorrectionNeeded => 2,
            Self::Suspicious => 3,
            Self::Locked => 4,
        }
    }

    /// Stable identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::TimeCorrectionNeeded => "time_correction_needed",
            Self::Suspicious => "suspicious",
            Self::Locked => "locked",
        }
    }
}

impl fmt::Display for SecurityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforcement action returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    /// No action.
    None,
    /// Show a warning.
    Warn,
    /// Confine navigation to landing/auth pages.
    RestrictToSafePages,
    /// Warn and queue a security report.
    WarnAndReport,
    /// Deny everything except the unlock flow.
    DenyAllExceptUnlock,
}

impl EnforcementAction {
    /// Whether the host must confine navigation.
    pub fn restricts_navigation(self) -> bool {
        matches!(self, Self::RestrictToSafePages | Self::DenyAllExceptUnlock)
    }
}

/// Drift severity band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftClassification {
    /// Within tolerance.
    Ok,
    /// Noticeable, probably benign.
    Minor,
    /// Likely manual clock change.
    Major,
    /// Clock set far from reality.
    Extreme,
}

/// User-facing notification categories (one throttle record each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    /// Clock drift warning.
    ClockDrift,
    /// Clock must be corrected before continuing.
    TimeCorrection,
    /// Suspicious activity.
    Suspicious,
    /// Account locked.
    Locked,
    /// Payment attempts throttled.
    Payment,
}

impl NotificationCategory {
    /// Every category.
    pub const ALL: [NotificationCategory; 5] = [
        Self::ClockDrift,
        Self::TimeCorrection,
        Self::Suspicious,
        Self::Locked,
        Self::Payment,
    ];

    /// Stable identifier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClockDrift => "clock_drift",
            Self::TimeCorrection => "time_correction",
            Self::Suspicious => "suspicious",
            Self::Locked => "locked",
            Self::Payment => "payment",
        }
    }

    /// Category used for the warning shown in a given state.
    pub fn for_state(state: SecurityState) -> Option<Self> {
        match state {
            SecurityState::Normal => None,
            SecurityState::Warning => Some(Self::ClockDrift),
            SecurityState::TimeCorrectionNeeded => Some(Self::TimeCorrection),
            SecurityState::Suspicious => Some(Self::Suspicious),
            SecurityState::Locked => Some(Self::Locked),
        }
    }
}

/// Snapshot of monitor status for the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    /// Current security state.
    pub state: SecurityState,
    /// Device fingerprint, if one could be derived.
    pub device_fingerprint: Option<String>,
    /// Violations counted toward the lock threshold.
    pub violation_count: usize,
    /// Local time of the last completed check cycle.
    pub last_check_ms: Option<i64>,
    /// Action the host must enforce.
    pub enforcement: EnforcementAction,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            state: SecurityState::Normal,
            device_fingerprint: None,
            violation_count: 0,
            last_check_ms: None,
            enforcement: EnforcementAction::None,
        }
    }
}

// =============================================================================
// SUBSCRIPTION RECORDS (read-only, host supplied)
// =============================================================================

/// Subscription plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    /// Free tier.
    Free,
    /// Time-limited trial.
    Trial,
    /// Monthly.
    Monthly,
    /// Quarterly.
    Quarterly,
    /// Yearly.
    Yearly,
    /// One-off lifetime purchase.
    Lifetime,
}

impl SubscriptionPlan {
    /// Whether the plan requires a completed payment.
    pub fn is_paid(self) -> bool {
        !matches!(self, Self::Free | Self::Trial)
    }

    /// Length of one purchased term, if the plan expires.
    pub fn term(self) -> Option<Duration> {
        const DAY: u64 = 24 * 60 * 60;
        match self {
            Self::Monthly => Some(Duration::from_secs(31 * DAY)),
            Self::Quarterly => Some(Duration::from_secs(92 * DAY)),
            Self::Yearly => Some(Duration::from_secs(366 * DAY)),
            Self::Free | Self::Trial | Self::Lifetime => None,
        }
    }
}

/// Subscription record as currently stored by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    /// Plan.
    pub plan: SubscriptionPlan,
    /// Expiry (Unix milliseconds), if any.
    pub expiry_ms: Option<i64>,
    /// Whether the host considers the subscription active.
    pub is_active: bool,
    /// Last modification (Unix milliseconds), if tracked.
    #[serde(default)]
    pub last_modified_ms: Option<i64>,
}

/// Payment outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    /// Not finished.
    Pending,
    /// Completed successfully.
    Completed,
    /// Declined or abandoned.
    Failed,
    /// Refunded after completion.
    Refunded,
}

/// Payment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Gateway payment identifier.
    pub payment_id: String,
    /// Plan purchased.
    pub plan: SubscriptionPlan,
    /// Outcome.
    pub status: PaymentStatus,
    /// Completion time (Unix milliseconds).
    #[serde(default)]
    pub completed_ms: Option<i64>,
}

/// Trial usage record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Whether the trial has been consumed.
    pub used: bool,
    /// Fingerprints of devices that used the trial.
    #[serde(default)]
    pub device_fingerprints: Vec<String>,
}
