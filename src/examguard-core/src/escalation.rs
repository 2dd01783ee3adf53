//! Escalation state machine.
//!
//! Pure decision logic: given the current state, windowed ledger counts and
//! this cycle's drift reading, pick at most one transition. The monitor
//! owns persistence, notification and enforcement.
//!
//! ```text
//!                 major / 3x mismatch          extreme / persistent
//!   ┌────────┐ ─────────────────────► ┌─────────┐ ──────────────► ┌────────────────────────┐
//!   │ NORMAL │                        │ WARNING │                 │ TIME_CORRECTION_NEEDED │
//!   └────────┘ ◄───────────────────── └─────────┘                 └────────────────────────┘
//!       ▲   ▲          ok                                                   │
//!       │   └───────────────────────────── ok ──────────────────────────────┘
//!       │
//!       │ unlock      tamper / multi-device            alert threshold
//!       └──────────── * ────────────────► SUSPICIOUS   * ─────────────► LOCKED
//! ```
//!
//! Rules are applied in priority order; the first that fires wins:
//!
//! 1. LOCKED stays LOCKED.
//! 2. Violations across all categories reach the alert threshold: LOCKED,
//!    or SUSPICIOUS when the lock policy is disabled.
//! 3. Subscription/payment violations reach the tamper threshold, or a
//!    multi-device session was recorded: SUSPICIOUS.
//! 4. SUSPICIOUS stays SUSPICIOUS.
//! 5. Drift readings move between NORMAL, WARNING and
//!    TIME_CORRECTION_NEEDED.
//! 6. Repeated TIME_MISMATCH events move NORMAL to WARNING.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::EnforcementPolicy;
use crate::error::MonitorError;
use crate::ledger::ViolationLedger;
use crate::types::{DriftClassification, SecurityEventType, SecurityState};

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Total violations reached the alert threshold.
    AlertThreshold,
    /// Subscription/payment violations reached the tamper threshold.
    TamperThreshold,
    /// Concurrent sessions with differing fingerprints.
    MultiDeviceSession,
    /// The persisted state record was forged or rolled back.
    StorageTamper,
    /// EXTREME drift.
    ExtremeDrift,
    /// MAJOR drift.
    MajorDrift,
    /// MAJOR drift persisted after a warning.
    PersistentDrift,
    /// Repeated TIME_MISMATCH events.
    TimeMismatch,
    /// An OK drift reading after the clock was fixed.
    ClockCorrected,
    /// Administrative unlock.
    Administrative,
}

impl fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AlertThreshold => "alert_threshold",
            Self::TamperThreshold => "tamper_threshold",
            Self::MultiDeviceSession => "multi_device_session",
            Self::StorageTamper => "storage_tamper",
            Self::ExtremeDrift => "extreme_drift",
            Self::MajorDrift => "major_drift",
            Self::PersistentDrift => "persistent_drift",
            Self::TimeMismatch => "time_mismatch",
            Self::ClockCorrected => "clock_corrected",
            Self::Administrative => "administrative",
        };
        f.write_str(s)
    }
}

/// A decided state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// State before.
    pub from: SecurityState,
    /// State after.
    pub to: SecurityState,
    /// Cause.
    pub cause: TransitionCause,
}

/// Everything the state machine reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationInputs {
    /// Violations of any type within the violation window.
    pub total_violations: usize,
    /// Subscription/payment violations within the tamper window.
    pub tamper_violations: usize,
    /// Multi-device session events within the tamper window.
    pub multi_device_sessions: usize,
    /// TIME_MISMATCH events within the mismatch window.
    pub time_mismatches: usize,
    /// This cycle's drift classification, if a reading was taken.
    pub drift: Option<DriftClassification>,
}

impl EscalationInputs {
    /// Gather counts from the ledger.
    pub fn from_ledger(
        ledger: &ViolationLedger,
        policy: &EnforcementPolicy,
        drift: Option<DriftClassification>,
    ) -> Self {
        Self {
            total_violations: ledger.count_all_in_window(policy.violation_window),
            tamper_violations: ledger.count_tamper_in_window(policy.tamper_window),
            multi_device_sessions: ledger
                .count_in_window(SecurityEventType::MultiDeviceSession, policy.tamper_window),
            time_mismatches: ledger
                .count_in_window(SecurityEventType::TimeMismatch, policy.time_mismatch_window),
            drift,
        }
    }
}

/// Applies the escalation rules under a policy.
#[derive(Debug, Clone)]
pub struct EscalationEngine {
    policy: EnforcementPolicy,
}

impl EscalationEngine {
    /// Create an engine.
    pub fn new(policy: EnforcementPolicy) -> Self {
        Self { policy }
    }

    /// Policy in force.
    pub fn policy(&self) -> &EnforcementPolicy {
        &self.policy
    }

    /// Decide the next transition, if any.
    pub fn evaluate(&self, current: SecurityState, inputs: &EscalationInputs) -> Option<Transition> {
        use SecurityState::*;

        let move_to = |to, cause| {
            (to != current).then_some(Transition {
                from: current,
                to,
                cause,
            })
        };

        if current == Locked {
            return None;
        }

        if inputs.total_violations >= self.policy.alert_threshold {
            let target = if self.policy.lock_enabled {
                Locked
            } else {
                Suspicious
            };
            return move_to(target, TransitionCause::AlertThreshold);
        }

        if inputs.tamper_violations >= self.policy.tamper_threshold {
            return move_to(Suspicious, TransitionCause::TamperThreshold);
        }
        if inputs.multi_device_sessions > 0 {
            return move_to(Suspicious, TransitionCause::MultiDeviceSession);
        }

        if current == Suspicious {
            return None;
        }

        let mismatch_rule = inputs.time_mismatches >= self.policy.time_mismatch_threshold;

        match (inputs.drift, current) {
            (Some(DriftClassification::Extreme), Normal | Warning) => {
                return move_to(TimeCorrectionNeeded, TransitionCause::ExtremeDrift);
            },
            (Some(DriftClassification::Major), Normal) => {
                return move_to(Warning, TransitionCause::MajorDrift);
            },
            (Some(DriftClassification::Major), Warning) => {
                return move_to(TimeCorrectionNeeded, TransitionCause::PersistentDrift);
            },
            (Some(DriftClassification::Ok), TimeCorrectionNeeded) => {
                return move_to(Normal, TransitionCause::ClockCorrected);
            },
            (Some(DriftClassification::Ok), Warning) if !mismatch_rule => {
                return move_to(Normal, TransitionCause::ClockCorrected);
            },
            _ => {},
        }

        if mismatch_rule && current == Normal {
            return move_to(Warning, TransitionCause::TimeMismatch);
        }

        None
    }

    /// The transition an administrative unlock performs.
    pub fn unlock_transition(current: SecurityState) -> Transition {
        Transition {
            from: current,
            to: SecurityState::Normal,
            cause: TransitionCause::Administrative,
        }
    }
}

/// Check a transition against the allowed table.
pub fn validate(transition: &Transition) -> Result<(), MonitorError> {
    use SecurityState::*;

    let Transition { from, to, cause } = *transition;
    let allowed = match (from, to) {
        (_, Normal) if cause == TransitionCause::Administrative => true,
        (Warning | TimeCorrectionNeeded, Normal) => cause == TransitionCause::ClockCorrected,
        (Normal, Warning) => true,
        (Normal | Warning, TimeCorrectionNeeded) => true,
        (Locked | Suspicious, Suspicious) => false,
        (_, Suspicious) => true,
        (Locked, Locked) => false,
        (_, Locked) => true,
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(MonitorError::InvalidTransition { from, to })
    }
}

/// Validate a transition, failing loudly in debug builds.
///
/// Release builds log the violation and return `None`, leaving the caller
/// in its current state.
pub fn checked(transition: Transition) -> Option<Transition> {
    match validate(&transition) {
        Ok(()) => Some(transition),
        Err(e) => {
            if cfg!(debug_assertions) {
                panic!("{e} (cause: {})", transition.cause);
            }
            error!(error = %e, cause = %transition.cause, "Rejected invalid transition");
            None
        },
    }
}
