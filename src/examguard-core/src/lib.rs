//! # examguard-core
//!
//! Client-resident integrity monitoring for subscription-gated exam
//! applications. Detects tampering with the device clock, local storage,
//! subscription records and the exam session itself, keeps a sealed ledger
//! of violations, and escalates to warnings, navigation restriction and a
//! lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SecurityMonitor                           │
//! │                                                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │ Fingerprint  │  │ TimeIntegrity│  │   Tamper     │       │
//! │  │ Generator    │  │ Checker      │  │  Heuristics  │       │
//! │  └──────────────┘  └──────────────┘  └──────────────┘       │
//! │  ┌──────────────┐  ┌──────────────┐                         │
//! │  │ ExamMonitor  │  │ Session      │                         │
//! │  │              │  │ Registry     │                         │
//! │  └──────────────┘  └──────────────┘                         │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐       │
//! │  │              ViolationLedger                      │       │
//! │  │   (sealed, append-only, capped, windowed counts)  │       │
//! │  └──────────────────────────────────────────────────┘       │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐       │
//! │  │              EscalationEngine                     │       │
//! │  │   NORMAL → TIME_CORRECTION_NEEDED → SUSPICIOUS    │       │
//! │  │                                  → LOCKED         │       │
//! │  └──────────────────────────────────────────────────┘       │
//! │                           │                                  │
//! │                           ▼                                  │
//! │  ┌──────────────────────────────────────────────────┐       │
//! │  │   NotificationThrottle  /  NavigationControl      │       │
//! │  └──────────────────────────────────────────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure policy
//!
//! - **No false positives from failures**: a detector that cannot observe
//!   reports nothing; errors never escalate state
//! - **Offline-tolerant**: trusted time falls back to monotonic
//!   extrapolation from the last anchor
//! - **Host-safe**: an invalid transition panics in debug builds and is
//!   ignored in release builds

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod clock;
pub mod config;
pub mod error;
pub mod escalation;
pub mod exam;
pub mod fingerprint;
pub mod host;
pub mod ledger;
pub mod monitor;
pub mod report;
pub mod repository;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod tamper;
pub mod throttle;
pub mod time_integrity;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DriftThresholds, EnforcementPolicy, ExamConfig, MonitorConfig, TamperConfig, ThrottleConfig,
};
pub use error::MonitorError;
pub use escalation::{EscalationEngine, EscalationInputs, Transition, TransitionCause};
pub use exam::{ExamFinding, ExamMonitor};
pub use fingerprint::{
    ConsistencyReport, DeviceFingerprint, EnvironmentComponents, EnvironmentProbe,
    FingerprintGenerator, FingerprintScheme, HostEnvironment, SystemEnvironment,
};
pub use host::{
    HostNotifier, NavigationControl, NoopHost, ReportSink, SubscriptionRecords, WarningAction,
};
pub use ledger::{audit, AuditReport, LoadReport, ViolationLedger};
pub use monitor::{CheckTrigger, CycleOutcome, MonitorDeps, SecurityMonitor};
pub use report::{ReportQueue, SecurityReport};
pub use repository::{SecurityRepository, StateRecord};
pub use scheduler::{
    CheckScheduler, IntervalScheduler, ManualScheduler, MonitorDriver, MonitorHandle,
    MonitorSignal, SchedulerControl, SchedulerHandle,
};
pub use security::{constant_time_eq, sha256_hex};
pub use session::{SessionFinding, SessionHeartbeat, SessionRegistry};
pub use tamper::{PaymentGate, TamperFinding, TamperHeuristics};
pub use throttle::NotificationThrottle;
#[cfg(feature = "http-time")]
pub use time_integrity::HttpDateTimeSource;
pub use time_integrity::{
    DriftReading, DriftSource, FixedTimeSource, TimeIntegrityChecker, TrustedTimeSource,
    UnavailableTimeSource,
};
pub use types::{
    DriftClassification, EnforcementAction, EventCategory, MonitorStatus, NotificationCategory,
    PaymentRecord, PaymentStatus, SecurityEvent, SecurityEventType, SecurityState,
    SubscriptionPlan, SubscriptionSnapshot, TrialRecord,
};
