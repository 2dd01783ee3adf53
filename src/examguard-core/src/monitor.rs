//! The integrity monitor.
//!
//! [`SecurityMonitor`] owns every detector, the ledger and the current
//! state. Hosts construct one per session (several may coexist), call
//! [`initialize`](SecurityMonitor::initialize), and then drive it with
//! [`run_check_cycle`](SecurityMonitor::run_check_cycle) and the signal
//! methods, directly or through [`crate::scheduler::MonitorDriver`].
//!
//! One cycle:
//!
//! ```text
//!   time check (gated) ─┐
//!   fingerprint drift ──┤
//!   tamper heuristics ──┼──► ledger.record() ──► escalation ──► enforcement
//!   session registry ───┤                              │
//!   exam signals ───────┘                              └──► throttle ──► warning
//! ```
//!
//! Every detector failure is logged and treated as "no observation".

use std::sync::Arc;
use std::time::Duration;

use examguard_store::KeyValueStore;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::escalation::{self, EscalationEngine, EscalationInputs, Transition, TransitionCause};
use crate::exam::ExamMonitor;
use crate::fingerprint::{
    ConsistencyReport, DeviceFingerprint, EnvironmentProbe, FingerprintGenerator, SystemEnvironment,
};
use crate::host::{
    HostNotifier, NavigationControl, NoopHost, ReportSink, SubscriptionRecords, WarningAction,
};
use crate::ledger::{LoadReport, ViolationLedger};
use crate::report::{ReportQueue, SecurityReport};
use crate::repository::{keys, SecurityRepository, StateRecord};
use crate::security::{random_id, verify_admin_token};
use crate::session::SessionRegistry;
use crate::tamper::{EvidenceLog, PaymentGate, TamperHeuristics};
use crate::throttle::NotificationThrottle;
use crate::time_integrity::{
    DriftReading, TimeIntegrityChecker, TrustedTimeSource, UnavailableTimeSource,
};
use crate::types::{
    DriftClassification, EnforcementAction, MonitorStatus, NotificationCategory, SecurityEvent,
    SecurityEventType, SecurityState,
};

/// Fingerprint stamped on events recorded before one could be derived.
const UNKNOWN_FINGERPRINT: &str = "unknown";

/// Collaborators injected into a monitor.
#[derive(Clone)]
pub struct MonitorDeps {
    /// Persistent store.
    pub store: Arc<dyn KeyValueStore>,
    /// Local and monotonic clock.
    pub clock: Arc<dyn Clock>,
    /// Trusted time reference.
    pub time_source: Arc<dyn TrustedTimeSource>,
    /// Environment probe for the fingerprint.
    pub environment: Arc<dyn EnvironmentProbe>,
    /// Subscription, payment and trial records.
    pub records: Arc<dyn SubscriptionRecords>,
    /// Warning presenter.
    pub notifier: Arc<dyn HostNotifier>,
    /// Navigation control.
    pub navigation: Arc<dyn NavigationControl>,
    /// Report destination, if the host has one.
    pub report_sink: Option<Arc<dyn ReportSink>>,
}

impl MonitorDeps {
    /// Dependencies with inert defaults: no trusted time, no records, no UI.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            time_source: Arc::new(UnavailableTimeSource),
            environment: Arc::new(SystemEnvironment),
            records: Arc::new(NoopHost),
            notifier: Arc::new(NoopHost),
            navigation: Arc::new(NoopHost),
            report_sink: None,
        }
    }

    /// Use a trusted time source.
    #[must_use]
    pub fn with_time_source(mut self, source: Arc<dyn TrustedTimeSource>) -> Self {
        self.time_source = source;
        self
    }

    /// Use an environment probe.
    #[must_use]
    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentProbe>) -> Self {
        self.environment = environment;
        self
    }

    /// Use subscription records.
    #[must_use]
    pub fn with_records(mut self, records: Arc<dyn SubscriptionRecords>) -> Self {
        self.records = records;
        self
    }

    /// Use a notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn HostNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Use navigation control.
    #[must_use]
    pub fn with_navigation(mut self, navigation: Arc<dyn NavigationControl>) -> Self {
        self.navigation = navigation;
        self
    }

    /// Use a report sink.
    #[must_use]
    pub fn with_report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report_sink = Some(sink);
        self
    }
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTrigger {
    /// Scheduler tick.
    Periodic,
    /// Page visibility changed.
    Visibility,
    /// Connectivity changed.
    Network,
    /// Another context wrote to the store.
    StorageChange,
    /// Exam heartbeat or answer.
    Exam,
    /// Host-reported violation.
    External,
    /// Payment attempt.
    Payment,
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleOutcome {
    /// What started the cycle.
    pub trigger: CheckTrigger,
    /// Drift reading taken this cycle, if any.
    pub drift: Option<DriftReading>,
    /// Event types recorded this cycle.
    pub recorded: Vec<SecurityEventType>,
    /// Transition applied, if any.
    pub transition: Option<Transition>,
    /// Warning presented, if the throttle allowed one.
    pub warning: Option<NotificationCategory>,
    /// Status after the cycle.
    pub status: MonitorStatus,
}

/// Client-resident integrity monitor.
pub struct SecurityMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    records: Arc<dyn SubscriptionRecords>,
    notifier: Arc<dyn HostNotifier>,
    navigation: Arc<dyn NavigationControl>,
    report_sink: Option<Arc<dyn ReportSink>>,
    repo: SecurityRepository,

    fingerprints: FingerprintGenerator,
    ledger: ViolationLedger,
    time: TimeIntegrityChecker,
    escalation: EscalationEngine,
    throttle: NotificationThrottle,
    tamper: TamperHeuristics,
    exam: ExamMonitor,
    sessions: SessionRegistry,
    reports: ReportQueue,
    evidence: EvidenceLog,

    fingerprint: Option<DeviceFingerprint>,
    state: SecurityState,
    state_since_ms: i64,
    applied_restriction: Option<EnforcementAction>,
    initialized: bool,
    ledger_loaded: bool,
    online: bool,
    reports_pending: bool,
    last_check_ms: Option<i64>,
    last_time_check_mono: Option<u64>,
}

impl SecurityMonitor {
    /// Construct a monitor. Nothing is read until [`initialize`](Self::initialize).
    pub fn new(config: MonitorConfig, deps: MonitorDeps) -> Result<Self, MonitorError> {
        config.validate()?;

        let repo = SecurityRepository::new(deps.store);
        let clock = deps.clock;
        let session_id = config.session_id.clone().unwrap_or_else(random_id);

        Ok(Self {
            fingerprints: FingerprintGenerator::new(
                repo.clone(),
                deps.environment,
                config.fingerprint_scheme,
            )
            .with_tolerance(config.fingerprint_tolerance),
            ledger: ViolationLedger::new(repo.clone(), clock.clone(), config.ledger_capacity),
            time: TimeIntegrityChecker::new(
                repo.clone(),
                clock.clone(),
                deps.time_source,
                config.drift.clone(),
                config.trusted_time_timeout,
            ),
            escalation: EscalationEngine::new(config.policy.clone()),
            throttle: NotificationThrottle::new(repo.clone(), clock.clone(), &config.throttle),
            tamper: TamperHeuristics::new(repo.clone(), clock.clone(), config.tamper.clone()),
            exam: ExamMonitor::new(clock.clone(), config.exam.clone()),
            sessions: SessionRegistry::new(
                repo.clone(),
                clock.clone(),
                session_id,
                config.account_id.clone(),
                config.session_ttl,
                config.policy.session_threshold,
            ),
            reports: ReportQueue::new(repo.clone()),
            evidence: EvidenceLog::new(repo.clone()),
            records: deps.records,
            notifier: deps.notifier,
            navigation: deps.navigation,
            report_sink: deps.report_sink,
            repo,
            clock,
            config,
            fingerprint: None,
            state: SecurityState::Normal,
            state_since_ms: 0,
            applied_restriction: None,
            initialized: false,
            ledger_loaded: false,
            online: true,
            reports_pending: false,
            last_check_ms: None,
            last_time_check_mono: None,
        })
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Load persisted state and apply its enforcement.
    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> MonitorStatus {
        self.ensure_fingerprint();
        self.load_ledger();

        self.state_since_ms = self.clock.now_ms();
        match self.repo.load_state() {
            Ok(Some(record)) => self.adopt_state(record, &mut Vec::new()),
            Ok(None) => {},
            Err(e) => warn!(error = %e, "State unreadable, starting NORMAL"),
        }
        if let Err(e) = self.throttle.load() {
            warn!(error = %e, "Throttle records unreadable");
        }
        self.reports_pending = self.reports.len().map(|n| n > 0).unwrap_or(false);

        self.enforce();
        self.initialized = true;
        info!(
            state = %self.state,
            session_id = self.sessions.session_id(),
            "Security monitor initialized"
        );
        self.get_status()
    }

    /// Stop monitoring this session. Persisted state is kept.
    pub fn dispose(&mut self) {
        if !self.initialized {
            return;
        }
        if let Err(e) = self.sessions.end() {
            debug!(error = %e, "Failed to remove session heartbeat");
        }
        if self.exam.end_exam().is_some() {
            self.throttle.set_exam_active(false);
        }
        self.initialized = false;
        info!(session_id = self.sessions.session_id(), "Security monitor disposed");
    }

    /// Whether [`initialize`](Self::initialize) has run.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn ensure_initialized(&self) -> Result<(), MonitorError> {
        if self.initialized {
            Ok(())
        } else {
            Err(MonitorError::NotInitialized)
        }
    }

    fn ensure_fingerprint(&mut self) {
        if self.fingerprint.is_some() {
            return;
        }
        match self.fingerprints.get_or_create() {
            Ok(fp) => self.fingerprint = Some(fp),
            Err(e) => warn!(error = %e, "Device fingerprint unavailable"),
        }
    }

    fn load_ledger(&mut self) {
        match self.ledger.load() {
            Ok(report) => {
                self.ledger_loaded = true;
                self.note_rejected_records(&report);
            },
            Err(e) => warn!(error = %e, "Ledger unreadable, retrying next cycle"),
        }
    }

    fn note_rejected_records(&mut self, report: &LoadReport) {
        if report.rejected.is_empty() {
            return;
        }
        let evidence = report.rejected.join(",");
        if self.evidence.first_sighting("storage_tamper", &evidence) {
            let payload = serde_json::json!({
                "rejected": report.rejected.len(),
                "keys": report.rejected,
            });
            let mut recorded = Vec::new();
            self.record(SecurityEventType::StorageTamper, payload, &mut recorded);
        }
    }

    // =========================================================================
    // CHECK CYCLE
    // =========================================================================

    /// Run one periodic check.
    pub async fn run_check_cycle(&mut self) -> Result<CycleOutcome, MonitorError> {
        self.run(CheckTrigger::Periodic, false).await
    }

    #[instrument(skip(self))]
    async fn run(
        &mut self,
        trigger: CheckTrigger,
        force_time_check: bool,
    ) -> Result<CycleOutcome, MonitorError> {
        self.ensure_initialized()?;
        self.ensure_fingerprint();
        if !self.ledger_loaded {
            self.load_ledger();
        }

        let mut recorded = Vec::new();

        let drift = if force_time_check || self.time_check_due() {
            self.last_time_check_mono = Some(self.clock.monotonic_ms());
            let check = self.time.check().await;
            if let Some(finding) = check.finding {
                self.record(finding.event_type, finding.payload, &mut recorded);
            }
            check.reading
        } else {
            None
        };

        self.check_fingerprint(&mut recorded);

        for finding in self.tamper.evaluate(self.records.as_ref()) {
            self.record(finding.event_type(), finding.payload(), &mut recorded);
        }

        self.check_sessions(&mut recorded);

        let outcome = self.settle(trigger, drift, recorded);
        self.flush_reports().await;
        Ok(outcome)
    }

    fn time_check_due(&self) -> bool {
        let interval = u64::try_from(self.config.time_check_interval.as_millis()).unwrap_or(u64::MAX);
        self.last_time_check_mono
            .map_or(true, |last| self.clock.monotonic_ms().saturating_sub(last) >= interval)
    }

    fn check_fingerprint(&mut self, recorded: &mut Vec<SecurityEventType>) {
        let report: ConsistencyReport = match self.fingerprints.verify_consistency() {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "Fingerprint consistency unavailable");
                return;
            },
        };
        if report.matches {
            return;
        }
        let Ok(current) = self.fingerprints.current_components() else {
            return;
        };
        let evidence = self.fingerprints.derive(&current).to_string();
        if self.evidence.first_sighting("fingerprint_mismatch", &evidence) {
            warn!(
                mismatch_count = report.mismatch_count,
                fields = ?report.mismatched_fields,
                "Environment no longer matches device fingerprint"
            );
            let payload = serde_json::json!({
                "mismatch_count": report.mismatch_count,
                "fields": report.mismatched_fields,
            });
            self.record(SecurityEventType::FingerprintMismatch, payload, recorded);
        }
    }

    fn check_sessions(&mut self, recorded: &mut Vec<SecurityEventType>) {
        let fingerprint = self.fingerprint_str().to_string();
        if let Err(e) = self.sessions.heartbeat(&fingerprint) {
            debug!(error = %e, "Session heartbeat not written");
        }
        match self.sessions.check() {
            Ok(Some(finding)) => {
                let payload = serde_json::to_value(&finding).unwrap_or_default();
                self.record(SecurityEventType::MultiDeviceSession, payload, recorded);
            },
            Ok(None) => {},
            Err(e) => debug!(error = %e, "Session registry unavailable"),
        }
    }

    fn fingerprint_str(&self) -> &str {
        self.fingerprint
            .as_ref()
            .map_or(UNKNOWN_FINGERPRINT, DeviceFingerprint::as_str)
    }

    /// Append an event. A persistence failure keeps the in-memory append.
    fn record(
        &mut self,
        event_type: SecurityEventType,
        payload: serde_json::Value,
        recorded: &mut Vec<SecurityEventType>,
    ) {
        let event = SecurityEvent::new(
            event_type,
            self.clock.now_ms(),
            payload,
            self.fingerprint_str(),
        );
        if let Err(e) = self.ledger.record(event) {
            warn!(event_type = %event_type, error = %e, "Event not persisted");
        }
        recorded.push(event_type);
    }

    /// Re-evaluate state, notify, and build the outcome.
    fn settle(
        &mut self,
        trigger: CheckTrigger,
        drift: Option<DriftReading>,
        recorded: Vec<SecurityEventType>,
    ) -> CycleOutcome {
        let transition = self.reevaluate(drift.map(|r| r.classification));
        let warning = self.notify();
        self.last_check_ms = Some(self.clock.now_ms());

        CycleOutcome {
            trigger,
            drift,
            recorded,
            transition,
            warning,
            status: self.get_status(),
        }
    }

    fn reevaluate(
        &mut self,
        drift: Option<DriftClassification>,
    ) -> Option<Transition> {
        let inputs = EscalationInputs::from_ledger(&self.ledger, self.escalation.policy(), drift);
        let transition = self.escalation.evaluate(self.state, &inputs)?;
        let transition = escalation::checked(transition)?;
        self.apply(transition);
        Some(transition)
    }

    fn apply(&mut self, transition: Transition) {
        match transition.to {
            SecurityState::Locked | SecurityState::Suspicious => warn!(
                from = %transition.from,
                to = %transition.to,
                cause = %transition.cause,
                "Security state escalated"
            ),
            _ => info!(
                from = %transition.from,
                to = %transition.to,
                cause = %transition.cause,
                "Security state changed"
            ),
        }

        self.state = transition.to;
        self.state_since_ms = self.clock.now_ms();
        self.persist_state();
        self.enforce();

        if transition.to == SecurityState::Suspicious {
            let report = SecurityReport::new(
                self.clock.now_ms(),
                transition.cause.to_string(),
                self.get_status(),
                self.ledger.recent(50),
            );
            match self.reports.enqueue(&report) {
                Ok(()) => self.reports_pending = true,
                Err(e) => warn!(error = %e, "Security report not queued"),
            }
        }
    }

    fn persist_state(&self) {
        let record = StateRecord::new(self.state, self.state_since_ms, self.ledger.reset_at_ms());
        if let Err(e) = self.repo.save_state(&record) {
            warn!(error = %e, "Security state not persisted");
        }
    }

    /// Take over a persisted state record written by another context or an
    /// earlier run.
    ///
    /// Escalations are adopted. A de-escalation is adopted only when it is
    /// the NORMAL written by an unlock whose watermark is the one in the
    /// store. A record with a broken seal, or one that lowers SUSPICIOUS or
    /// LOCKED any other way, is recorded as storage tampering.
    fn adopt_state(&mut self, record: StateRecord, recorded: &mut Vec<SecurityEventType>) {
        if !record.verify_seal() {
            self.state_tampered(&record, "seal_mismatch", recorded);
            return;
        }
        if record.state == self.state {
            return;
        }
        if record.state.severity() > self.state.severity() {
            info!(from = %self.state, to = %record.state, "Adopting state from another context");
            self.state = record.state;
            self.state_since_ms = record.since_ms;
            self.enforce();
            return;
        }
        if record.state == SecurityState::Normal && self.unlocked_elsewhere(&record) {
            info!(from = %self.state, "Adopting unlock from another context");
            self.load_ledger();
            self.state = SecurityState::Normal;
            self.state_since_ms = record.since_ms;
            self.enforce();
            return;
        }
        if self.state.severity() >= SecurityState::Suspicious.severity() {
            self.state_tampered(&record, "unauthorized_downgrade", recorded);
        } else {
            debug!(
                current = %self.state,
                stored = %record.state,
                "Keeping own state until the next drift reading"
            );
        }
    }

    fn unlocked_elsewhere(&self, record: &StateRecord) -> bool {
        let Some(watermark) = record.reset_at_ms else {
            return false;
        };
        let stored = self.repo.load_reset_at().unwrap_or_else(|e| {
            debug!(error = %e, "Counter watermark unreadable");
            None
        });
        stored == Some(watermark) && watermark >= self.state_since_ms
    }

    fn state_tampered(
        &mut self,
        record: &StateRecord,
        reason: &str,
        recorded: &mut Vec<SecurityEventType>,
    ) {
        warn!(stored = %record.state, current = %self.state, reason, "Rejecting state record");
        let evidence = format!("{reason}:{}:{}:{}", record.state, record.since_ms, record.seal);
        if self.evidence.first_sighting("state_tamper", &evidence) {
            let payload = serde_json::json!({
                "key": keys::STATE,
                "reason": reason,
                "stored_state": record.state,
            });
            self.record(SecurityEventType::StorageTamper, payload, recorded);
        }

        if self.state.severity() < SecurityState::Suspicious.severity() {
            let transition = Transition {
                from: self.state,
                to: SecurityState::Suspicious,
                cause: TransitionCause::StorageTamper,
            };
            if let Some(transition) = escalation::checked(transition) {
                self.apply(transition);
            }
        } else {
            self.persist_state();
        }
    }

    /// Apply the navigation side of the current enforcement action.
    fn enforce(&mut self) {
        let action = self.state.enforcement_action();
        let wanted = action.restricts_navigation().then_some(action);
        if wanted == self.applied_restriction {
            return;
        }
        match action {
            EnforcementAction::RestrictToSafePages => {
                self.navigation.restrict_to(&self.config.safe_pages);
            },
            EnforcementAction::DenyAllExceptUnlock => {
                self.navigation.restrict_to(&self.config.unlock_pages);
            },
            _ => self.navigation.lift_restriction(),
        }
        self.applied_restriction = wanted;
    }

    /// Show the current state's warning if the throttle allows it.
    fn notify(&mut self) -> Option<NotificationCategory> {
        let category = NotificationCategory::for_state(self.state)?;
        self.present(category).then_some(category)
    }

    fn present(&mut self, category: NotificationCategory) -> bool {
        if !self.throttle.admit(category) {
            return false;
        }
        let (message, actions) = WarningAction::for_category(category);
        self.notifier.present_warning(category, message, actions);
        true
    }

    async fn flush_reports(&mut self) {
        if !(self.online && self.reports_pending) {
            return;
        }
        let Some(sink) = self.report_sink.clone() else {
            return;
        };
        match self
            .reports
            .flush(sink.as_ref(), self.config.trusted_time_timeout)
            .await
        {
            Ok(_) => {
                self.reports_pending = self.reports.len().map(|n| n > 0).unwrap_or(true);
            },
            Err(e) => debug!(error = %e, "Report queue unavailable"),
        }
    }

    // =========================================================================
    // SIGNALS
    // =========================================================================

    /// Page visibility changed. Becoming visible forces a time check.
    pub async fn on_visibility_change(&mut self, visible: bool) -> Result<CycleOutcome, MonitorError> {
        self.ensure_initialized()?;
        let mut recorded = Vec::new();
        if let Some(finding) = self.exam.on_visibility_change(visible) {
            self.record(SecurityEventType::ExamAnomaly, finding.payload(), &mut recorded);
        }
        if !visible {
            return Ok(self.settle(CheckTrigger::Visibility, None, recorded));
        }
        let mut outcome = self.run(CheckTrigger::Visibility, true).await?;
        recorded.append(&mut outcome.recorded);
        outcome.recorded = recorded;
        Ok(outcome)
    }

    /// Connectivity changed. Coming online forces a time check and flushes
    /// queued reports.
    pub async fn on_network_change(&mut self, online: bool) -> Result<CycleOutcome, MonitorError> {
        self.ensure_initialized()?;
        self.online = online;
        self.time.set_online(online);
        if online {
            self.run(CheckTrigger::Network, true).await
        } else {
            Ok(self.settle(CheckTrigger::Network, None, Vec::new()))
        }
    }

    /// Another context wrote `key`. Reloads the affected records and
    /// re-evaluates.
    pub fn on_storage_change(&mut self, key: &str) -> Result<CycleOutcome, MonitorError> {
        self.ensure_initialized()?;
        let mut recorded = Vec::new();

        if key.starts_with(keys::LEDGER_EVENT_PREFIX) || key == keys::LEDGER_RESET_AT {
            self.load_ledger();
        } else if key == keys::STATE {
            match self.repo.load_state() {
                Ok(Some(record)) => self.adopt_state(record, &mut recorded),
                Ok(None) => {},
                Err(e) => debug!(error = %e, "State unreadable"),
            }
        } else if key.starts_with(keys::THROTTLE_PREFIX) {
            if let Err(e) = self.throttle.load() {
                debug!(error = %e, "Throttle records unreadable");
            }
        } else if key == keys::FINGERPRINT_ID {
            self.fingerprint = None;
            self.ensure_fingerprint();
        } else if !key.starts_with(keys::ROOT) {
            debug!(key, "Ignoring foreign storage change");
        }

        Ok(self.settle(CheckTrigger::StorageChange, None, recorded))
    }

    /// Record a violation detected by the host.
    pub fn record_external_violation(
        &mut self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<CycleOutcome, MonitorError> {
        self.ensure_initialized()?;
        let mut recorded = Vec::new();
        let payload = serde_json::json!({ "kind": kind, "details": payload });
        self.record(SecurityEventType::External, payload, &mut recorded);
        Ok(self.settle(CheckTrigger::External, None, recorded))
    }

    /// Record a payment attempt. Returns the cooldown the host should apply.
    pub fn record_payment_attempt(&mut self) -> Result<PaymentGate, MonitorError> {
        self.ensure_initialized()?;
        let (gate, finding) = self.tamper.record_payment_attempt()?;
        if let Some(finding) = finding {
            let mut recorded = Vec::new();
            self.record(finding.event_type(), finding.payload(), &mut recorded);
            self.settle(CheckTrigger::Payment, None, recorded);
        }
        if let PaymentGate::CoolDown(wait) = gate {
            debug!(wait_ms = wait.as_millis() as u64, "Payment cooldown");
            self.present(NotificationCategory::Payment);
        }
        Ok(gate)
    }

    /// Mark a payment/subscription flow active, silencing warnings.
    pub fn set_payment_flow_active(&mut self, active: bool) {
        self.throttle.set_payment_flow_active(active);
    }

    // =========================================================================
    // EXAM SESSION
    // =========================================================================

    /// Begin an exam. Warnings are silenced until it ends.
    pub fn start_exam(&mut self, exam_id: &str) {
        self.exam.start_exam(exam_id);
        self.throttle.set_exam_active(true);
    }

    /// End the active exam.
    pub fn end_exam(&mut self) -> Option<String> {
        self.throttle.set_exam_active(false);
        self.exam.end_exam()
    }

    /// Process an exam heartbeat.
    pub fn on_exam_heartbeat(&mut self) -> Result<CycleOutcome, MonitorError> {
        self.ensure_initialized()?;
        let mut recorded = Vec::new();
        for finding in self.exam.on_heartbeat() {
            self.record(SecurityEventType::ExamAnomaly, finding.payload(), &mut recorded);
        }
        Ok(self.settle(CheckTrigger::Exam, None, recorded))
    }

    /// Process an answer submitted after `elapsed` on the question.
    pub fn record_answer(
        &mut self,
        question_id: &str,
        elapsed: Duration,
    ) -> Result<Option<CycleOutcome>, MonitorError> {
        self.ensure_initialized()?;
        let Some(finding) = self.exam.record_answer(question_id, elapsed) else {
            return Ok(None);
        };
        let mut recorded = Vec::new();
        self.record(SecurityEventType::ExamAnomaly, finding.payload(), &mut recorded);
        Ok(Some(self.settle(CheckTrigger::Exam, None, recorded)))
    }

    // =========================================================================
    // ADMINISTRATION
    // =========================================================================

    /// Clear any state with an administrative token.
    ///
    /// On success the state returns to NORMAL, the violation counters are
    /// reset (the ledger itself is kept) and navigation is released. A
    /// rejected token changes nothing.
    pub fn unlock(&mut self, admin_token: &str) -> Result<MonitorStatus, MonitorError> {
        self.ensure_initialized()?;

        let verified = self
            .config
            .policy
            .unlock_token_sha256
            .as_deref()
            .is_some_and(|digest| verify_admin_token(admin_token, digest));
        if !verified {
            warn!(state = %self.state, "Unlock rejected");
            return Err(MonitorError::UnlockRejected);
        }

        let now = self.clock.now_ms();
        if let Err(e) = self.ledger.reset_counters(now) {
            warn!(error = %e, "Counter watermark not persisted");
        }
        if self.state != SecurityState::Normal {
            if let Some(transition) = escalation::checked(EscalationEngine::unlock_transition(self.state)) {
                self.apply(transition);
            }
        }
        info!("Security monitor unlocked");
        Ok(self.get_status())
    }

    /// Delete the stored fingerprint and derive a new one.
    pub fn reset_fingerprint(&mut self) -> Result<DeviceFingerprint, MonitorError> {
        self.fingerprints.reset()?;
        self.fingerprint = None;
        let fingerprint = self.fingerprints.get_or_create()?;
        self.fingerprint = Some(fingerprint.clone());
        Ok(fingerprint)
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Current status.
    pub fn get_status(&self) -> MonitorStatus {
        MonitorStatus {
            state: self.state,
            device_fingerprint: self.fingerprint.as_ref().map(ToString::to_string),
            violation_count: self
                .ledger
                .count_all_in_window(self.config.policy.violation_window),
            last_check_ms: self.last_check_ms,
            enforcement: self.state.enforcement_action(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SecurityState {
        self.state
    }

    /// Up to `limit` recent events, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<SecurityEvent> {
        self.ledger.recent(limit)
    }

    /// Events of `event_type` within `window`.
    pub fn count_in_window(&self, event_type: SecurityEventType, window: Duration) -> usize {
        self.ledger.count_in_window(event_type, window)
    }

    /// Build a report of the current status and recent events.
    pub fn export_report(&self, limit: usize) -> SecurityReport {
        SecurityReport::new(
            self.clock.now_ms(),
            "export",
            self.get_status(),
            self.ledger.recent(limit),
        )
    }

    /// Configuration in force.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}
