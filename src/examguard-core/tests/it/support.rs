//! Shared fixtures: a recording host, a trusted time source that follows a
//! manual clock, and a harness that wires them into a monitor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use examguard_core::{
    EnvironmentComponents, HostEnvironment, HostNotifier, ManualClock, MonitorConfig, MonitorDeps,
    MonitorError, NavigationControl, NotificationCategory, PaymentRecord, ReportSink,
    SecurityMonitor, SecurityReport, SubscriptionRecords, SubscriptionSnapshot, TrialRecord,
    TrustedTimeSource, WarningAction, sha256_hex,
};
use examguard_store::MemoryStore;

/// 2025-01-27T00:00:00Z
pub const START_MS: i64 = 1_737_936_000_000;
pub const MINUTE: Duration = Duration::from_secs(60);
pub const ADMIN_TOKEN: &str = "proctor-override-7731";

pub fn admin_digest() -> String {
    sha256_hex(ADMIN_TOKEN.as_bytes())
}

pub fn minutes_ms(minutes: i64) -> i64 {
    minutes * 60 * 1000
}

/// Host that records everything the monitor asks of it.
#[derive(Default)]
pub struct RecordingHost {
    pub warnings: Mutex<Vec<NotificationCategory>>,
    pub restriction: Mutex<Option<Vec<String>>>,
    pub restrict_calls: AtomicUsize,
    pub subscription: Mutex<Option<SubscriptionSnapshot>>,
    pub payments: Mutex<Vec<PaymentRecord>>,
    pub trial: Mutex<Option<TrialRecord>>,
}

impl RecordingHost {
    pub fn warnings(&self) -> Vec<NotificationCategory> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn restriction(&self) -> Option<Vec<String>> {
        self.restriction.lock().unwrap().clone()
    }

    pub fn set_subscription(&self, snapshot: SubscriptionSnapshot, payments: Vec<PaymentRecord>) {
        *self.subscription.lock().unwrap() = Some(snapshot);
        *self.payments.lock().unwrap() = payments;
    }
}

impl HostNotifier for RecordingHost {
    fn present_warning(&self, category: NotificationCategory, message: &str, actions: &[WarningAction]) {
        assert!(!message.is_empty());
        assert!(!actions.is_empty());
        self.warnings.lock().unwrap().push(category);
    }
}

impl NavigationControl for RecordingHost {
    fn restrict_to(&self, allow_list: &[String]) {
        self.restrict_calls.fetch_add(1, Ordering::SeqCst);
        *self.restriction.lock().unwrap() = Some(allow_list.to_vec());
    }

    fn lift_restriction(&self) {
        *self.restriction.lock().unwrap() = None;
    }
}

impl SubscriptionRecords for RecordingHost {
    fn subscription(&self) -> Result<Option<SubscriptionSnapshot>, MonitorError> {
        Ok(self.subscription.lock().unwrap().clone())
    }

    fn payments(&self) -> Result<Vec<PaymentRecord>, MonitorError> {
        Ok(self.payments.lock().unwrap().clone())
    }

    fn trial(&self) -> Result<Option<TrialRecord>, MonitorError> {
        Ok(self.trial.lock().unwrap().clone())
    }
}

/// Trusted time equal to the manual clock's true time.
pub struct OracleSource {
    clock: Arc<ManualClock>,
    available: AtomicBool,
    pub fetches: AtomicUsize,
}

impl OracleSource {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            available: AtomicBool::new(true),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrustedTimeSource for OracleSource {
    async fn fetch_trusted_time(&self, _timeout: Duration) -> Result<i64, MonitorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(self.clock.true_now_ms())
        } else {
            Err(MonitorError::transient("oracle unreachable"))
        }
    }
}

/// Report sink that keeps what it receives.
#[derive(Default)]
pub struct CollectingSink {
    pub reports: Mutex<Vec<SecurityReport>>,
}

#[async_trait]
impl ReportSink for CollectingSink {
    async fn submit(&self, report: &SecurityReport) -> Result<(), MonitorError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

/// Report sink that never answers.
pub struct StalledSink;

#[async_trait]
impl ReportSink for StalledSink {
    async fn submit(&self, _report: &SecurityReport) -> Result<(), MonitorError> {
        std::future::pending().await
    }
}

pub fn laptop() -> EnvironmentComponents {
    EnvironmentComponents {
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0".into(),
        locale: "en-GB".into(),
        screen_width: 1920,
        screen_height: 1080,
        timezone_offset_minutes: 0,
        hardware_concurrency: 8,
        rendering_hash: "c0ffee01".into(),
        audio_hash: "a11d10".into(),
    }
}

/// A monitor wired to fakes that tests can poke.
pub struct Harness {
    pub monitor: SecurityMonitor,
    pub clock: Arc<ManualClock>,
    pub host: Arc<RecordingHost>,
    pub oracle: Arc<OracleSource>,
    pub environment: Arc<HostEnvironment>,
    pub sink: Arc<CollectingSink>,
    pub store: Arc<MemoryStore>,
}

pub fn config() -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.policy.unlock_token_sha256 = Some(admin_digest());
    config
}

impl Harness {
    pub fn new(config: MonitorConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: MonitorConfig, store: Arc<MemoryStore>) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let host = Arc::new(RecordingHost::default());
        let oracle = Arc::new(OracleSource::new(clock.clone()));
        let environment = Arc::new(HostEnvironment::new(laptop()));
        let sink = Arc::new(CollectingSink::default());

        let deps = MonitorDeps::new(store.clone(), clock.clone())
            .with_time_source(oracle.clone())
            .with_environment(environment.clone())
            .with_records(host.clone())
            .with_notifier(host.clone())
            .with_navigation(host.clone())
            .with_report_sink(sink.clone());
        let mut monitor = SecurityMonitor::new(config, deps).unwrap();
        monitor.initialize();

        Self {
            monitor,
            clock,
            host,
            oracle,
            environment,
            sink,
            store,
        }
    }

    /// Advance past the time-check spacing so the next cycle measures drift.
    pub fn wait_for_time_check(&self) {
        self.clock.advance(self.monitor.config().time_check_interval);
    }
}
