//! Subcommand implementations. Each returns the text to print so the
//! commands can be exercised without a terminal.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context};
use examguard_core::repository::keys;
use examguard_core::{
    audit, Clock, CycleOutcome, DeviceFingerprint, FingerprintGenerator, MonitorConfig,
    MonitorDeps, MonitorStatus, SecurityEvent, SecurityMonitor, SecurityRepository,
    SystemEnvironment, TrustedTimeSource, ViolationLedger,
};
use examguard_store::KeyValueStore;
use tracing::info;

use crate::OutputFormat;

fn timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}

fn loaded_ledger(
    repo: &SecurityRepository,
    clock: Arc<dyn Clock>,
    config: &MonitorConfig,
) -> anyhow::Result<ViolationLedger> {
    let mut ledger = ViolationLedger::new(repo.clone(), clock, config.ledger_capacity);
    let report = ledger.load().context("reading ledger")?;
    if !report.rejected.is_empty() {
        info!(rejected = report.rejected.len(), "Skipped records with invalid seals");
    }
    Ok(ledger)
}

/// Persisted status, read without starting a monitor.
pub fn status(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: &MonitorConfig,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let repo = SecurityRepository::new(store);
    let ledger = loaded_ledger(&repo, clock, config)?;
    let record = repo.load_state().context("reading state")?;
    let fingerprint = repo
        .load_json::<DeviceFingerprint>(keys::FINGERPRINT_ID)
        .context("reading fingerprint")?;

    let state = record.as_ref().map(|r| r.state).unwrap_or_default();
    let status = MonitorStatus {
        state,
        device_fingerprint: fingerprint.map(|f| f.to_string()),
        violation_count: ledger.count_all_in_window(config.policy.violation_window),
        last_check_ms: None,
        enforcement: state.enforcement_action(),
    };

    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(&status)?);
    }

    let mut out = String::new();
    writeln!(out, "State:        {}", status.state)?;
    writeln!(out, "Enforcement:  {:?}", status.enforcement)?;
    writeln!(
        out,
        "Fingerprint:  {}",
        status.device_fingerprint.as_deref().unwrap_or("-")
    )?;
    writeln!(
        out,
        "Violations:   {} (window {}h)",
        status.violation_count,
        config.policy.violation_window.as_secs() / 3600
    )?;
    if let Some(record) = &record {
        writeln!(out, "Since:        {}", timestamp(record.since_ms))?;
    }
    if let Some(reset_at) = ledger.reset_at_ms() {
        writeln!(out, "Last unlock:  {}", timestamp(reset_at))?;
    }
    writeln!(out, "Ledger:       {} / {}", ledger.len(), ledger.capacity())?;
    Ok(out)
}

/// Most recent ledger events.
pub fn events(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: &MonitorConfig,
    limit: usize,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let repo = SecurityRepository::new(store);
    let events: Vec<SecurityEvent> = loaded_ledger(&repo, clock, config)?.recent(limit);

    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(&events)?);
    }

    let mut out = String::new();
    writeln!(out, "{:<22} {:<22} {}", "Time", "Type", "Payload")?;
    writeln!(out, "{}", "-".repeat(80))?;
    for event in &events {
        writeln!(
            out,
            "{:<22} {:<22} {}",
            timestamp(event.timestamp_ms),
            event.event_type,
            event.payload
        )?;
    }
    write!(out, "\nTotal: {} events", events.len())?;
    Ok(out)
}

/// Verify every persisted ledger seal. Fails if any record is invalid.
pub fn audit_ledger(store: Arc<dyn KeyValueStore>, format: OutputFormat) -> anyhow::Result<String> {
    let report = audit(&SecurityRepository::new(store)).context("auditing ledger")?;

    let out = if format == OutputFormat::Json {
        serde_json::to_string_pretty(&report)?
    } else {
        let mut out = format!(
            "Records: {}\nValid:   {}\nInvalid: {}",
            report.total,
            report.valid,
            report.invalid.len()
        );
        for key in &report.invalid {
            write!(out, "\n  {key}")?;
        }
        out
    };

    if !report.is_clean() {
        bail!("{out}\n\n{} ledger records failed seal verification", report.invalid.len());
    }
    Ok(out)
}

fn monitor(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    time_source: Option<Arc<dyn TrustedTimeSource>>,
) -> anyhow::Result<SecurityMonitor> {
    let mut deps = MonitorDeps::new(store, clock).with_environment(Arc::new(SystemEnvironment));
    if let Some(source) = time_source {
        deps = deps.with_time_source(source);
    }
    let mut monitor = SecurityMonitor::new(config, deps).context("invalid configuration")?;
    monitor.initialize();
    Ok(monitor)
}

/// Clear the state with an administrative token.
pub fn unlock(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    token: &str,
) -> anyhow::Result<String> {
    if config.policy.unlock_token_sha256.is_none() {
        bail!("no unlock digest configured (set policy.unlock_token_sha256)");
    }
    let mut monitor = monitor(store, clock, config, None)?;
    let status = monitor.unlock(token).context("unlock failed")?;
    Ok(format!("Unlocked. State: {}", status.state))
}

/// Run one check cycle and report what it found.
pub async fn check(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    time_source: Option<Arc<dyn TrustedTimeSource>>,
    format: OutputFormat,
) -> anyhow::Result<String> {
    let mut monitor = monitor(store, clock, config, time_source)?;
    let outcome: CycleOutcome = monitor.run_check_cycle().await?;
    monitor.dispose();

    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(&outcome)?);
    }

    let mut out = String::new();
    match outcome.drift {
        Some(reading) => writeln!(
            out,
            "Drift:        {} ms ({:?}, {:?})",
            reading.drift_ms, reading.classification, reading.source
        )?,
        None => writeln!(out, "Drift:        unavailable")?,
    }
    let recorded: Vec<String> = outcome.recorded.iter().map(ToString::to_string).collect();
    writeln!(
        out,
        "Recorded:     {}",
        if recorded.is_empty() { "-".to_string() } else { recorded.join(", ") }
    )?;
    if let Some(transition) = outcome.transition {
        writeln!(
            out,
            "Transition:   {} -> {} ({})",
            transition.from, transition.to, transition.cause
        )?;
    }
    write!(out, "State:        {}", outcome.status.state)?;
    Ok(out)
}

/// Delete the stored fingerprint and derive a new one from this host.
pub fn reset_fingerprint(
    store: Arc<dyn KeyValueStore>,
    config: &MonitorConfig,
) -> anyhow::Result<String> {
    let generator = FingerprintGenerator::new(
        SecurityRepository::new(store),
        Arc::new(SystemEnvironment),
        config.fingerprint_scheme,
    );
    generator.reset()?;
    let fingerprint = generator.get_or_create()?;
    Ok(fingerprint.to_string())
}
