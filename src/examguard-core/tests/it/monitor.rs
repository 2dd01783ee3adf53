//! End-to-end behaviour of `SecurityMonitor` against fake hosts.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use examguard_core::session::SessionHeartbeat;
use examguard_core::{
    Clock, DriftClassification, DriftSource, EnforcementAction, MonitorError, NotificationCategory,
    PaymentGate, PaymentRecord, PaymentStatus, SecurityEventType, SecurityState, StateRecord,
    SubscriptionPlan, SubscriptionSnapshot, TransitionCause,
};
use examguard_store::{KeyValueStore, MemoryStore};

use crate::support::*;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const YEAR_MS: i64 = 365 * DAY_MS;

fn count_of(h: &Harness, event_type: SecurityEventType) -> usize {
    h.monitor
        .recent_events(usize::MAX)
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

fn violate(h: &mut Harness, times: usize) {
    for i in 0..times {
        h.monitor
            .record_external_violation("devtools_open", serde_json::json!({ "n": i }))
            .unwrap();
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_uninitialized_monitor_refuses_work() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(examguard_core::ManualClock::new(START_MS));
    let deps = examguard_core::MonitorDeps::new(store, clock);
    let mut monitor = examguard_core::SecurityMonitor::new(config(), deps).unwrap();

    assert!(matches!(
        monitor.run_check_cycle().await,
        Err(MonitorError::NotInitialized)
    ));
    assert!(matches!(
        monitor.unlock(ADMIN_TOKEN),
        Err(MonitorError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_initial_status() {
    let mut h = Harness::new(config());
    let status = h.monitor.get_status();
    assert_eq!(status.state, SecurityState::Normal);
    assert_eq!(status.violation_count, 0);
    assert!(status.last_check_ms.is_none());
    assert!(status
        .device_fingerprint
        .as_deref()
        .is_some_and(|fp| fp.starts_with("fp2-sha256:")));

    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(outcome.status.last_check_ms, Some(START_MS));
}

#[tokio::test]
async fn test_instances_are_isolated() {
    let mut a = Harness::new(config());
    let b = Harness::new(config());
    violate(&mut a, 10);
    assert_eq!(a.monitor.state(), SecurityState::Locked);
    assert_eq!(b.monitor.state(), SecurityState::Normal);
    assert!(b.host.restriction().is_none());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let store = Arc::new(MemoryStore::new());
    let mut first = Harness::with_store(config(), store.clone());
    violate(&mut first, 10);
    first.monitor.dispose();

    let second = Harness::with_store(config(), store);
    assert_eq!(second.monitor.state(), SecurityState::Locked);
    assert_eq!(
        second.host.restriction(),
        Some(vec!["/unlock".to_string(), "/support".to_string()])
    );
}

// =============================================================================
// Time integrity
// =============================================================================

#[tokio::test]
async fn test_small_drift_is_silent() {
    let mut h = Harness::new(config());
    for minutes in [-5, -3, 0, 2, 5] {
        h.clock.set_skew_ms(minutes_ms(minutes));
        let outcome = h.monitor.on_visibility_change(true).await.unwrap();
        let reading = outcome.drift.unwrap();
        assert_eq!(reading.classification, DriftClassification::Ok, "{minutes} min");
        assert!(outcome.recorded.is_empty());
    }
    assert!(h.monitor.recent_events(10).is_empty());
    assert_eq!(h.monitor.state(), SecurityState::Normal);
}

#[tokio::test]
async fn test_major_drift_then_correction_returns_to_normal() {
    let mut h = Harness::new(config());
    h.clock.set_skew_ms(minutes_ms(45));
    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(outcome.recorded, vec![SecurityEventType::ClockDriftMajor]);
    let transition = outcome.transition.unwrap();
    assert_eq!(transition.to, SecurityState::Warning);
    assert_eq!(transition.cause, TransitionCause::MajorDrift);
    assert_eq!(h.host.warnings(), vec![NotificationCategory::ClockDrift]);

    h.clock.set_skew_ms(0);
    h.wait_for_time_check();
    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert!(outcome.recorded.is_empty());
    assert_eq!(outcome.status.state, SecurityState::Normal);
    assert_eq!(
        outcome.transition.map(|t| t.cause),
        Some(TransitionCause::ClockCorrected)
    );
}

#[tokio::test]
async fn test_steady_minor_skew_never_escalates() {
    let mut h = Harness::new(config());
    h.clock.set_skew_ms(minutes_ms(10));
    for _ in 0..48 {
        let outcome = h.monitor.run_check_cycle().await.unwrap();
        assert_eq!(
            outcome.drift.map(|d| d.classification),
            Some(DriftClassification::Minor)
        );
        h.wait_for_time_check();
    }
    assert_eq!(count_of(&h, SecurityEventType::TimeMismatch), 0);
    assert_eq!(h.monitor.state(), SecurityState::Normal);
}

#[tokio::test]
async fn test_minor_skew_reapplied_after_correction_is_recorded() {
    let mut h = Harness::new(config());
    h.clock.set_skew_ms(minutes_ms(10));
    h.monitor.run_check_cycle().await.unwrap();

    h.clock.set_skew_ms(0);
    h.wait_for_time_check();
    h.monitor.run_check_cycle().await.unwrap();

    h.clock.set_skew_ms(minutes_ms(10));
    h.wait_for_time_check();
    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(outcome.recorded, vec![SecurityEventType::TimeMismatch]);
    assert_eq!(outcome.status.state, SecurityState::Normal);
}

#[tokio::test]
async fn test_repeated_checks_record_one_event_per_episode() {
    let mut h = Harness::new(config());
    h.clock.set_skew_ms(minutes_ms(45));
    for _ in 0..5 {
        h.monitor.on_visibility_change(true).await.unwrap();
        h.clock.advance(MINUTE);
    }
    assert_eq!(count_of(&h, SecurityEventType::ClockDriftMajor), 1);
}

#[tokio::test]
async fn test_extreme_drift_restricts_until_corrected() {
    let mut h = Harness::new(config());
    h.clock.set_skew_ms(minutes_ms(-120));
    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(outcome.status.state, SecurityState::TimeCorrectionNeeded);
    assert_eq!(
        outcome.status.enforcement,
        EnforcementAction::RestrictToSafePages
    );
    assert_eq!(h.host.restriction(), Some(h.monitor.config().safe_pages.clone()));

    h.clock.set_skew_ms(0);
    h.monitor.on_visibility_change(true).await.unwrap();
    assert_eq!(h.monitor.state(), SecurityState::Normal);
    assert!(h.host.restriction().is_none());
}

#[tokio::test]
async fn test_time_check_is_spaced_between_periodic_cycles() {
    let mut h = Harness::new(config());
    h.monitor.run_check_cycle().await.unwrap();
    h.clock.advance(Duration::from_secs(30));
    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert!(outcome.drift.is_none());
    assert_eq!(h.oracle.fetches(), 1);

    h.wait_for_time_check();
    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert!(outcome.drift.is_some());
    assert_eq!(h.oracle.fetches(), 2);
}

#[tokio::test]
async fn test_offline_clock_change_is_extrapolated() {
    let mut h = Harness::new(config());
    h.monitor.run_check_cycle().await.unwrap();

    h.monitor.on_network_change(false).await.unwrap();
    let fetches = h.oracle.fetches();
    h.clock.advance(10 * MINUTE);
    h.clock.set_skew_ms(minutes_ms(180));
    let outcome = h.monitor.run_check_cycle().await.unwrap();

    assert_eq!(h.oracle.fetches(), fetches);
    let reading = outcome.drift.unwrap();
    assert_eq!(reading.source, DriftSource::Extrapolated);
    assert_eq!(reading.classification, DriftClassification::Extreme);
    assert_eq!(outcome.status.state, SecurityState::TimeCorrectionNeeded);
}

#[tokio::test]
async fn test_unreachable_oracle_is_no_observation() {
    let mut h = Harness::new(config());
    h.oracle.set_available(false);
    h.clock.set_skew_ms(minutes_ms(600));
    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert!(outcome.drift.is_none());
    assert!(outcome.recorded.is_empty());
    assert_eq!(outcome.status.state, SecurityState::Normal);
}

// =============================================================================
// Escalation and unlock
// =============================================================================

#[tokio::test]
async fn test_alert_threshold_locks() {
    let mut h = Harness::new(config());
    violate(&mut h, 9);
    assert_ne!(h.monitor.state(), SecurityState::Locked);

    violate(&mut h, 1);
    let status = h.monitor.get_status();
    assert_eq!(status.state, SecurityState::Locked);
    assert_eq!(status.violation_count, 10);
    assert_eq!(status.enforcement, EnforcementAction::DenyAllExceptUnlock);
    assert_eq!(
        h.host.restriction(),
        Some(vec!["/unlock".to_string(), "/support".to_string()])
    );
    assert!(h.host.warnings().contains(&NotificationCategory::Locked));
}

#[tokio::test]
async fn test_lock_disabled_stops_at_suspicious() {
    let mut config = config();
    config.policy.lock_enabled = false;
    let mut h = Harness::new(config);
    violate(&mut h, 12);

    let status = h.monitor.get_status();
    assert_eq!(status.state, SecurityState::Suspicious);
    assert_eq!(status.enforcement, EnforcementAction::WarnAndReport);
    assert!(h.host.restriction().is_none());
    assert_eq!(h.host.restrict_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unlock_resets_counters() {
    let mut h = Harness::new(config());
    violate(&mut h, 10);
    assert_eq!(h.monitor.state(), SecurityState::Locked);

    let status = h.monitor.unlock(ADMIN_TOKEN).unwrap();
    assert_eq!(status.state, SecurityState::Normal);
    assert_eq!(status.violation_count, 0);
    assert_eq!(status.enforcement, EnforcementAction::None);
    assert!(h.host.restriction().is_none());
    assert_eq!(h.monitor.recent_events(usize::MAX).len(), 10);

    h.clock.advance(Duration::from_secs(1));
    violate(&mut h, 1);
    let status = h.monitor.get_status();
    assert_eq!(status.state, SecurityState::Normal);
    assert_eq!(status.violation_count, 1);
}

#[tokio::test]
async fn test_unlock_watermark_persists() {
    let store = Arc::new(MemoryStore::new());
    let mut first = Harness::with_store(config(), store.clone());
    violate(&mut first, 10);
    first.monitor.unlock(ADMIN_TOKEN).unwrap();

    let second = Harness::with_store(config(), store);
    let status = second.monitor.get_status();
    assert_eq!(status.state, SecurityState::Normal);
    assert_eq!(status.violation_count, 0);
}

#[tokio::test]
async fn test_rejected_unlock_keeps_lock() {
    let mut h = Harness::new(config());
    violate(&mut h, 10);

    assert!(matches!(
        h.monitor.unlock("guess"),
        Err(MonitorError::UnlockRejected)
    ));
    assert_eq!(h.monitor.state(), SecurityState::Locked);
    assert_eq!(h.monitor.get_status().violation_count, 10);
}

#[tokio::test]
async fn test_unlock_without_configured_digest_is_rejected() {
    let mut config = config();
    config.policy.unlock_token_sha256 = None;
    let mut h = Harness::new(config);
    violate(&mut h, 10);
    assert!(h.monitor.unlock(ADMIN_TOKEN).is_err());
    assert_eq!(h.monitor.state(), SecurityState::Locked);
}

// =============================================================================
// Notifications
// =============================================================================

#[tokio::test]
async fn test_warnings_are_throttled() {
    let mut h = Harness::new(config());
    violate(&mut h, 10);
    assert_eq!(h.host.warnings(), vec![NotificationCategory::Locked]);

    h.monitor.run_check_cycle().await.unwrap();
    h.clock.advance(MINUTE);
    h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(h.host.warnings().len(), 1);

    h.clock.advance(5 * MINUTE);
    h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(h.host.warnings().len(), 2);
}

#[tokio::test]
async fn test_exam_silences_warnings_but_not_enforcement() {
    let mut h = Harness::new(config());
    h.monitor.start_exam("mock-exam-3");
    violate(&mut h, 10);

    assert_eq!(h.monitor.state(), SecurityState::Locked);
    assert!(h.host.restriction().is_some());
    assert!(h.host.warnings().is_empty());

    h.clock.advance(30 * MINUTE);
    h.monitor.run_check_cycle().await.unwrap();
    assert!(h.host.warnings().is_empty());

    assert_eq!(h.monitor.end_exam().as_deref(), Some("mock-exam-3"));
    h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(h.host.warnings(), vec![NotificationCategory::Locked]);
}

// =============================================================================
// Device fingerprint
// =============================================================================

#[tokio::test]
async fn test_fingerprint_stable_across_minor_change() {
    let mut h = Harness::new(config());
    let before = h.monitor.get_status().device_fingerprint;

    h.environment.update(|c| c.screen_width = 1280);
    let outcome = h.monitor.run_check_cycle().await.unwrap();

    assert_eq!(outcome.status.device_fingerprint, before);
    assert!(outcome.recorded.is_empty());
}

#[tokio::test]
async fn test_zero_tolerance_flags_single_change() {
    let mut config = config();
    config.fingerprint_tolerance = 0;
    let mut h = Harness::new(config);

    h.environment.update(|c| c.screen_width = 1280);
    let outcome = h.monitor.run_check_cycle().await.unwrap();

    assert_eq!(outcome.recorded, vec![SecurityEventType::FingerprintMismatch]);
}

#[tokio::test]
async fn test_fingerprint_mismatch_recorded_once() {
    let mut h = Harness::new(config());
    h.environment.update(|c| {
        c.user_agent = "Mozilla/5.0 (Windows NT 10.0) Chrome/126.0".into();
        c.rendering_hash = "0badf00d".into();
        c.hardware_concurrency = 4;
    });

    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(outcome.recorded, vec![SecurityEventType::FingerprintMismatch]);
    h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(count_of(&h, SecurityEventType::FingerprintMismatch), 1);
}

#[tokio::test]
async fn test_reset_fingerprint_rederives() {
    let mut h = Harness::new(config());
    let before = h.monitor.get_status().device_fingerprint.unwrap();
    h.environment.update(|c| c.locale = "de-DE".into());

    let after = h.monitor.reset_fingerprint().unwrap();
    assert_ne!(after.to_string(), before);
    assert_eq!(h.monitor.get_status().device_fingerprint, Some(after.to_string()));
}

// =============================================================================
// Tamper heuristics
// =============================================================================

#[tokio::test]
async fn test_far_future_expiry_flagged() {
    let mut h = Harness::new(config());
    h.host.set_subscription(
        SubscriptionSnapshot {
            plan: SubscriptionPlan::Yearly,
            expiry_ms: Some(START_MS + 15 * YEAR_MS),
            is_active: true,
            last_modified_ms: None,
        },
        Vec::new(),
    );

    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert!(outcome.recorded.contains(&SecurityEventType::SubscriptionTamper));

    let again = h.monitor.run_check_cycle().await.unwrap();
    assert!(again.recorded.is_empty());
}

#[tokio::test]
async fn test_plausible_subscription_not_flagged() {
    let mut h = Harness::new(config());
    h.host.set_subscription(
        SubscriptionSnapshot {
            plan: SubscriptionPlan::Monthly,
            expiry_ms: Some(START_MS + 20 * DAY_MS),
            is_active: true,
            last_modified_ms: Some(START_MS - 11 * DAY_MS),
        },
        vec![PaymentRecord {
            payment_id: "pay_8812".into(),
            plan: SubscriptionPlan::Monthly,
            status: PaymentStatus::Completed,
            completed_ms: Some(START_MS - 11 * DAY_MS),
        }],
    );

    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert!(outcome.recorded.is_empty());
    assert_eq!(outcome.status.state, SecurityState::Normal);
}

#[tokio::test]
async fn test_payment_attempts_cool_down() {
    let mut h = Harness::new(config());
    for _ in 0..3 {
        assert_eq!(h.monitor.record_payment_attempt().unwrap(), PaymentGate::Allowed);
    }
    let gate = h.monitor.record_payment_attempt().unwrap();
    assert_eq!(gate, PaymentGate::CoolDown(10 * MINUTE));
    assert_eq!(count_of(&h, SecurityEventType::PaymentAbuse), 1);
    assert!(h.host.warnings().contains(&NotificationCategory::Payment));

    h.clock.advance(10 * MINUTE);
    assert_eq!(h.monitor.record_payment_attempt().unwrap(), PaymentGate::Allowed);
}

#[tokio::test]
async fn test_payment_flow_suppresses_warning() {
    let mut h = Harness::new(config());
    h.monitor.set_payment_flow_active(true);
    for _ in 0..4 {
        h.monitor.record_payment_attempt().unwrap();
    }
    assert!(h.host.warnings().is_empty());
}

// =============================================================================
// Sessions, storage and reports
// =============================================================================

#[tokio::test]
async fn test_multi_device_session_is_suspicious() {
    let mut config = config();
    config.account_id = Some("acct-1042".into());
    let mut h = Harness::new(config);

    let foreign = SessionHeartbeat {
        session_id: "phone-session".into(),
        account_id: "acct-1042".into(),
        device_fingerprint: "fp2-sha256:0000feed".into(),
        last_seen_ms: START_MS,
    };
    h.store
        .set(
            "v1/session/phone-session",
            &serde_json::to_string(&foreign).unwrap(),
        )
        .unwrap();

    let outcome = h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(outcome.recorded, vec![SecurityEventType::MultiDeviceSession]);
    assert_eq!(outcome.status.state, SecurityState::Suspicious);
    assert_eq!(
        outcome.transition.map(|t| t.cause),
        Some(TransitionCause::MultiDeviceSession)
    );
}

#[tokio::test]
async fn test_edited_ledger_record_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let mut first = Harness::with_store(config(), store.clone());
    violate(&mut first, 1);

    let key = store.keys_with_prefix("v1/ledger/event/").unwrap().remove(0);
    let mut record: serde_json::Value =
        serde_json::from_str(&store.get(&key).unwrap().unwrap()).unwrap();
    record["payload"]["details"] = serde_json::json!("nothing to see");
    store.set(&key, &record.to_string()).unwrap();

    let second = Harness::with_store(config(), store.clone());
    let events = second.monitor.recent_events(usize::MAX);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SecurityEventType::StorageTamper);

    let third = Harness::with_store(config(), store);
    assert_eq!(count_of(&third, SecurityEventType::StorageTamper), 1);
}

#[tokio::test]
async fn test_corrupt_ledger_file_keeps_remaining_events() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(examguard_store::FileStore::open(dir.path()).unwrap());
    let clock = Arc::new(examguard_core::ManualClock::new(START_MS));
    let monitor = |store: &Arc<dyn KeyValueStore>| {
        let deps = examguard_core::MonitorDeps::new(store.clone(), clock.clone());
        let mut monitor = examguard_core::SecurityMonitor::new(config(), deps).unwrap();
        monitor.initialize();
        monitor
    };

    let mut first = monitor(&store);
    for i in 0..5 {
        first
            .record_external_violation("devtools_open", serde_json::json!({ "n": i }))
            .unwrap();
        clock.advance(MINUTE);
    }
    first.dispose();

    let key = store.keys_with_prefix("v1/ledger/event/").unwrap().remove(1);
    let path = dir.path().join(format!("{}.rec", hex::encode(key.as_bytes())));
    std::fs::write(path, [0xff, 0xfe, 0x00]).unwrap();

    let second = monitor(&store);
    let events = second.recent_events(usize::MAX);
    assert_eq!(events.len(), 5);
    assert_eq!(events[0].event_type, SecurityEventType::StorageTamper);
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == SecurityEventType::External)
            .count(),
        4
    );
}

#[tokio::test]
async fn test_storage_change_adopts_state() {
    let store = Arc::new(MemoryStore::new());
    let mut tab_a = Harness::with_store(config(), store.clone());
    let mut tab_b = Harness::with_store(config(), store);

    violate(&mut tab_a, 10);
    assert_eq!(tab_b.monitor.state(), SecurityState::Normal);

    tab_b.monitor.on_storage_change("v1/state").unwrap();
    assert_eq!(tab_b.monitor.state(), SecurityState::Locked);
    assert!(tab_b.host.restriction().is_some());

    tab_b.monitor.on_storage_change("v1/ledger/event/x").unwrap();
    assert_eq!(tab_b.monitor.get_status().violation_count, 10);
}

#[tokio::test]
async fn test_forged_state_write_does_not_unlock() {
    let mut h = Harness::new(config());
    violate(&mut h, 10);
    assert_eq!(h.monitor.state(), SecurityState::Locked);
    h.clock.advance(Duration::from_secs(25 * 60 * 60));

    let forged = serde_json::json!({
        "state": "normal",
        "since_ms": h.clock.now_ms(),
        "enforcement": "none",
    });
    for _ in 0..2 {
        h.store.set("v1/state", &forged.to_string()).unwrap();
        let outcome = h.monitor.on_storage_change("v1/state").unwrap();
        assert_eq!(outcome.status.state, SecurityState::Locked);
    }
    assert_eq!(count_of(&h, SecurityEventType::StorageTamper), 1);
    assert!(h.host.restriction().is_some());

    let stored = h.store.get("v1/state").unwrap().unwrap();
    let stored: StateRecord = serde_json::from_str(&stored).unwrap();
    assert_eq!(stored.state, SecurityState::Locked);
    assert!(stored.verify_seal());
}

#[tokio::test]
async fn test_replayed_normal_record_does_not_unlock() {
    let mut h = Harness::new(config());
    violate(&mut h, 10);
    h.clock.advance(MINUTE);

    let replayed = StateRecord::new(SecurityState::Normal, START_MS, None);
    h.store
        .set("v1/state", &serde_json::to_string(&replayed).unwrap())
        .unwrap();
    let outcome = h.monitor.on_storage_change("v1/state").unwrap();
    assert_eq!(outcome.recorded, vec![SecurityEventType::StorageTamper]);
    assert_eq!(outcome.status.state, SecurityState::Locked);
}

#[tokio::test]
async fn test_forged_state_at_startup_is_suspicious() {
    let store = Arc::new(MemoryStore::new());
    let mut first = Harness::with_store(config(), store.clone());
    violate(&mut first, 10);
    first.monitor.dispose();

    store
        .set(
            "v1/state",
            r#"{"state":"normal","since_ms":1737936000000,"enforcement":"none"}"#,
        )
        .unwrap();

    let second = Harness::with_store(config(), store);
    assert_eq!(second.monitor.state(), SecurityState::Suspicious);
    assert_eq!(count_of(&second, SecurityEventType::StorageTamper), 1);
}

#[tokio::test]
async fn test_unlock_in_another_context_is_adopted() {
    let store = Arc::new(MemoryStore::new());
    let mut tab_a = Harness::with_store(config(), store.clone());
    let mut tab_b = Harness::with_store(config(), store);

    violate(&mut tab_a, 10);
    tab_b.monitor.on_storage_change("v1/state").unwrap();
    assert_eq!(tab_b.monitor.state(), SecurityState::Locked);

    tab_a.clock.advance(MINUTE);
    tab_b.clock.advance(MINUTE);
    tab_a.monitor.unlock(ADMIN_TOKEN).unwrap();

    tab_b.monitor.on_storage_change("v1/ledger/reset_at").unwrap();
    let outcome = tab_b.monitor.on_storage_change("v1/state").unwrap();
    assert!(outcome.recorded.is_empty());
    assert_eq!(outcome.status.state, SecurityState::Normal);
    assert_eq!(outcome.status.violation_count, 0);
    assert!(tab_b.host.restriction().is_none());
}

#[tokio::test]
async fn test_time_correction_not_lifted_by_another_context() {
    let store = Arc::new(MemoryStore::new());
    let mut h = Harness::with_store(config(), store.clone());
    h.clock.set_skew_ms(minutes_ms(120));
    h.monitor.run_check_cycle().await.unwrap();
    assert_eq!(h.monitor.state(), SecurityState::TimeCorrectionNeeded);

    let other = StateRecord::new(SecurityState::Normal, h.clock.now_ms(), None);
    store
        .set("v1/state", &serde_json::to_string(&other).unwrap())
        .unwrap();
    let outcome = h.monitor.on_storage_change("v1/state").unwrap();
    assert!(outcome.recorded.is_empty());
    assert_eq!(outcome.status.state, SecurityState::TimeCorrectionNeeded);
}

#[tokio::test]
async fn test_report_queued_offline_and_flushed_online() {
    let mut config = config();
    config.policy.lock_enabled = false;
    let mut h = Harness::new(config);

    h.monitor.on_network_change(false).await.unwrap();
    violate(&mut h, 10);
    assert_eq!(h.monitor.state(), SecurityState::Suspicious);

    h.monitor.run_check_cycle().await.unwrap();
    assert!(h.sink.reports.lock().unwrap().is_empty());
    assert_eq!(
        h.store.keys_with_prefix("v1/report/pending/").unwrap().len(),
        1
    );

    h.monitor.on_network_change(true).await.unwrap();
    let reports = h.sink.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].status.state, SecurityState::Suspicious);
    assert!(!reports[0].events.is_empty());
    assert!(h.store.keys_with_prefix("v1/report/pending/").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_report_sink_does_not_block_cycle() {
    let mut config = config();
    config.policy.lock_enabled = false;
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(examguard_core::ManualClock::new(START_MS));
    let deps = examguard_core::MonitorDeps::new(store.clone(), clock.clone())
        .with_time_source(Arc::new(OracleSource::new(clock.clone())))
        .with_report_sink(Arc::new(StalledSink));
    let mut monitor = examguard_core::SecurityMonitor::new(config, deps).unwrap();
    monitor.initialize();

    for i in 0..10 {
        monitor
            .record_external_violation("devtools_open", serde_json::json!({ "n": i }))
            .unwrap();
    }
    assert_eq!(monitor.state(), SecurityState::Suspicious);

    let outcome = tokio::time::timeout(Duration::from_secs(600), monitor.run_check_cycle())
        .await
        .expect("check cycle stalled on the report sink")
        .unwrap();
    assert_eq!(outcome.status.state, SecurityState::Suspicious);
    assert_eq!(store.keys_with_prefix("v1/report/pending/").unwrap().len(), 1);
}

// =============================================================================
// Exam anomalies
// =============================================================================

#[tokio::test]
async fn test_exam_anomalies_recorded() {
    let mut h = Harness::new(config());
    h.monitor.start_exam("final-mock");

    h.monitor.on_visibility_change(false).await.unwrap();
    h.monitor.on_visibility_change(false).await.unwrap();
    assert_eq!(count_of(&h, SecurityEventType::ExamAnomaly), 1);

    h.clock.advance(5 * MINUTE);
    let outcome = h.monitor.on_exam_heartbeat().unwrap();
    assert_eq!(outcome.recorded, vec![SecurityEventType::ExamAnomaly]);

    for i in 0..4 {
        let q = format!("q{i}");
        assert!(h.monitor.record_answer(&q, Duration::from_millis(300)).unwrap().is_none());
    }
    let outcome = h
        .monitor
        .record_answer("q4", Duration::from_millis(300))
        .unwrap()
        .unwrap();
    assert_eq!(outcome.recorded, vec![SecurityEventType::ExamAnomaly]);
    assert_eq!(count_of(&h, SecurityEventType::ExamAnomaly), 3);
    assert_eq!(h.monitor.state(), SecurityState::Normal);
}

#[tokio::test]
async fn test_export_report() {
    let mut h = Harness::new(config());
    violate(&mut h, 3);
    let report = h.monitor.export_report(2);
    assert_eq!(report.events.len(), 2);
    assert_eq!(report.status.violation_count, 3);
    assert_eq!(report.reason, "export");
}
