//! `MonitorDriver` wiring: ticks, signals, status publication and shutdown.

use std::time::Duration;

use examguard_core::{
    ManualScheduler, MonitorDriver, MonitorError, MonitorSignal, SecurityEventType, SecurityState,
};

use crate::support::*;

#[tokio::test]
async fn test_driver_runs_ticks_then_stops_on_signal() {
    let h = Harness::new(config());
    let (driver, handle) = MonitorDriver::new(h.monitor, ManualScheduler::new(3));
    let task = tokio::spawn(driver.run());

    let mut status = handle.subscribe();
    status
        .wait_for(|s| s.last_check_ms.is_some())
        .await
        .unwrap();
    handle.stop().unwrap();

    let monitor = task.await.unwrap();
    assert!(!monitor.is_initialized());
    assert_eq!(h.oracle.fetches(), 1);
}

#[tokio::test]
async fn test_signals_are_processed_in_order() {
    let h = Harness::new(config());
    let (driver, handle) = MonitorDriver::new(h.monitor, ManualScheduler::new(0));

    for i in 0..10 {
        handle
            .send(MonitorSignal::ExternalViolation {
                kind: "clipboard_paste".into(),
                payload: serde_json::json!({ "n": i }),
            })
            .unwrap();
    }
    handle.send(MonitorSignal::StorageChanged("v1/state".into())).unwrap();
    handle.stop().unwrap();

    let monitor = driver.run().await;
    assert_eq!(monitor.state(), SecurityState::Locked);
    assert_eq!(
        monitor
            .recent_events(usize::MAX)
            .iter()
            .filter(|e| e.event_type == SecurityEventType::External)
            .count(),
        10
    );
    assert_eq!(handle.status().state, SecurityState::Locked);
}

#[tokio::test]
async fn test_unlock_through_handle() {
    let h = Harness::new(config());
    let (driver, handle) = MonitorDriver::new(h.monitor, ManualScheduler::new(0));
    let task = tokio::spawn(driver.run());

    for _ in 0..10 {
        handle
            .send(MonitorSignal::ExternalViolation {
                kind: "devtools_open".into(),
                payload: serde_json::Value::Null,
            })
            .unwrap();
    }
    handle
        .subscribe()
        .wait_for(|s| s.state == SecurityState::Locked)
        .await
        .unwrap();

    assert!(matches!(
        handle.unlock("not-the-token").await,
        Err(MonitorError::UnlockRejected)
    ));
    let status = handle.unlock(ADMIN_TOKEN).await.unwrap();
    assert_eq!(status.state, SecurityState::Normal);
    assert_eq!(handle.status().violation_count, 0);

    handle.stop().unwrap();
    task.await.unwrap();
    assert!(matches!(
        handle.send(MonitorSignal::ExamHeartbeat),
        Err(MonitorError::DriverStopped)
    ));
}

#[tokio::test]
async fn test_dropping_every_handle_stops_driver() {
    let h = Harness::new(config());
    let (driver, handle) = MonitorDriver::new(h.monitor, ManualScheduler::new(0));
    drop(handle);
    let monitor = driver.run().await;
    assert!(!monitor.is_initialized());
}

#[tokio::test(start_paused = true)]
async fn test_periodic_driver_uses_check_interval() {
    let h = Harness::new(config());
    let (driver, handle, scheduler) = MonitorDriver::periodic(h.monitor);
    let task = tokio::spawn(driver.run());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.oracle.fetches(), 1);

    scheduler.pause();
    h.clock.advance(10 * MINUTE);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.oracle.fetches(), 1);

    scheduler.resume();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.oracle.fetches(), 2);

    handle.stop().unwrap();
    task.await.unwrap();
}
