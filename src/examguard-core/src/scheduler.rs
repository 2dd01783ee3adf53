//! Scheduling and signal delivery.
//!
//! [`MonitorDriver`] owns a [`SecurityMonitor`] on one task. It waits on
//! either a scheduler tick or a [`MonitorSignal`] from the host, handles one
//! at a time, and publishes the resulting [`MonitorStatus`] on a watch
//! channel. A cycle that has started always runs to completion before the
//! next signal (including `Stop`) is read.
//!
//! ```text
//!   IntervalScheduler ──tick──┐
//!                             ├──► MonitorDriver ──► SecurityMonitor
//!   MonitorHandle ──signal────┘          │
//!                                        └──► watch<MonitorStatus>
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::monitor::{CycleOutcome, SecurityMonitor};
use crate::types::MonitorStatus;

// =============================================================================
// SCHEDULERS
// =============================================================================

/// Source of periodic check ticks.
#[async_trait]
pub trait CheckScheduler: Send {
    /// Wait for the next tick. Returns `false` once the scheduler is stopped.
    async fn next_tick(&mut self) -> bool;
}

/// Run state shared between an [`IntervalScheduler`] and its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerControl {
    /// Ticks are delivered.
    Running,
    /// Ticks are held until resumed.
    Paused,
    /// No more ticks.
    Stopped,
}

/// Tokio interval that can be paused while the host is in the background.
pub struct IntervalScheduler {
    interval: Interval,
    control: watch::Receiver<SchedulerControl>,
}

/// Controls an [`IntervalScheduler`] from elsewhere.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    control: watch::Sender<SchedulerControl>,
}

impl IntervalScheduler {
    /// Tick every `period`. The first tick fires after one period.
    pub fn new(period: Duration) -> (Self, SchedulerHandle) {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (tx, rx) = watch::channel(SchedulerControl::Running);
        (
            Self {
                interval,
                control: rx,
            },
            SchedulerHandle { control: tx },
        )
    }
}

#[async_trait]
impl CheckScheduler for IntervalScheduler {
    async fn next_tick(&mut self) -> bool {
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                SchedulerControl::Stopped => return false,
                SchedulerControl::Paused => {
                    if self.control.changed().await.is_err() {
                        return false;
                    }
                    // Restart the period after a pause rather than firing
                    // the backlog.
                    self.interval.reset();
                },
                SchedulerControl::Running => {
                    tokio::select! {
                        _ = self.interval.tick() => return true,
                        changed = self.control.changed() => {
                            if changed.is_err() {
                                return false;
                            }
                        },
                    }
                },
            }
        }
    }
}

impl SchedulerHandle {
    /// Hold ticks.
    pub fn pause(&self) {
        self.set(SchedulerControl::Paused);
    }

    /// Deliver ticks again.
    pub fn resume(&self) {
        self.set(SchedulerControl::Running);
    }

    /// Stop for good.
    pub fn stop(&self) {
        self.set(SchedulerControl::Stopped);
    }

    /// Current run state.
    pub fn control(&self) -> SchedulerControl {
        *self.control.borrow()
    }

    fn set(&self, control: SchedulerControl) {
        self.control.send_if_modified(|current| {
            if *current == SchedulerControl::Stopped || *current == control {
                return false;
            }
            *current = control;
            true
        });
    }
}

/// Delivers a fixed number of ticks immediately, then stops.
#[derive(Debug, Clone, Copy)]
pub struct ManualScheduler {
    remaining: usize,
}

impl ManualScheduler {
    /// Scheduler that ticks `ticks` times.
    pub fn new(ticks: usize) -> Self {
        Self { remaining: ticks }
    }
}

#[async_trait]
impl CheckScheduler for ManualScheduler {
    async fn next_tick(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        tokio::task::yield_now().await;
        true
    }
}

// =============================================================================
// DRIVER
// =============================================================================

/// Host signal delivered to a running driver.
#[derive(Debug)]
pub enum MonitorSignal {
    /// Page visibility changed.
    Visibility(bool),
    /// Connectivity changed.
    Network(bool),
    /// Another context wrote this store key.
    StorageChanged(String),
    /// Exam heartbeat.
    ExamHeartbeat,
    /// Violation detected by the host.
    ExternalViolation {
        /// Host-defined kind.
        kind: String,
        /// Details.
        payload: serde_json::Value,
    },
    /// Administrative unlock.
    Unlock {
        /// Plain-text admin token.
        token: String,
        /// Receives the result.
        reply: oneshot::Sender<Result<MonitorStatus, MonitorError>>,
    },
    /// Finish and return the monitor.
    Stop,
}

/// Sends signals to a [`MonitorDriver`] and watches its status.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    signals: mpsc::UnboundedSender<MonitorSignal>,
    status: watch::Receiver<MonitorStatus>,
}

impl MonitorHandle {
    /// Deliver a signal. Fails if the driver has finished.
    pub fn send(&self, signal: MonitorSignal) -> Result<(), MonitorError> {
        self.signals
            .send(signal)
            .map_err(|_| MonitorError::DriverStopped)
    }

    /// Latest published status.
    pub fn status(&self) -> MonitorStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status.clone()
    }

    /// Unlock through the driver.
    pub async fn unlock(&self, token: impl Into<String>) -> Result<MonitorStatus, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorSignal::Unlock {
            token: token.into(),
            reply,
        })?;
        rx.await.map_err(|_| MonitorError::DriverStopped)?
    }

    /// Ask the driver to stop after the current cycle.
    pub fn stop(&self) -> Result<(), MonitorError> {
        self.send(MonitorSignal::Stop)
    }
}

/// Runs a monitor against a scheduler and a signal channel.
pub struct MonitorDriver<S> {
    monitor: SecurityMonitor,
    scheduler: S,
    signals: mpsc::UnboundedReceiver<MonitorSignal>,
    status: watch::Sender<MonitorStatus>,
}

impl MonitorDriver<IntervalScheduler> {
    /// Drive `monitor` at its configured check interval.
    pub fn periodic(monitor: SecurityMonitor) -> (Self, MonitorHandle, SchedulerHandle) {
        let (scheduler, control) = IntervalScheduler::new(monitor.config().check_interval);
        let (driver, handle) = Self::new(monitor, scheduler);
        (driver, handle, control)
    }
}

impl<S: CheckScheduler> MonitorDriver<S> {
    /// Wrap an initialized monitor.
    pub fn new(monitor: SecurityMonitor, scheduler: S) -> (Self, MonitorHandle) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(monitor.get_status());
        (
            Self {
                monitor,
                scheduler,
                signals: signal_rx,
                status: status_tx,
            },
            MonitorHandle {
                signals: signal_tx,
                status: status_rx,
            },
        )
    }

    /// Run until stopped, the scheduler finishes, or every handle is
    /// dropped. Returns the monitor, disposed.
    pub async fn run(mut self) -> SecurityMonitor {
        info!("Monitor driver started");
        let mut ticking = true;
        loop {
            tokio::select! {
                tick = self.scheduler.next_tick(), if ticking => {
                    if tick {
                        let outcome = self.monitor.run_check_cycle().await;
                        self.publish(outcome);
                    } else {
                        debug!("Scheduler finished");
                        ticking = false;
                    }
                },
                signal = self.signals.recv() => {
                    match signal {
                        Some(MonitorSignal::Stop) | None => break,
                        Some(signal) => self.handle(signal).await,
                    }
                },
            }
        }
        self.monitor.dispose();
        info!("Monitor driver stopped");
        self.monitor
    }

    async fn handle(&mut self, signal: MonitorSignal) {
        let outcome = match signal {
            MonitorSignal::Visibility(visible) => self.monitor.on_visibility_change(visible).await,
            MonitorSignal::Network(online) => self.monitor.on_network_change(online).await,
            MonitorSignal::StorageChanged(key) => self.monitor.on_storage_change(&key),
            MonitorSignal::ExamHeartbeat => self.monitor.on_exam_heartbeat(),
            MonitorSignal::ExternalViolation { kind, payload } => {
                self.monitor.record_external_violation(&kind, payload)
            },
            MonitorSignal::Unlock { token, reply } => {
                let result = self.monitor.unlock(&token);
                self.status.send_replace(self.monitor.get_status());
                if reply.send(result).is_err() {
                    debug!("Unlock requester went away");
                }
                return;
            },
            MonitorSignal::Stop => return,
        };
        self.publish(outcome);
    }

    fn publish(&self, outcome: Result<CycleOutcome, MonitorError>) {
        match outcome {
            Ok(outcome) => {
                self.status.send_if_modified(|status| {
                    if *status == outcome.status {
                        return false;
                    }
                    *status = outcome.status.clone();
                    true
                });
            },
            Err(e) => warn!(error = %e, "Check cycle failed"),
        }
    }
}
