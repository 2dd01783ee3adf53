//! Security reports and the offline report queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MonitorError;
use crate::host::ReportSink;
use crate::repository::{keys, SecurityRepository};
use crate::security::random_id;
use crate::types::{MonitorStatus, SecurityEvent};

/// Reports kept while offline. Oldest are dropped first.
pub const MAX_PENDING_REPORTS: usize = 20;

/// Snapshot of the monitor and its recent events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityReport {
    /// Report identifier.
    pub id: String,
    /// Local time the report was generated.
    pub generated_ms: i64,
    /// Why the report was generated.
    pub reason: String,
    /// Monitor status at generation time.
    pub status: MonitorStatus,
    /// Recent events, newest first.
    pub events: Vec<SecurityEvent>,
}

impl SecurityReport {
    /// Build a report.
    pub fn new(
        generated_ms: i64,
        reason: impl Into<String>,
        status: MonitorStatus,
        events: Vec<SecurityEvent>,
    ) -> Self {
        Self {
            id: random_id(),
            generated_ms,
            reason: reason.into(),
            status,
            events,
        }
    }
}

/// Persistent queue of reports awaiting a sink.
#[derive(Debug, Clone)]
pub struct ReportQueue {
    repo: SecurityRepository,
}

impl ReportQueue {
    /// Create a queue over the repository.
    pub fn new(repo: SecurityRepository) -> Self {
        Self { repo }
    }

    /// Queue a report, dropping the oldest beyond the cap.
    pub fn enqueue(&self, report: &SecurityReport) -> Result<(), MonitorError> {
        self.repo.save_json(
            &keys::report_pending(report.generated_ms, &report.id),
            report,
        )?;

        let keys = self.repo.keys(keys::REPORT_PENDING_PREFIX)?;
        let excess = keys.len().saturating_sub(MAX_PENDING_REPORTS);
        for key in keys.iter().take(excess) {
            self.repo.delete(key)?;
        }
        debug!(id = %report.id, dropped = excess, "Report queued");
        Ok(())
    }

    /// Pending reports with their keys, oldest first.
    pub fn pending(&self) -> Result<Vec<(String, SecurityReport)>, MonitorError> {
        let mut reports = Vec::new();
        for key in self.repo.keys(keys::REPORT_PENDING_PREFIX)? {
            if let Some(report) = self.repo.load_json::<SecurityReport>(&key)? {
                reports.push((key, report));
            }
        }
        Ok(reports)
    }

    /// Number of pending reports.
    pub fn len(&self) -> Result<usize, MonitorError> {
        Ok(self.repo.keys(keys::REPORT_PENDING_PREFIX)?.len())
    }

    /// Submit pending reports in order, each bounded by `timeout`. Stops at
    /// the first failure and leaves the rest queued. Returns how many were
    /// delivered.
    pub async fn flush(
        &self,
        sink: &dyn ReportSink,
        timeout: Duration,
    ) -> Result<usize, MonitorError> {
        let mut delivered = 0;
        for (key, report) in self.pending()? {
            let result = match tokio::time::timeout(timeout, sink.submit(&report)).await {
                Ok(result) => result,
                Err(_) => Err(MonitorError::transient(format!(
                    "report submission exceeded {timeout:?}"
                ))),
            };
            if let Err(e) = result {
                warn!(id = %report.id, error = %e, "Report submission failed");
                break;
            }
            self.repo.delete(&key)?;
            delivered += 1;
        }
        if delivered > 0 {
            info!(delivered, "Flushed security reports");
        }
        Ok(delivered)
    }
}
