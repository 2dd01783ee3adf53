//! Violation ledger.
//!
//! Append-only, count-capped record of security events. Each event is
//! persisted under its own key, so two overlapping writers (another tab,
//! an overlapping check) never perform a read-modify-write on a shared list.
//!
//! Counts are derived on demand by a linear scan over the retained events.
//! An administrative unlock does not delete anything: it moves a watermark,
//! and counts only consider events recorded after it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::{duration_ms, Clock};
use crate::error::MonitorError;
use crate::repository::{keys, SecurityRepository};
use crate::types::{EventCategory, SecurityEvent, SecurityEventType};

/// Default retention cap.
pub const DEFAULT_CAPACITY: usize = 1000;

/// A retained event and the key it is stored under.
#[derive(Debug, Clone)]
struct Entry {
    key: String,
    event: SecurityEvent,
}

/// Outcome of loading the ledger from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Events accepted.
    pub loaded: usize,
    /// Keys whose record was undecodable or failed its seal.
    pub rejected: Vec<String>,
    /// Events evicted because the store held more than the cap.
    pub evicted: usize,
}

/// Seal audit over the persisted ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Records examined.
    pub total: usize,
    /// Records whose seal verified.
    pub valid: usize,
    /// Keys of records that failed to decode or verify.
    pub invalid: Vec<String>,
}

impl AuditReport {
    /// Whether every record verified.
    pub fn is_clean(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Count-capped, append-only event ledger.
pub struct ViolationLedger {
    repo: SecurityRepository,
    clock: Arc<dyn Clock>,
    capacity: usize,
    entries: VecDeque<Entry>,
    reset_at_ms: Option<i64>,
}

impl ViolationLedger {
    /// Create an empty ledger. Call [`load`](Self::load) to pick up
    /// persisted events.
    pub fn new(repo: SecurityRepository, clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            repo,
            clock,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            reset_at_ms: None,
        }
    }

    /// Replace in-memory contents with what the store holds.
    ///
    /// Records that fail to decode or whose seal does not verify are
    /// skipped and reported; they are left in place for audit.
    #[instrument(skip(self))]
    pub fn load(&mut self) -> Result<LoadReport, MonitorError> {
        let mut report = LoadReport::default();
        let mut entries = VecDeque::new();

        for key in self.repo.keys(keys::LEDGER_EVENT_PREFIX)? {
            match self.repo.load_json::<SecurityEvent>(&key) {
                Ok(Some(event)) if event.verify_seal() => entries.push_back(Entry { key, event }),
                Ok(_) => {
                    warn!(key = %key, "Rejecting ledger record with invalid seal");
                    report.rejected.push(key);
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "Rejecting unreadable ledger record");
                    report.rejected.push(key);
                },
            }
        }

        self.entries = entries;
        self.reset_at_ms = self.repo.load_reset_at()?;
        report.loaded = self.entries.len();
        report.evicted = self.evict_to(self.capacity);
        report.loaded -= report.evicted;

        debug!(
            loaded = report.loaded,
            rejected = report.rejected.len(),
            evicted = report.evicted,
            "Ledger loaded"
        );
        Ok(report)
    }

    /// Append an event and persist it.
    ///
    /// The in-memory append always takes effect. A persistence failure is
    /// returned so the caller can log it; the event is still counted.
    pub fn record(&mut self, event: SecurityEvent) -> Result<(), MonitorError> {
        let key = keys::ledger_event(event.timestamp_ms, &event.id);
        let persisted = self.repo.save_json(&key, &event);

        debug!(
            event_type = %event.event_type,
            id = %event.id,
            "Recorded security event"
        );
        self.entries.push_back(Entry { key, event });

        if self.entries.len() > self.capacity {
            let err = MonitorError::LedgerCapacity {
                capacity: self.capacity,
            };
            debug!(error = %err, "Evicting oldest events");
            self.evict_to(self.capacity);
        }

        persisted
    }

    /// Evict oldest events until at most `max_entries` remain.
    pub fn prune(&mut self, max_entries: usize) -> usize {
        self.evict_to(max_entries)
    }

    fn evict_to(&mut self, max_entries: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_entries {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            if let Err(e) = self.repo.delete(&entry.key) {
                warn!(key = %entry.key, error = %e, "Failed to delete evicted event");
            }
            evicted += 1;
        }
        evicted
    }

    fn counted(&self, window: Duration) -> impl Iterator<Item = &SecurityEvent> {
        let now = self.clock.now_ms();
        let window_ms = duration_ms(window);
        let reset_at = self.reset_at_ms;
        self.entries
            .iter()
            .map(|e| &e.event)
            .filter(move |e| reset_at.map_or(true, |r| e.timestamp_ms > r))
            .filter(move |e| now.saturating_sub(e.timestamp_ms) < window_ms)
    }

    /// Events of `event_type` within `window` of now.
    pub fn count_in_window(&self, event_type: SecurityEventType, window: Duration) -> usize {
        self.counted(window)
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Events of `category` within `window` of now.
    pub fn count_category_in_window(&self, category: EventCategory, window: Duration) -> usize {
        self.counted(window)
            .filter(|e| e.category() == category)
            .count()
    }

    /// Subscription and payment events within `window` of now.
    pub fn count_tamper_in_window(&self, window: Duration) -> usize {
        self.counted(window)
            .filter(|e| e.category().is_tamper())
            .count()
    }

    /// Events of any type within `window` of now.
    pub fn count_all_in_window(&self, window: Duration) -> usize {
        self.counted(window).count()
    }

    /// Up to `limit` events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.entries
            .iter()
            .rev()
            .take(limit)
            .map(|e| e.event.clone())
            .collect()
    }

    /// Move the counter watermark to `now_ms`. Nothing is deleted.
    pub fn reset_counters(&mut self, now_ms: i64) -> Result<(), MonitorError> {
        self.reset_at_ms = Some(now_ms);
        info!(reset_at_ms = now_ms, "Violation counters reset");
        self.repo.save_reset_at(now_ms)
    }

    /// Current watermark.
    pub fn reset_at_ms(&self) -> Option<i64> {
        self.reset_at_ms
    }

    /// Retained events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no events are retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Retention cap.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Re-verify every persisted record's seal.
    pub fn verify_seals(&self) -> Result<AuditReport, MonitorError> {
        audit(&self.repo)
    }
}

/// Verify the seal of every persisted ledger record.
pub fn audit(repo: &SecurityRepository) -> Result<AuditReport, MonitorError> {
    let mut report = AuditReport::default();
    for key in repo.keys(keys::LEDGER_EVENT_PREFIX)? {
        report.total += 1;
        match repo.load_json::<SecurityEvent>(&key) {
            Ok(Some(event)) if event.verify_seal() => report.valid += 1,
            Ok(_) => report.invalid.push(key),
            Err(e) => {
                debug!(key = %key, error = %e, "Unreadable ledger record");
                report.invalid.push(key);
            },
        }
    }
    Ok(report)
}
