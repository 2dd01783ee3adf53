//! Notification throttle.
//!
//! Rate-limits user-facing warnings per category and silences them entirely
//! during sensitive contexts (an exam in progress, a payment flow). Only the
//! visible warning is throttled; transitions and enforcement never are.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{duration_ms, Clock};
use crate::config::ThrottleConfig;
use crate::error::MonitorError;
use crate::repository::{keys, SecurityRepository};
use crate::types::NotificationCategory;

/// When a category was last shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleRecord {
    /// Category.
    pub category: NotificationCategory,
    /// Local time it was last shown.
    pub last_shown_ms: i64,
}

/// Per-category notification rate limiter.
pub struct NotificationThrottle {
    repo: SecurityRepository,
    clock: Arc<dyn Clock>,
    min_interval: Duration,
    last_shown: HashMap<NotificationCategory, i64>,
    exam_active: bool,
    payment_flow_active: bool,
}

impl NotificationThrottle {
    /// Create a throttle with no history.
    pub fn new(repo: SecurityRepository, clock: Arc<dyn Clock>, config: &ThrottleConfig) -> Self {
        Self {
            repo,
            clock,
            min_interval: config.min_interval,
            last_shown: HashMap::new(),
            exam_active: false,
            payment_flow_active: false,
        }
    }

    /// Load persisted records, replacing in-memory history.
    pub fn load(&mut self) -> Result<(), MonitorError> {
        let mut last_shown = HashMap::new();
        for category in NotificationCategory::ALL {
            if let Some(record) = self
                .repo
                .load_json::<ThrottleRecord>(&keys::throttle(category.as_str()))?
            {
                last_shown.insert(category, record.last_shown_ms);
            }
        }
        self.last_shown = last_shown;
        Ok(())
    }

    /// Whether a warning of `category` may be shown now.
    pub fn can_show(&self, category: NotificationCategory) -> bool {
        if self.is_suppressed() {
            return false;
        }
        let Some(&last) = self.last_shown.get(&category) else {
            return true;
        };
        let now = self.clock.now_ms();
        // A last-shown time in the future means the clock was moved back.
        now < last || now - last >= duration_ms(self.min_interval)
    }

    /// Record that a warning of `category` was shown now.
    pub fn mark_shown(&mut self, category: NotificationCategory) {
        let now = self.clock.now_ms();
        self.last_shown.insert(category, now);

        let record = ThrottleRecord {
            category,
            last_shown_ms: now,
        };
        if let Err(e) = self
            .repo
            .save_json(&keys::throttle(category.as_str()), &record)
        {
            warn!(category = category.as_str(), error = %e, "Failed to persist throttle record");
        }
    }

    /// Check and mark in one step. Returns whether the warning may be shown.
    pub fn admit(&mut self, category: NotificationCategory) -> bool {
        if self.can_show(category) {
            self.mark_shown(category);
            true
        } else {
            debug!(category = category.as_str(), "Notification throttled");
            false
        }
    }

    /// Mark an exam session as active or finished.
    pub fn set_exam_active(&mut self, active: bool) {
        self.exam_active = active;
    }

    /// Mark a payment/subscription flow as active or finished.
    pub fn set_payment_flow_active(&mut self, active: bool) {
        self.payment_flow_active = active;
    }

    /// Whether a sensitive context is silencing every category.
    pub fn is_suppressed(&self) -> bool {
        self.exam_active || self.payment_flow_active
    }
}
