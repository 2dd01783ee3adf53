//! Contracts the host application implements.
//!
//! The engine never renders UI, routes pages or talks to a payment gateway.
//! It reaches those through the traits below, injected at construction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MonitorError;
use crate::report::SecurityReport;
use crate::types::{NotificationCategory, PaymentRecord, SubscriptionSnapshot, TrialRecord};

/// Action offered alongside a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningAction {
    /// Close the warning.
    Dismiss,
    /// Open the device's date/time settings.
    OpenTimeSettings,
    /// Contact support.
    ContactSupport,
    /// Start the unlock flow.
    Unlock,
}

impl WarningAction {
    /// Message and actions for a warning category.
    pub fn for_category(category: NotificationCategory) -> (&'static str, &'static [WarningAction]) {
        match category {
            NotificationCategory::ClockDrift => (
                "Your device clock differs from the actual time. Please check your date and time settings.",
                &[Self::OpenTimeSettings, Self::Dismiss],
            ),
            NotificationCategory::TimeCorrection => (
                "Your device clock is significantly wrong. Correct it to continue using the app.",
                &[Self::OpenTimeSettings],
            ),
            NotificationCategory::Suspicious => (
                "Unusual activity was detected on this account. It has been reported for review.",
                &[Self::ContactSupport, Self::Dismiss],
            ),
            NotificationCategory::Locked => (
                "This account has been locked after repeated security violations.",
                &[Self::Unlock, Self::ContactSupport],
            ),
            NotificationCategory::Payment => (
                "Too many payment attempts. Please wait a few minutes before trying again.",
                &[Self::Dismiss],
            ),
        }
    }
}

/// Presents warnings to the user.
pub trait HostNotifier: Send + Sync {
    /// Show a warning. Must not block.
    fn present_warning(&self, category: NotificationCategory, message: &str, actions: &[WarningAction]);
}

/// Confines navigation.
pub trait NavigationControl: Send + Sync {
    /// Allow only the listed pages.
    fn restrict_to(&self, allow_list: &[String]);

    /// Remove any restriction.
    fn lift_restriction(&self);
}

/// Read-only subscription, payment and trial records.
pub trait SubscriptionRecords: Send + Sync {
    /// Current subscription, if the user has one.
    fn subscription(&self) -> Result<Option<SubscriptionSnapshot>, MonitorError>;

    /// Payment history.
    fn payments(&self) -> Result<Vec<PaymentRecord>, MonitorError>;

    /// Trial usage.
    fn trial(&self) -> Result<Option<TrialRecord>, MonitorError>;
}

/// Receives security reports when the network is available.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Submit one report.
    async fn submit(&self, report: &SecurityReport) -> Result<(), MonitorError>;
}

/// Host that ignores warnings and navigation, and has no records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHost;

impl HostNotifier for NoopHost {
    fn present_warning(&self, _category: NotificationCategory, _message: &str, _actions: &[WarningAction]) {}
}

impl NavigationControl for NoopHost {
    fn restrict_to(&self, _allow_list: &[String]) {}

    fn lift_restriction(&self) {}
}

impl SubscriptionRecords for NoopHost {
    fn subscription(&self) -> Result<Option<SubscriptionSnapshot>, MonitorError> {
        Ok(None)
    }

    fn payments(&self) -> Result<Vec<PaymentRecord>, MonitorError> {
        Ok(Vec::new())
    }

    fn trial(&self) -> Result<Option<TrialRecord>, MonitorError> {
        Ok(None)
    }
}
