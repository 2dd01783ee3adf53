//! Error types for monitoring operations.

use examguard_store::StoreError;
use thiserror::Error;

use crate::types::SecurityState;

/// Errors that can occur while monitoring.
///
/// None of these is ever shown to the end user. Detector failures degrade
/// to "no observation this cycle" and never escalate state on their own.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Storage or network failure; retried on the next cycle.
    #[error("Transient I/O failure: {message}")]
    TransientIo {
        /// Error message.
        message: String,
    },

    /// Trusted time response could not be used.
    #[error("Trusted time unusable: {reason}")]
    DriftClassification {
        /// Reason the response was rejected.
        reason: String,
    },

    /// Ledger reached its retention cap. Handled by eviction.
    #[error("Ledger at capacity ({capacity} entries)")]
    LedgerCapacity {
        /// Configured capacity.
        capacity: usize,
    },

    /// A state transition outside the allowed table was requested.
    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition {
        /// State before the transition.
        from: SecurityState,
        /// Requested state.
        to: SecurityState,
    },

    /// Administrative unlock token did not verify.
    #[error("Unlock rejected")]
    UnlockRejected,

    /// Operation requires `initialize()` first.
    #[error("Monitor not initialized")]
    NotInitialized,

    /// The monitor driver has stopped.
    #[error("Monitor driver stopped")]
    DriverStopped,

    /// Configuration error.
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message.
        message: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitorError {
    /// Create a transient I/O error from a message.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientIo {
            message: message.into(),
        }
    }

    /// Create a drift classification error from a reason.
    #[must_use]
    pub fn drift(reason: impl Into<String>) -> Self {
        Self::DriftClassification {
            reason: reason.into(),
        }
    }

    /// Create a configuration error from a message.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Check if this error is expected to clear on a later cycle.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientIo { .. } | Self::DriftClassification { .. } | Self::LedgerCapacity { .. }
        )
    }

    /// Check if this error may change security state by itself.
    ///
    /// Always false: absence of evidence is never evidence of tampering.
    #[must_use]
    pub fn escalates_state(&self) -> bool {
        false
    }
}

impl From<StoreError> for MonitorError {
    fn from(err: StoreError) -> Self {
        Self::TransientIo {
            message: err.to_string(),
        }
    }
}
