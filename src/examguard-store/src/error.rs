//! Error types for store operations.

use thiserror::Error;

/// Errors that can occur while reading or writing the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failed.
    #[error("Store I/O failed for {key}: {source}")]
    Io {
        /// Key being accessed when the failure happened.
        key: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Store lock was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    Poisoned,

    /// Key cannot be represented by this backend.
    #[error("Invalid key: {key}")]
    InvalidKey {
        /// The rejected key.
        key: String,
    },

    /// Stored bytes are not valid UTF-8.
    #[error("Corrupt value for {key}")]
    Corrupt {
        /// Key holding the corrupt value.
        key: String,
    },

    /// Backend is not available (for example, quota exhausted or disabled).
    #[error("Store unavailable: {reason}")]
    Unavailable {
        /// Reason the store is unavailable.
        reason: String,
    },
}

impl StoreError {
    /// Create an I/O error for a key.
    #[must_use]
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }

    /// Create an unavailable error from a reason.
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}
