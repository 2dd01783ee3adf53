//! Typed access to the persistent store.
//!
//! All engine records live under a single versioned key namespace. Callers
//! go through [`SecurityRepository`] rather than formatting keys themselves,
//! so the layout is defined in exactly one place.
//!
//! ```text
//! v1/
//! ├── fingerprint/id            DeviceFingerprint
//! ├── fingerprint/components    EnvironmentComponents
//! ├── ledger/event/<ts>-<id>    SecurityEvent (one key per event)
//! ├── ledger/reset_at           counter watermark
//! ├── state                     StateRecord
//! ├── time/anchor               TimeAnchor
//! ├── time/minor_seen           last silent MINOR correction
//! ├── time/episode              last recorded drift episode
//! ├── throttle/<category>       ThrottleRecord
//! ├── tamper/seen/<kind>        finding digest
//! ├── payment/attempt/<ts>-<id> attempt timestamp
//! ├── session/<session_id>      SessionHeartbeat
//! └── report/pending/<ts>       SecurityReport
//! ```

use std::sync::Arc;

use examguard_store::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::MonitorError;
use crate::security::{constant_time_eq, sha256_hex};
use crate::types::{EnforcementAction, SecurityState};

/// Store key layout.
pub mod keys {
    /// Namespace version prefix.
    pub const ROOT: &str = "v1/";
    /// Fingerprint digest.
    pub const FINGERPRINT_ID: &str = "v1/fingerprint/id";
    /// Raw fingerprint components.
    pub const FINGERPRINT_COMPONENTS: &str = "v1/fingerprint/components";
    /// Ledger event prefix.
    pub const LEDGER_EVENT_PREFIX: &str = "v1/ledger/event/";
    /// Counter watermark.
    pub const LEDGER_RESET_AT: &str = "v1/ledger/reset_at";
    /// Security state.
    pub const STATE: &str = "v1/state";
    /// Last confirmed-good time pair.
    pub const TIME_ANCHOR: &str = "v1/time/anchor";
    /// Last silent MINOR correction.
    pub const TIME_MINOR_SEEN: &str = "v1/time/minor_seen";
    /// Last recorded drift episode.
    pub const TIME_EPISODE: &str = "v1/time/episode";
    /// Throttle record prefix.
    pub const THROTTLE_PREFIX: &str = "v1/throttle/";
    /// Tamper finding digest prefix.
    pub const TAMPER_SEEN_PREFIX: &str = "v1/tamper/seen/";
    /// Payment attempt prefix.
    pub const PAYMENT_ATTEMPT_PREFIX: &str = "v1/payment/attempt/";
    /// Session heartbeat prefix.
    pub const SESSION_PREFIX: &str = "v1/session/";
    /// Pending report prefix.
    pub const REPORT_PENDING_PREFIX: &str = "v1/report/pending/";

    /// Key for one ledger event. Zero-padded so lexical order is time order.
    pub fn ledger_event(timestamp_ms: i64, id: &str) -> String {
        format!("{LEDGER_EVENT_PREFIX}{:016}-{id}", timestamp_ms.max(0))
    }

    /// Key for one throttle category.
    pub fn throttle(category: &str) -> String {
        format!("{THROTTLE_PREFIX}{category}")
    }

    /// Key for one tamper finding kind.
    pub fn tamper_seen(kind: &str) -> String {
        format!("{TAMPER_SEEN_PREFIX}{kind}")
    }

    /// Key for one payment attempt.
    pub fn payment_attempt(timestamp_ms: i64, id: &str) -> String {
        format!("{PAYMENT_ATTEMPT_PREFIX}{:016}-{id}", timestamp_ms.max(0))
    }

    /// Key for one session heartbeat.
    pub fn session(session_id: &str) -> String {
        format!("{SESSION_PREFIX}{session_id}")
    }

    /// Key for one pending report.
    pub fn report_pending(timestamp_ms: i64, id: &str) -> String {
        format!("{REPORT_PENDING_PREFIX}{:016}-{id}", timestamp_ms.max(0))
    }
}

/// Salt mixed into the state record seal.
const STATE_SEAL_DOMAIN: &str = "examguard-state-seal:v1:";

/// Persisted security state.
///
/// Sealed like ledger events. The seal covers the counter watermark in
/// force when the record was written, so a de-escalation can be tied to the
/// unlock that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Current state.
    pub state: SecurityState,
    /// When the state was entered (local Unix milliseconds).
    pub since_ms: i64,
    /// Enforcement action last issued.
    pub enforcement: EnforcementAction,
    /// Counter watermark when the record was written.
    #[serde(default)]
    pub reset_at_ms: Option<i64>,
    /// SHA-256 over the fields above.
    #[serde(default)]
    pub seal: String,
}

impl StateRecord {
    /// Build and seal a record.
    pub fn new(state: SecurityState, since_ms: i64, reset_at_ms: Option<i64>) -> Self {
        let mut record = Self {
            state,
            since_ms,
            enforcement: state.enforcement_action(),
            reset_at_ms,
            seal: String::new(),
        };
        record.seal = record.compute_seal();
        record
    }

    /// Compute the expected seal.
    pub fn compute_seal(&self) -> String {
        let canonical = serde_json::json!({
            "state": self.state,
            "since_ms": self.since_ms,
            "enforcement": self.enforcement,
            "reset_at_ms": self.reset_at_ms,
        });
        sha256_hex(format!("{STATE_SEAL_DOMAIN}{canonical}").as_bytes())
    }

    /// Verify the stored seal.
    pub fn verify_seal(&self) -> bool {
        constant_time_eq(self.compute_seal().as_bytes(), self.seal.as_bytes())
    }
}

/// Typed repository over a [`KeyValueStore`].
#[derive(Clone)]
pub struct SecurityRepository {
    store: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for SecurityRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityRepository").finish_non_exhaustive()
    }
}

impl SecurityRepository {
    /// Wrap a store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Read a raw string value.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>, MonitorError> {
        Ok(self.store.get(key)?)
    }

    /// Write a raw string value.
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), MonitorError> {
        Ok(self.store.set(key, value)?)
    }

    /// Read and decode a JSON record.
    ///
    /// An undecodable record is reported as `Ok(None)` with a warning: a
    /// corrupt record is no evidence of anything.
    pub fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, MonitorError> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Ignoring undecodable record");
                Ok(None)
            },
        }
    }

    /// Encode and write a JSON record.
    pub fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MonitorError> {
        let json = serde_json::to_string(value)?;
        self.store.set(key, &json)?;
        Ok(())
    }

    /// Delete a key.
    pub fn delete(&self, key: &str) -> Result<(), MonitorError> {
        Ok(self.store.delete(key)?)
    }

    /// Keys under a prefix, in lexical order.
    pub fn keys(&self, prefix: &str) -> Result<Vec<String>, MonitorError> {
        let mut keys = self.store.keys_with_prefix(prefix)?;
        keys.sort();
        Ok(keys)
    }

    /// Load the persisted state.
    pub fn load_state(&self) -> Result<Option<StateRecord>, MonitorError> {
        self.load_json(keys::STATE)
    }

    /// Persist the state.
    pub fn save_state(&self, record: &StateRecord) -> Result<(), MonitorError> {
        self.save_json(keys::STATE, record)
    }

    /// Load the counter watermark.
    pub fn load_reset_at(&self) -> Result<Option<i64>, MonitorError> {
        self.load_json(keys::LEDGER_RESET_AT)
    }

    /// Persist the counter watermark.
    pub fn save_reset_at(&self, reset_at_ms: i64) -> Result<(), MonitorError> {
        self.save_json(keys::LEDGER_RESET_AT, &reset_at_ms)
    }
}

#[cfg(test)]
mod tests {
    use examguard_store::MemoryStore;

    use super::*;

    fn repo() -> SecurityRepository {
        SecurityRepository::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_event_keys_sort_by_time() {
        let a = keys::ledger_event(999, "ffff");
        let b = keys::ledger_event(1_000, "0000");
        assert!(a < b);
        assert!(a.starts_with(keys::LEDGER_EVENT_PREFIX));
    }

    #[test]
    fn test_state_roundtrip() {
        let repo = repo();
        assert!(repo.load_state().unwrap().is_none());

        let record = StateRecord::new(SecurityState::Warning, 42, None);
        assert_eq!(record.enforcement, EnforcementAction::Warn);
        repo.save_state(&record).unwrap();
        let loaded = repo.load_state().unwrap().unwrap();
        assert!(loaded.verify_seal());
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_state_seal_covers_state_and_watermark() {
        let record = StateRecord::new(SecurityState::Locked, 42, Some(7));

        let mut downgraded = record.clone();
        downgraded.state = SecurityState::Normal;
        assert!(!downgraded.verify_seal());

        let mut rewound = record;
        rewound.reset_at_ms = Some(99);
        assert!(!rewound.verify_seal());

        let unsealed: StateRecord =
            serde_json::from_str(r#"{"state":"normal","since_ms":1,"enforcement":"none"}"#).unwrap();
        assert!(!unsealed.verify_seal());
    }

    #[test]
    fn test_corrupt_record_reads_as_absent() {
        let repo = repo();
        repo.set_raw(keys::STATE, "{not json").unwrap();
        assert!(repo.load_state().unwrap().is_none());
    }

    #[test]
    fn test_keys_are_sorted() {
        let repo = repo();
        repo.set_raw(&keys::throttle("b"), "1").unwrap();
        repo.set_raw(&keys::throttle("a"), "1").unwrap();
        repo.set_raw(keys::STATE, "1").unwrap();
        assert_eq!(
            repo.keys(keys::THROTTLE_PREFIX).unwrap(),
            vec!["v1/throttle/a".to_string(), "v1/throttle/b".to_string()]
        );
    }
}
