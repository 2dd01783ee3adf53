//! # examguard-store
//!
//! Persistent key-value storage for the examguard integrity engine.
//!
//! The engine never talks to a concrete backend. It only needs four
//! operations, exposed through [`KeyValueStore`]:
//!
//! | Operation | Semantics |
//! |-----------|-----------|
//! | `get` | Value for a key, or `None` |
//! | `set` | Insert or replace a single key |
//! | `delete` | Remove a key (missing keys are not an error) |
//! | `keys_with_prefix` | All keys starting with a prefix, sorted ascending |
//!
//! Writes are single-key. Callers that need append semantics (the violation
//! ledger, payment attempts, session heartbeats) write one key per record so
//! that two overlapping writers never clobber each other.
//!
//! ## Backends
//!
//! - [`MemoryStore`] - in-process map, used by tests and ephemeral hosts
//! - [`FileStore`] - one file per key inside a directory
//!
//! ## Usage
//!
//! ```rust
//! use examguard_store::{KeyValueStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! store.set("v1/state", "{\"state\":\"normal\"}").unwrap();
//! assert!(store.get("v1/state").unwrap().is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

mod error;
mod file;
mod memory;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;

/// Synchronous key-value store shared by every examguard component.
///
/// Implementations must be safe to call from several contexts at once; the
/// engine relies on single-key atomicity only.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key. Removing a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List keys starting with `prefix`, sorted ascending.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        (**self).delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        (**self).keys_with_prefix(prefix)
    }
}
