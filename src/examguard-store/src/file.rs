//! Directory-backed store.
//!
//! Each key lives in its own file so that appends from two processes never
//! contend on a shared document. File names are the hex encoding of the key,
//! which keeps arbitrary key characters (`/`, `:`) off the filesystem and lets
//! prefix scans decode names back to keys.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace, warn};

use crate::error::StoreError;
use crate::KeyValueStore;

/// Extension for committed records.
const RECORD_EXT: &str = "rec";

/// Store that keeps one file per key under a directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(dir.display().to_string(), e))?;
        debug!(dir = %dir.display(), "FileStore: opened");
        Ok(Self {
            dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self
            .dir
            .join(format!("{}.{}", hex::encode(key.as_bytes()), RECORD_EXT)))
    }

    fn decode_name(name: &str) -> Option<String> {
        let stem = name.strip_suffix(RECORD_EXT)?.strip_suffix('.')?;
        let bytes = hex::decode(stem).ok()?;
        String::from_utf8(bytes).ok()
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.record_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::Corrupt {
                    key: key.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.record_path(key)?;
        // Write-then-rename so readers never observe a half-written record.
        let tmp = path.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, value.as_bytes()).map_err(|e| StoreError::io(key, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(key, e));
        }
        trace!(key = %key, bytes = value.len(), "FileStore: wrote record");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.record_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| StoreError::io(self.dir.display().to_string(), e))?;

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match Self::decode_name(name) {
                Some(key) if key.starts_with(prefix) => keys.push(key),
                Some(_) => {},
                None => {
                    if !name.contains(".tmp-") {
                        warn!(file = %name, "FileStore: ignoring foreign file");
                    }
                },
            }
        }
        keys.sort();
        Ok(keys)
    }
}
