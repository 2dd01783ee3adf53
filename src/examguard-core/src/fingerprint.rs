//! Device fingerprint derivation.
//!
//! A fingerprint is a digest over a fixed list of environment components,
//! tagged with the scheme that produced it:
//!
//! ```text
//! fp2-sha256:3f9a…   (SHA-256, default)
//! fp2-fnv1a64:91c2…  (FNV-1a 64-bit rolling hash, fallback)
//! ```
//!
//! Once generated, the fingerprint is persisted and returned unchanged on
//! every later call, even when individual components drift (window resize,
//! locale switch). Consistency is judged separately by comparing the raw
//! component snapshot field by field, with a tolerance.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::error::MonitorError;
use crate::repository::{keys, SecurityRepository};

/// Scheme version carried in every tag.
const SCHEME_VERSION: &str = "fp2";

/// Field changes tolerated before the environment counts as inconsistent.
pub const DEFAULT_MISMATCH_TOLERANCE: usize = 2;

/// Digest algorithm for fingerprints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintScheme {
    /// SHA-256 over the canonical component string.
    #[default]
    Sha256,
    /// FNV-1a 64-bit. Not collision resistant; for hosts without SHA-256.
    Fnv1a64,
}

impl FingerprintScheme {
    /// Tag prefixed to fingerprints of this scheme.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Sha256 => "fp2-sha256",
            Self::Fnv1a64 => "fp2-fnv1a64",
        }
    }

    /// Hex digest of `input`.
    pub fn digest(self, input: &[u8]) -> String {
        match self {
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(input);
                hex::encode(hasher.finalize())
            },
            Self::Fnv1a64 => format!("{:016x}", fnv1a64(input)),
        }
    }
}

/// FNV-1a, 64-bit.
fn fnv1a64(input: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    input.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(PRIME)
    })
}

/// Opaque per-device identifier: `<scheme-tag>:<hex digest>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceFingerprint(String);

impl DeviceFingerprint {
    /// Wrap an existing fingerprint string.
    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The fingerprint as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Scheme tag portion, if well formed.
    pub fn scheme_tag(&self) -> Option<&str> {
        self.0.split_once(':').map(|(tag, _)| tag)
    }
}

impl fmt::Display for DeviceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw environment signals a fingerprint is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentComponents {
    /// User agent string.
    pub user_agent: String,
    /// Preferred locale.
    pub locale: String,
    /// Screen width in pixels.
    pub screen_width: u32,
    /// Screen height in pixels.
    pub screen_height: u32,
    /// Offset from UTC in minutes.
    pub timezone_offset_minutes: i32,
    /// Logical CPU count.
    pub hardware_concurrency: u32,
    /// Hash of a rendering-surface probe.
    pub rendering_hash: String,
    /// Hash of an audio-pipeline probe.
    pub audio_hash: String,
}

impl EnvironmentComponents {
    /// Named field values in canonical order.
    pub fn fields(&self) -> [(&'static str, String); 8] {
        [
            ("user_agent", self.user_agent.clone()),
            ("locale", self.locale.clone()),
            ("screen_width", self.screen_width.to_string()),
            ("screen_height", self.screen_height.to_string()),
            (
                "timezone_offset_minutes",
                self.timezone_offset_minutes.to_string(),
            ),
            ("hardware_concurrency", self.hardware_concurrency.to_string()),
            ("rendering_hash", self.rendering_hash.clone()),
            ("audio_hash", self.audio_hash.clone()),
        ]
    }

    /// Canonical digest input.
    fn canonical(&self) -> String {
        let mut out = String::from(SCHEME_VERSION);
        for (_, value) in self.fields() {
            out.push('|');
            out.push_str(&value.replace('|', "\\|"));
        }
        out
    }

    /// Names of fields that differ from `other`.
    pub fn mismatched_fields(&self, other: &Self) -> Vec<&'static str> {
        self.fields()
            .into_iter()
            .zip(other.fields())
            .filter(|((_, a), (_, b))| a != b)
            .map(|((name, _), _)| name)
            .collect()
    }
}

/// Source of environment components.
pub trait EnvironmentProbe: Send + Sync {
    /// Sample the current environment.
    fn components(&self) -> Result<EnvironmentComponents, MonitorError>;
}

/// Probe returning values supplied by the host application.
#[derive(Debug, Default)]
pub struct HostEnvironment {
    components: RwLock<EnvironmentComponents>,
}

impl HostEnvironment {
    /// Create a probe with fixed initial values.
    pub fn new(components: EnvironmentComponents) -> Self {
        Self {
            components: RwLock::new(components),
        }
    }

    /// Replace values, e.g. after a window resize.
    pub fn update(&self, f: impl FnOnce(&mut EnvironmentComponents)) {
        match self.components.write() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl EnvironmentProbe for HostEnvironment {
    fn components(&self) -> Result<EnvironmentComponents, MonitorError> {
        self.components
            .read()
            .map(|c| c.clone())
            .map_err(|_| MonitorError::transient("environment lock poisoned"))
    }
}

/// Best-effort probe for native hosts.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl EnvironmentProbe for SystemEnvironment {
    fn components(&self) -> Result<EnvironmentComponents, MonitorError> {
        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .unwrap_or_else(|_| "und".to_string());
        let offset_secs = chrono::Local::now().offset().local_minus_utc();
        let cpus = std::thread::available_parallelism()
            .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
            .unwrap_or(1);

        Ok(EnvironmentComponents {
            user_agent: format!(
                "examguard/{} ({}; {})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            locale,
            screen_width: 0,
            screen_height: 0,
            timezone_offset_minutes: offset_secs / 60,
            hardware_concurrency: cpus,
            rendering_hash: FingerprintScheme::Sha256
                .digest(std::env::consts::FAMILY.as_bytes()),
            audio_hash: String::new(),
        })
    }
}

/// Result of comparing the live environment to the stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Whether the environment is within tolerance.
    pub matches: bool,
    /// Number of differing fields.
    pub mismatch_count: usize,
    /// Names of differing fields.
    pub mismatched_fields: Vec<&'static str>,
}

impl ConsistencyReport {
    fn no_evidence() -> Self {
        Self {
            matches: true,
            mismatch_count: 0,
            mismatched_fields: Vec::new(),
        }
    }
}

/// Derives and persists the device fingerprint.
pub struct FingerprintGenerator {
    repo: SecurityRepository,
    probe: Arc<dyn EnvironmentProbe>,
    scheme: FingerprintScheme,
    tolerance: usize,
}

impl FingerprintGenerator {
    /// Create a generator.
    pub fn new(
        repo: SecurityRepository,
        probe: Arc<dyn EnvironmentProbe>,
        scheme: FingerprintScheme,
    ) -> Self {
        Self {
            repo,
            probe,
            scheme,
            tolerance: DEFAULT_MISMATCH_TOLERANCE,
        }
    }

    /// Override the mismatch tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: usize) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Stored fingerprint, if any.
    pub fn stored(&self) -> Result<Option<DeviceFingerprint>, MonitorError> {
        self.repo.load_json(keys::FINGERPRINT_ID)
    }

    /// Return the stored fingerprint, generating and persisting one if none
    /// exists.
    ///
    /// A failed read is propagated rather than treated as "absent", so a
    /// flaky store can never cause a silent overwrite.
    #[instrument(skip(self))]
    pub fn get_or_create(&self) -> Result<DeviceFingerprint, MonitorError> {
        if let Some(existing) = self.stored()? {
            return Ok(existing);
        }

        let components = self.probe.components()?;
        let fingerprint = self.derive(&components);

        if let Err(e) = self.repo.save_json(keys::FINGERPRINT_COMPONENTS, &components) {
            warn!(error = %e, "Failed to persist fingerprint components");
        }
        match self.repo.save_json(keys::FINGERPRINT_ID, &fingerprint) {
            Ok(()) => info!(fingerprint = %fingerprint, "Generated device fingerprint"),
            Err(e) => warn!(error = %e, "Failed to persist device fingerprint"),
        }
        Ok(fingerprint)
    }

    /// Digest a component set with the configured scheme.
    pub fn derive(&self, components: &EnvironmentComponents) -> DeviceFingerprint {
        let digest = self.scheme.digest(components.canonical().as_bytes());
        DeviceFingerprint(format!("{}:{digest}", self.scheme.tag()))
    }

    /// Compare the live environment against the stored component snapshot.
    #[instrument(skip(self))]
    pub fn verify_consistency(&self) -> Result<ConsistencyReport, MonitorError> {
        let Some(stored) = self
            .repo
            .load_json::<EnvironmentComponents>(keys::FINGERPRINT_COMPONENTS)?
        else {
            return Ok(ConsistencyReport::no_evidence());
        };
        let current = self.probe.components()?;
        let mismatched_fields = stored.mismatched_fields(&current);
        let mismatch_count = mismatched_fields.len();
        debug!(mismatch_count, ?mismatched_fields, "Fingerprint consistency");

        Ok(ConsistencyReport {
            matches: mismatch_count <= self.tolerance,
            mismatch_count,
            mismatched_fields,
        })
    }

    /// Current live components.
    pub fn current_components(&self) -> Result<EnvironmentComponents, MonitorError> {
        self.probe.components()
    }

    /// Delete the stored fingerprint and its component snapshot.
    pub fn reset(&self) -> Result<(), MonitorError> {
        self.repo.delete(keys::FINGERPRINT_ID)?;
        self.repo.delete(keys::FINGERPRINT_COMPONENTS)?;
        info!("Device fingerprint reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use examguard_store::MemoryStore;

    use super::*;

    fn sample() -> EnvironmentComponents {
        EnvironmentComponents {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".into(),
            locale: "en-US".into(),
            screen_width: 1920,
            screen_height: 1080,
            timezone_offset_minutes: -300,
            hardware_concurrency: 8,
            rendering_hash: "a1b2".into(),
            audio_hash: "c3d4".into(),
        }
    }

    fn generator(probe: Arc<HostEnvironment>) -> FingerprintGenerator {
        let repo = SecurityRepository::new(Arc::new(MemoryStore::new()));
        FingerprintGenerator::new(repo, probe, FingerprintScheme::Sha256)
    }

    #[test]
    fn test_fnv1a64_known_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_scheme_tag_prefix() {
        let probe = Arc::new(HostEnvironment::new(sample()));
        let fp = generator(probe).get_or_create().unwrap();
        assert_eq!(fp.scheme_tag(), Some("fp2-sha256"));
        assert_eq!(fp.as_str().len(), "fp2-sha256:".len() + 64);
    }

    #[test]
    fn test_stable_across_component_drift() {
        let probe = Arc::new(HostEnvironment::new(sample()));
        let generator = generator(Arc::clone(&probe));

        let first = generator.get_or_create().unwrap();
        probe.update(|c| c.screen_width = 1280);
        let second = generator.get_or_create().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_consistency_tolerates_two_changes() {
        let probe = Arc::new(HostEnvironment::new(sample()));
        let generator = generator(Arc::clone(&probe));
        generator.get_or_create().unwrap();

        probe.update(|c| {
            c.screen_width = 1280;
            c.locale = "de-DE".into();
        });
        let report = generator.verify_consistency().unwrap();
        assert!(report.matches);
        assert_eq!(report.mismatch_count, 2);

        probe.update(|c| c.hardware_concurrency = 2);
        let report = generator.verify_consistency().unwrap();
        assert!(!report.matches);
        assert_eq!(report.mismatch_count, 3);
        assert!(report.mismatched_fields.contains(&"hardware_concurrency"));
    }

    #[test]
    fn test_missing_snapshot_is_no_evidence() {
        let probe = Arc::new(HostEnvironment::new(sample()));
        let report = generator(probe).verify_consistency().unwrap();
        assert!(report.matches);
        assert_eq!(report.mismatch_count, 0);
    }

    #[test]
    fn test_reset_regenerates() {
        let probe = Arc::new(HostEnvironment::new(sample()));
        let generator = generator(Arc::clone(&probe));
        let first = generator.get_or_create().unwrap();

        probe.update(|c| c.user_agent = "Other".into());
        generator.reset().unwrap();
        let second = generator.get_or_create().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_fallback_scheme() {
        let repo = SecurityRepository::new(Arc::new(MemoryStore::new()));
        let generator = FingerprintGenerator::new(
            repo,
            Arc::new(HostEnvironment::new(sample())),
            FingerprintScheme::Fnv1a64,
        );
        let fp = generator.get_or_create().unwrap();
        assert_eq!(fp.scheme_tag(), Some("fp2-fnv1a64"));
        assert_eq!(fp.as_str().len(), "fp2-fnv1a64:".len() + 16);
    }
}
