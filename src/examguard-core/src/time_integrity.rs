//! Time-integrity checking.
//!
//! The local wall clock is compared against the best trusted reference
//! available, in order of preference:
//!
//! ```text
//!  ┌──────────────────┐  ok   ┌───────────────────────────────┐
//!  │ TrustedTimeSource├──────►│ drift = local - trusted       │ Oracle
//!  └────────┬─────────┘       └───────────────────────────────┘
//!           │ timeout / error / malformed
//!           ▼
//!  ┌──────────────────┐  yes  ┌───────────────────────────────┐
//!  │ session anchor?  ├──────►│ trusted ≈ anchor + monotonic Δ│ Extrapolated
//!  └────────┬─────────┘       └───────────────────────────────┘
//!           │ no
//!           ▼
//!  ┌──────────────────┐  yes  ┌───────────────────────────────┐
//!  │ persisted anchor?├──────►│ only a rollback is observable │ Extrapolated
//!  └────────┬─────────┘       └───────────────────────────────┘
//!           │ no
//!           ▼
//!     no observation
//! ```
//!
//! A reading is turned into a finding by [`TimeIntegrityChecker::evaluate`]:
//! a first MINOR drift is corrected silently, a recurring one within the
//! recurrence window records `TimeMismatch`, and MAJOR/EXTREME record one
//! event per drift episode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{duration_ms, Clock};
use crate::config::DriftThresholds;
use crate::error::MonitorError;
use crate::repository::{keys, SecurityRepository};
use crate::types::{DriftClassification, SecurityEventType};

/// Trusted readings before this instant (2020-01-01) are rejected as
/// malformed.
const MIN_PLAUSIBLE_MS: i64 = 1_577_836_800_000;

/// A MAJOR/EXTREME episode older than this is recorded again.
const EPISODE_TTL: Duration = Duration::from_secs(60 * 60);

/// Source of trusted wall-clock time.
#[async_trait]
pub trait TrustedTimeSource: Send + Sync {
    /// Fetch the current trusted time (Unix milliseconds).
    ///
    /// Implementations should honour `timeout`; the checker enforces it
    /// regardless.
    async fn fetch_trusted_time(&self, timeout: Duration) -> Result<i64, MonitorError>;
}

/// Source for hosts that have no trusted reference at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableTimeSource;

#[async_trait]
impl TrustedTimeSource for UnavailableTimeSource {
    async fn fetch_trusted_time(&self, _timeout: Duration) -> Result<i64, MonitorError> {
        Err(MonitorError::transient("no trusted time source configured"))
    }
}

/// Source that always answers with the same instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource {
    trusted_ms: i64,
}

impl FixedTimeSource {
    /// Answer every fetch with `trusted_ms`.
    pub fn new(trusted_ms: i64) -> Self {
        Self { trusted_ms }
    }
}

#[async_trait]
impl TrustedTimeSource for FixedTimeSource {
    async fn fetch_trusted_time(&self, _timeout: Duration) -> Result<i64, MonitorError> {
        Ok(self.trusted_ms)
    }
}

/// Trusted time from the `Date` header of an HTTPS endpoint.
#[cfg(feature = "http-time")]
pub struct HttpDateTimeSource {
    client: reqwest::Client,
    url: String,
}

#[cfg(feature = "http-time")]
impl HttpDateTimeSource {
    /// Create a source that issues `HEAD url`.
    pub fn new(url: &str) -> Result<Self, MonitorError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .pool_max_idle_per_host(1)
            .user_agent(format!("examguard/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MonitorError::transient(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[cfg(feature = "http-time")]
#[async_trait]
impl TrustedTimeSource for HttpDateTimeSource {
    async fn fetch_trusted_time(&self, timeout: Duration) -> Result<i64, MonitorError> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .head(&self.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                debug!(url = %self.url, error = %e, "Trusted time request failed");
                MonitorError::transient(format!("Request to {} failed: {e}", self.url))
            })?;
        let round_trip = started.elapsed();

        let header = response
            .headers()
            .get(reqwest::header::DATE)
            .ok_or_else(|| MonitorError::drift("response has no Date header"))?;
        let header = header
            .to_str()
            .map_err(|_| MonitorError::drift("Date header is not ASCII"))?;
        let date = chrono::DateTime::parse_from_rfc2822(header)
            .map_err(|e| MonitorError::drift(format!("unparseable Date header {header:?}: {e}")))?;

        Ok(date.timestamp_millis() + duration_ms(round_trip) / 2)
    }
}

/// Where a drift reading's trusted reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSource {
    /// Fresh oracle response.
    Oracle,
    /// Extrapolated from an earlier oracle response.
    Extrapolated,
}

/// One drift measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReading {
    /// Severity band.
    pub classification: DriftClassification,
    /// Local minus trusted, in milliseconds (positive = local clock ahead).
    pub drift_ms: i64,
    /// Trusted time estimate at the moment of the reading.
    pub trusted_ms: i64,
    /// Reference used.
    pub source: DriftSource,
}

impl DriftReading {
    /// Absolute drift.
    pub fn magnitude(&self) -> Duration {
        Duration::from_millis(self.drift_ms.unsigned_abs())
    }
}

/// Last confirmed-good pairing of local and trusted time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeAnchor {
    /// Local clock at the reading.
    pub local_ms: i64,
    /// Trusted time at the reading.
    pub trusted_ms: i64,
}

/// In-process anchor tied to the monotonic clock.
#[derive(Debug, Clone, Copy)]
struct SessionAnchor {
    trusted_ms: i64,
    monotonic_ms: u64,
}

/// Last MAJOR/EXTREME episode that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct DriftEpisode {
    classification: DriftClassification,
    drift_ms: i64,
    recorded_trusted_ms: i64,
}

/// Last MINOR drift seen, and whether the clock has read OK since.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct MinorEpisode {
    drift_ms: i64,
    seen_trusted_ms: i64,
    corrected: bool,
}

/// A drift reading that should be recorded in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftFinding {
    /// Event type to record.
    pub event_type: SecurityEventType,
    /// Evidence.
    pub payload: serde_json::Value,
}

/// Result of one full drift check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriftCheck {
    /// Reading, or `None` when no reference was available.
    pub reading: Option<DriftReading>,
    /// Finding to record, if any.
    pub finding: Option<DriftFinding>,
}

/// Compares the local clock against a trusted reference.
pub struct TimeIntegrityChecker {
    repo: SecurityRepository,
    clock: Arc<dyn Clock>,
    source: Arc<dyn TrustedTimeSource>,
    thresholds: DriftThresholds,
    timeout: Duration,
    session_anchor: Option<SessionAnchor>,
    online: bool,
}

impl TimeIntegrityChecker {
    /// Create a checker.
    pub fn new(
        repo: SecurityRepository,
        clock: Arc<dyn Clock>,
        source: Arc<dyn TrustedTimeSource>,
        thresholds: DriftThresholds,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            clock,
            source,
            thresholds,
            timeout,
            session_anchor: None,
            online: true,
        }
    }

    /// Measure drift and turn it into a finding.
    #[instrument(skip(self))]
    pub async fn check(&mut self) -> DriftCheck {
        let reading = self.check_drift().await;
        let finding = reading.and_then(|r| self.evaluate(&r));
        DriftCheck { reading, finding }
    }

    /// Measure drift against the best available reference.
    ///
    /// Returns `None` when no reference exists. Never fails: every error on
    /// the oracle path falls back to extrapolation.
    pub async fn check_drift(&mut self) -> Option<DriftReading> {
        if !self.online {
            return self.extrapolate();
        }
        match self.fetch_oracle().await {
            Ok(trusted_ms) => Some(self.oracle_reading(trusted_ms)),
            Err(e) => {
                debug!(error = %e, "Trusted time unavailable, extrapolating");
                self.extrapolate()
            },
        }
    }

    async fn fetch_oracle(&self) -> Result<i64, MonitorError> {
        let trusted =
            match tokio::time::timeout(self.timeout, self.source.fetch_trusted_time(self.timeout))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(MonitorError::transient(format!(
                        "trusted time fetch exceeded {:?}",
                        self.timeout
                    )))
                },
            };
        if trusted < MIN_PLAUSIBLE_MS {
            return Err(MonitorError::drift(format!(
                "implausible trusted time {trusted}"
            )));
        }
        Ok(trusted)
    }

    fn oracle_reading(&mut self, trusted_ms: i64) -> DriftReading {
        let local_ms = self.clock.now_ms();
        self.session_anchor = Some(SessionAnchor {
            trusted_ms,
            monotonic_ms: self.clock.monotonic_ms(),
        });

        let reading = self.reading(local_ms, trusted_ms, DriftSource::Oracle);
        if reading.classification == DriftClassification::Ok {
            let anchor = TimeAnchor {
                local_ms,
                trusted_ms,
            };
            if let Err(e) = self.repo.save_json(keys::TIME_ANCHOR, &anchor) {
                warn!(error = %e, "Failed to persist time anchor");
            }
        }
        reading
    }

    fn extrapolate(&self) -> Option<DriftReading> {
        let local_ms = self.clock.now_ms();

        if let Some(anchor) = self.session_anchor {
            let elapsed = self.clock.monotonic_ms().saturating_sub(anchor.monotonic_ms);
            let trusted_ms = anchor
                .trusted_ms
                .saturating_add(i64::try_from(elapsed).unwrap_or(i64::MAX));
            return Some(self.reading(local_ms, trusted_ms, DriftSource::Extrapolated));
        }

        let anchor = match self.repo.load_json::<TimeAnchor>(keys::TIME_ANCHOR) {
            Ok(Some(anchor)) => anchor,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Time anchor unreadable");
                return None;
            },
        };

        // Across restarts there is no monotonic reference, so only a clock
        // set behind the last confirmed trusted time is observable.
        let offset = anchor.local_ms - anchor.trusted_ms;
        let corrected = local_ms - offset;
        if corrected >= anchor.trusted_ms {
            return None;
        }
        let mut reading =
            self.reading(local_ms, anchor.trusted_ms + offset, DriftSource::Extrapolated);
        reading.trusted_ms = anchor.trusted_ms;
        Some(reading)
    }

    fn reading(&self, local_ms: i64, trusted_ms: i64, source: DriftSource) -> DriftReading {
        let drift_ms = local_ms.saturating_sub(trusted_ms);
        let classification = self
            .thresholds
            .classify(Duration::from_millis(drift_ms.unsigned_abs()));
        debug!(drift_ms, ?classification, ?source, "Drift reading");
        DriftReading {
            classification,
            drift_ms,
            trusted_ms,
            source,
        }
    }

    /// Decide whether a reading should be recorded.
    pub fn evaluate(&mut self, reading: &DriftReading) -> Option<DriftFinding> {
        match reading.classification {
            DriftClassification::Ok => {
                self.clear_episode();
                self.mark_minor_corrected();
                None
            },
            DriftClassification::Minor => self.evaluate_minor(reading),
            DriftClassification::Major | DriftClassification::Extreme => {
                self.evaluate_severe(reading)
            },
        }
    }

    fn evaluate_minor(&self, reading: &DriftReading) -> Option<DriftFinding> {
        let now = reading.trusted_ms;
        let previous = self
            .repo
            .load_json::<MinorEpisode>(keys::TIME_MINOR_SEEN)
            .unwrap_or_else(|e| {
                debug!(error = %e, "Minor-drift record unreadable");
                None
            });

        let window = duration_ms(self.thresholds.minor_recurrence_window);
        let tolerance = duration_ms(self.thresholds.ok_max);
        let recent = previous.filter(|p| now >= p.seen_trusted_ms && now - p.seen_trusted_ms < window);

        // A steady offset is the drift already corrected, not a recurrence.
        if let Some(p) = recent {
            if !p.corrected && (p.drift_ms - reading.drift_ms).abs() <= tolerance {
                debug!(drift_ms = reading.drift_ms, "Minor clock drift unchanged");
                return None;
            }
        }

        let episode = MinorEpisode {
            drift_ms: reading.drift_ms,
            seen_trusted_ms: now,
            corrected: false,
        };
        if let Err(e) = self.repo.save_json(keys::TIME_MINOR_SEEN, &episode) {
            warn!(error = %e, "Failed to persist minor-drift record");
        }

        if recent.is_some() {
            info!(drift_ms = reading.drift_ms, "Minor clock drift recurred");
            Some(DriftFinding {
                event_type: SecurityEventType::TimeMismatch,
                payload: payload(reading),
            })
        } else {
            debug!(drift_ms = reading.drift_ms, "Minor clock drift, silent correction");
            None
        }
    }

    fn mark_minor_corrected(&self) {
        let record = self
            .repo
            .load_json::<MinorEpisode>(keys::TIME_MINOR_SEEN)
            .unwrap_or_default();
        if let Some(mut episode) = record.filter(|e| !e.corrected) {
            episode.corrected = true;
            if let Err(e) = self.repo.save_json(keys::TIME_MINOR_SEEN, &episode) {
                debug!(error = %e, "Failed to mark minor drift corrected");
            }
        }
    }

    fn evaluate_severe(&self, reading: &DriftReading) -> Option<DriftFinding> {
        let previous = self
            .repo
            .load_json::<DriftEpisode>(keys::TIME_EPISODE)
            .unwrap_or_else(|e| {
                debug!(error = %e, "Drift episode unreadable");
                None
            });

        let tolerance = duration_ms(self.thresholds.ok_max);
        let same_episode = previous.is_some_and(|p| {
            p.classification == reading.classification
                && (p.drift_ms - reading.drift_ms).abs() <= tolerance
                && reading.trusted_ms >= p.recorded_trusted_ms
                && reading.trusted_ms - p.recorded_trusted_ms < duration_ms(EPISODE_TTL)
        });
        if same_episode {
            debug!(drift_ms = reading.drift_ms, "Drift episode already recorded");
            return None;
        }

        let episode = DriftEpisode {
            classification: reading.classification,
            drift_ms: reading.drift_ms,
            recorded_trusted_ms: reading.trusted_ms,
        };
        if let Err(e) = self.repo.save_json(keys::TIME_EPISODE, &episode) {
            warn!(error = %e, "Failed to persist drift episode");
        }

        let event_type = if reading.classification == DriftClassification::Extreme {
            SecurityEventType::ClockDriftExtreme
        } else {
            SecurityEventType::ClockDriftMajor
        };
        warn!(
            drift_ms = reading.drift_ms,
            classification = ?reading.classification,
            "Clock drift detected"
        );
        Some(DriftFinding {
            event_type,
            payload: payload(reading),
        })
    }

    fn clear_episode(&self) {
        if let Err(e) = self.repo.delete(keys::TIME_EPISODE) {
            debug!(error = %e, "Failed to clear drift episode");
        }
    }

    /// Skip the oracle while the host reports no connectivity.
    pub fn set_online(&mut self, online: bool) {
        self.online = online;
    }
}

fn payload(reading: &DriftReading) -> serde_json::Value {
    serde_json::json!({
        "drift_ms": reading.drift_ms,
        "trusted_ms": reading.trusted_ms,
        "source": reading.source,
    })
}
