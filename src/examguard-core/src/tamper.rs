//! Subscription, payment and trial plausibility heuristics.
//!
//! Heuristics only produce findings. Each finding becomes a ledger event in
//! its own category; none of them touches the security state directly.
//!
//! A record that stays implausible would otherwise re-record on every
//! cycle, so each finding carries a stable piece of evidence and is only
//! reported when that evidence changes ([`EvidenceLog`]).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::clock::{duration_ms, Clock};
use crate::config::TamperConfig;
use crate::error::MonitorError;
use crate::host::SubscriptionRecords;
use crate::repository::{keys, SecurityRepository};
use crate::security::{random_id, sha256_hex};
use crate::types::{
    PaymentRecord, PaymentStatus, SecurityEventType, SubscriptionPlan, SubscriptionSnapshot,
    TrialRecord,
};

/// Lenient year length for the far-future rule.
const YEAR_MS: i64 = 366 * 24 * 60 * 60 * 1000;

/// One implausible condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TamperFinding {
    /// Active subscription expiring implausibly far in the future.
    ExpiryTooFarInFuture {
        /// Stored expiry.
        expiry_ms: i64,
        /// Latest plausible expiry at evaluation time.
        limit_ms: i64,
    },
    /// Expired subscription still marked active.
    ExpiredButActive {
        /// Stored expiry.
        expiry_ms: i64,
    },
    /// Paid plan with an expiry but no completed payment for it.
    MissingPaymentLink {
        /// Plan.
        plan: SubscriptionPlan,
        /// Stored expiry.
        expiry_ms: i64,
    },
    /// Expiry beyond what the completed payments paid for.
    ExpiryExceedsPurchasedTerm {
        /// Stored expiry.
        expiry_ms: i64,
        /// Latest expiry the payments justify.
        allowed_ms: i64,
    },
    /// Record modified at a time that has not happened yet.
    ModifiedInFuture {
        /// Stored modification time.
        last_modified_ms: i64,
    },
    /// Too many payment attempts in the rolling window.
    PaymentAbuse {
        /// Attempts in the window.
        attempts: usize,
        /// Oldest attempt in the window.
        first_attempt_ms: i64,
    },
    /// Trial consumed from more than one device.
    TrialAbuse {
        /// Distinct fingerprints on the trial record.
        fingerprints: Vec<String>,
    },
}

impl TamperFinding {
    /// Stable kind identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExpiryTooFarInFuture { .. } => "expiry_too_far_in_future",
            Self::ExpiredButActive { .. } => "expired_but_active",
            Self::MissingPaymentLink { .. } => "missing_payment_link",
            Self::ExpiryExceedsPurchasedTerm { .. } => "expiry_exceeds_purchased_term",
            Self::ModifiedInFuture { .. } => "modified_in_future",
            Self::PaymentAbuse { .. } => "payment_abuse",
            Self::TrialAbuse { .. } => "trial_abuse",
        }
    }

    /// Ledger event type.
    pub fn event_type(&self) -> SecurityEventType {
        match self {
            Self::PaymentAbuse { .. } => SecurityEventType::PaymentAbuse,
            Self::TrialAbuse { .. } => SecurityEventType::TrialAbuse,
            _ => SecurityEventType::SubscriptionTamper,
        }
    }

    /// Evidence that identifies this finding independent of when it was
    /// evaluated.
    pub fn evidence(&self) -> String {
        match self {
            Self::ExpiryTooFarInFuture { expiry_ms, .. }
            | Self::ExpiredButActive { expiry_ms }
            | Self::ExpiryExceedsPurchasedTerm { expiry_ms, .. } => expiry_ms.to_string(),
            Self::MissingPaymentLink { plan, expiry_ms } => format!("{plan:?}:{expiry_ms}"),
            Self::ModifiedInFuture { last_modified_ms } => last_modified_ms.to_string(),
            Self::PaymentAbuse {
                first_attempt_ms, ..
            } => first_attempt_ms.to_string(),
            Self::TrialAbuse { fingerprints } => fingerprints.join(","),
        }
    }

    /// Event payload.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Kinds produced by [`check_subscription`], for clearing stale evidence.
const SUBSCRIPTION_KINDS: [&str; 5] = [
    "expiry_too_far_in_future",
    "expired_but_active",
    "missing_payment_link",
    "expiry_exceeds_purchased_term",
    "modified_in_future",
];

/// Evaluate a subscription snapshot against payment history.
pub fn check_subscription(
    snapshot: &SubscriptionSnapshot,
    payments: &[PaymentRecord],
    now_ms: i64,
    config: &TamperConfig,
) -> Vec<TamperFinding> {
    let mut findings = Vec::new();

    if let Some(modified) = snapshot.last_modified_ms {
        if modified > now_ms.saturating_add(duration_ms(config.modified_tolerance)) {
            findings.push(TamperFinding::ModifiedInFuture {
                last_modified_ms: modified,
            });
        }
    }

    let (true, Some(expiry_ms)) = (snapshot.is_active, snapshot.expiry_ms) else {
        return findings;
    };

    let limit_ms = now_ms.saturating_add(i64::from(config.max_future_years) * YEAR_MS);
    if expiry_ms > limit_ms {
        findings.push(TamperFinding::ExpiryTooFarInFuture {
            expiry_ms,
            limit_ms,
        });
    }
    if expiry_ms < now_ms {
        findings.push(TamperFinding::ExpiredButActive { expiry_ms });
    }

    if snapshot.plan.is_paid() {
        let completed: Vec<&PaymentRecord> = payments
            .iter()
            .filter(|p| p.plan == snapshot.plan && p.status == PaymentStatus::Completed)
            .collect();

        if completed.is_empty() {
            findings.push(TamperFinding::MissingPaymentLink {
                plan: snapshot.plan,
                expiry_ms,
            });
        } else if let (Some(term), Some(latest)) = (
            snapshot.plan.term(),
            completed.iter().filter_map(|p| p.completed_ms).max(),
        ) {
            let terms = i64::try_from(completed.len()).unwrap_or(i64::MAX);
            let allowed_ms = latest
                .saturating_add(duration_ms(term).saturating_mul(terms))
                .saturating_add(duration_ms(config.term_grace));
            if expiry_ms > allowed_ms {
                findings.push(TamperFinding::ExpiryExceedsPurchasedTerm {
                    expiry_ms,
                    allowed_ms,
                });
            }
        }
    }

    findings
}

/// Evaluate a trial record.
pub fn check_trial(trial: &TrialRecord) -> Option<TamperFinding> {
    if !trial.used {
        return None;
    }
    let distinct: BTreeSet<&String> = trial.device_fingerprints.iter().collect();
    (distinct.len() > 1).then(|| TamperFinding::TrialAbuse {
        fingerprints: distinct.into_iter().cloned().collect(),
    })
}

/// Remembers which evidence has already been reported, per kind.
#[derive(Debug, Clone)]
pub struct EvidenceLog {
    repo: SecurityRepository,
}

impl EvidenceLog {
    /// Create a log over the repository.
    pub fn new(repo: SecurityRepository) -> Self {
        Self { repo }
    }

    /// Record `evidence` for `kind`. Returns true if it differs from what
    /// was last reported.
    ///
    /// An unreadable record counts as unseen.
    pub fn first_sighting(&self, kind: &str, evidence: &str) -> bool {
        let key = keys::tamper_seen(kind);
        let digest = sha256_hex(format!("{kind}:{evidence}").as_bytes());
        let previous = self.repo.get_raw(&key).unwrap_or_else(|e| {
            debug!(kind, error = %e, "Evidence record unreadable");
            None
        });
        if previous.as_deref() == Some(digest.as_str()) {
            return false;
        }
        if let Err(e) = self.repo.set_raw(&key, &digest) {
            warn!(kind, error = %e, "Failed to persist evidence record");
        }
        true
    }

    /// Forget `kind` so the next sighting reports again.
    pub fn clear(&self, kind: &str) {
        let key = keys::tamper_seen(kind);
        match self.repo.get_raw(&key) {
            Ok(Some(_)) => {
                if let Err(e) = self.repo.delete(&key) {
                    debug!(kind, error = %e, "Failed to clear evidence record");
                }
            },
            Ok(None) => {},
            Err(e) => debug!(kind, error = %e, "Evidence record unreadable"),
        }
    }
}

/// Verdict on whether the host should let another payment attempt through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentGate {
    /// Proceed.
    Allowed,
    /// Ask the user to wait this long. Advisory, not a hard block.
    CoolDown(Duration),
}

/// Runs the heuristics and deduplicates their findings.
pub struct TamperHeuristics {
    repo: SecurityRepository,
    clock: Arc<dyn Clock>,
    config: TamperConfig,
    evidence: EvidenceLog,
}

impl TamperHeuristics {
    /// Create the heuristics.
    pub fn new(repo: SecurityRepository, clock: Arc<dyn Clock>, config: TamperConfig) -> Self {
        let evidence = EvidenceLog::new(repo.clone());
        Self {
            repo,
            clock,
            config,
            evidence,
        }
    }

    /// Evaluate subscription and trial records. Returns new findings only.
    ///
    /// A record source that fails is skipped for this cycle.
    #[instrument(skip(self, records))]
    pub fn evaluate(&self, records: &dyn SubscriptionRecords) -> Vec<TamperFinding> {
        let now = self.clock.now_ms();
        let mut fresh = Vec::new();

        match (records.subscription(), records.payments()) {
            (Ok(Some(snapshot)), Ok(payments)) => {
                let findings = check_subscription(&snapshot, &payments, now, &self.config);
                for kind in SUBSCRIPTION_KINDS {
                    if !findings.iter().any(|f| f.kind() == kind) {
                        self.evidence.clear(kind);
                    }
                }
                fresh.extend(findings.into_iter().filter(|f| self.is_new(f)));
            },
            (Ok(None), _) => {},
            (Err(e), _) | (_, Err(e)) => {
                debug!(error = %e, "Subscription records unavailable");
            },
        }

        match records.trial() {
            Ok(Some(trial)) => {
                if let Some(finding) = check_trial(&trial) {
                    if self.is_new(&finding) {
                        fresh.push(finding);
                    }
                }
            },
            Ok(None) => {},
            Err(e) => debug!(error = %e, "Trial record unavailable"),
        }

        for finding in &fresh {
            warn!(kind = finding.kind(), "Tamper heuristic flagged");
        }
        fresh
    }

    fn is_new(&self, finding: &TamperFinding) -> bool {
        self.evidence
            .first_sighting(finding.kind(), &finding.evidence())
    }

    /// Record a payment attempt and decide whether the host should pause.
    ///
    /// The finding is returned only the first time a burst exceeds the
    /// limit.
    pub fn record_payment_attempt(
        &self,
    ) -> Result<(PaymentGate, Option<TamperFinding>), MonitorError> {
        let now = self.clock.now_ms();
        self.repo
            .save_json(&keys::payment_attempt(now, &random_id()), &now)?;

        let attempts = self.attempts_in_window(now)?;
        let gate = self.gate_for(&attempts, now);
        if gate == PaymentGate::Allowed {
            return Ok((gate, None));
        }

        let finding = TamperFinding::PaymentAbuse {
            attempts: attempts.len(),
            first_attempt_ms: attempts.first().copied().unwrap_or(now),
        };
        let finding = self.is_new(&finding).then_some(finding);
        Ok((gate, finding))
    }

    /// Current gate without recording an attempt.
    pub fn payment_gate(&self) -> Result<PaymentGate, MonitorError> {
        let now = self.clock.now_ms();
        let attempts = self.attempts_in_window(now)?;
        Ok(self.gate_for(&attempts, now))
    }

    fn gate_for(&self, attempts: &[i64], now: i64) -> PaymentGate {
        let max = self.config.max_payment_attempts;
        if attempts.len() <= max {
            return PaymentGate::Allowed;
        }
        // Wait until the window holds no more than the limit.
        let pivot = attempts[attempts.len() - 1 - max];
        let window = duration_ms(self.config.payment_window);
        let remaining = (window - now.saturating_sub(pivot)).max(0);
        PaymentGate::CoolDown(Duration::from_millis(remaining.unsigned_abs()))
    }

    /// Attempt timestamps inside the window, ascending. Older records are
    /// deleted.
    fn attempts_in_window(&self, now: i64) -> Result<Vec<i64>, MonitorError> {
        let window = duration_ms(self.config.payment_window);
        let mut attempts = Vec::new();
        for key in self.repo.keys(keys::PAYMENT_ATTEMPT_PREFIX)? {
            let Some(ts) = self.repo.load_json::<i64>(&key)? else {
                continue;
            };
            if now.saturating_sub(ts) < window {
                attempts.push(ts);
            } else if let Err(e) = self.repo.delete(&key) {
                debug!(key = %key, error = %e, "Failed to prune payment attempt");
            }
        }
        attempts.sort_unstable();
        Ok(attempts)
    }
}
