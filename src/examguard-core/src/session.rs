//! Store-backed registry of live sessions.
//!
//! Every monitor writes a heartbeat for its own session on each cycle.
//! Other contexts sharing the store do the same, so reading the registry
//! shows every session that was alive within the TTL.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{duration_ms, Clock};
use crate::error::MonitorError;
use crate::repository::{keys, SecurityRepository};
use crate::tamper::EvidenceLog;

const EVIDENCE_KIND: &str = "multi_device_session";

/// One session's last heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeartbeat {
    /// Session identifier.
    pub session_id: String,
    /// Account the session is signed in to.
    pub account_id: String,
    /// Fingerprint of the device running the session.
    pub device_fingerprint: String,
    /// Local time of the heartbeat.
    pub last_seen_ms: i64,
}

/// Several devices active under one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionFinding {
    /// Account.
    pub account_id: String,
    /// Distinct fingerprints seen.
    pub fingerprints: Vec<String>,
    /// Active sessions counted.
    pub sessions: usize,
}

/// Session heartbeat registry.
pub struct SessionRegistry {
    repo: SecurityRepository,
    clock: Arc<dyn Clock>,
    session_id: String,
    account_id: Option<String>,
    ttl: Duration,
    threshold: usize,
    evidence: EvidenceLog,
}

impl SessionRegistry {
    /// Create a registry entry for one session.
    pub fn new(
        repo: SecurityRepository,
        clock: Arc<dyn Clock>,
        session_id: String,
        account_id: Option<String>,
        ttl: Duration,
        threshold: usize,
    ) -> Self {
        let evidence = EvidenceLog::new(repo.clone());
        Self {
            repo,
            clock,
            session_id,
            account_id,
            ttl,
            threshold,
            evidence,
        }
    }

    /// This session's identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Write this session's heartbeat. No-op without an account.
    pub fn heartbeat(&self, fingerprint: &str) -> Result<(), MonitorError> {
        let Some(account_id) = &self.account_id else {
            return Ok(());
        };
        let record = SessionHeartbeat {
            session_id: self.session_id.clone(),
            account_id: account_id.clone(),
            device_fingerprint: fingerprint.to_string(),
            last_seen_ms: self.clock.now_ms(),
        };
        self.repo
            .save_json(&keys::session(&self.session_id), &record)
    }

    /// Sessions of this account seen within the TTL. Expired records of
    /// other sessions are removed.
    pub fn active_sessions(&self) -> Result<Vec<SessionHeartbeat>, MonitorError> {
        let Some(account_id) = &self.account_id else {
            return Ok(Vec::new());
        };
        let now = self.clock.now_ms();
        let ttl = duration_ms(self.ttl);

        let mut active = Vec::new();
        for key in self.repo.keys(keys::SESSION_PREFIX)? {
            let Some(record) = self.repo.load_json::<SessionHeartbeat>(&key)? else {
                continue;
            };
            let age = now.saturating_sub(record.last_seen_ms);
            if age.abs() <= ttl {
                if &record.account_id == account_id {
                    active.push(record);
                }
            } else if record.session_id != self.session_id {
                if let Err(e) = self.repo.delete(&key) {
                    debug!(key = %key, error = %e, "Failed to prune stale session");
                }
            }
        }
        Ok(active)
    }

    /// Report a multi-device finding the first time a given set of
    /// fingerprints is seen.
    pub fn check(&self) -> Result<Option<SessionFinding>, MonitorError> {
        let Some(account_id) = &self.account_id else {
            return Ok(None);
        };
        let active = self.active_sessions()?;
        let fingerprints: BTreeSet<&str> =
            active.iter().map(|s| s.device_fingerprint.as_str()).collect();

        if fingerprints.len() < self.threshold {
            self.evidence.clear(EVIDENCE_KIND);
            return Ok(None);
        }

        let fingerprints: Vec<String> = fingerprints.into_iter().map(str::to_string).collect();
        if !self
            .evidence
            .first_sighting(EVIDENCE_KIND, &fingerprints.join(","))
        {
            return Ok(None);
        }

        warn!(
            account_id = %account_id,
            devices = fingerprints.len(),
            "Concurrent sessions from multiple devices"
        );
        Ok(Some(SessionFinding {
            account_id: account_id.clone(),
            fingerprints,
            sessions: active.len(),
        }))
    }

    /// Remove this session's heartbeat.
    pub fn end(&self) -> Result<(), MonitorError> {
        self.repo.delete(&keys::session(&self.session_id))
    }
}
