//! Exam-session anomaly detection.
//!
//! Watches an active exam for behaviour that suggests the timer or the
//! questions are being manipulated: heartbeats that stop arriving, a wall
//! clock that runs backwards, the exam losing focus, or answers submitted
//! faster than anyone could read the question.
//!
//! Each kind of anomaly is reported at most once per exam, so a student who
//! switches tabs a few times does not accumulate enough violations to lock
//! the account.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ExamConfig;

/// Backward wall-clock steps smaller than this are ignored.
const REGRESSION_TOLERANCE_MS: i64 = 1_000;

/// One anomaly observed during an exam.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExamFinding {
    /// Heartbeats stopped for longer than allowed.
    HeartbeatGap {
        /// Exam identifier.
        exam_id: String,
        /// Gap on the monotonic clock.
        gap_ms: u64,
    },
    /// The wall clock moved backwards between heartbeats.
    ClockRegression {
        /// Exam identifier.
        exam_id: String,
        /// How far it moved back.
        regression_ms: i64,
    },
    /// The exam lost focus.
    FocusLost {
        /// Exam identifier.
        exam_id: String,
    },
    /// Several answers submitted implausibly fast.
    RapidAnswers {
        /// Exam identifier.
        exam_id: String,
        /// Rapid answers counted.
        count: usize,
        /// Last rapid question.
        question_id: String,
    },
}

impl ExamFinding {
    /// Stable kind identifier.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HeartbeatGap { .. } => "heartbeat_gap",
            Self::ClockRegression { .. } => "clock_regression",
            Self::FocusLost { .. } => "focus_lost",
            Self::RapidAnswers { .. } => "rapid_answers",
        }
    }

    /// Event payload.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug)]
struct ActiveExam {
    exam_id: String,
    last_monotonic_ms: u64,
    last_wall_ms: i64,
    rapid_answers: usize,
    reported: HashSet<&'static str>,
}

/// Tracks the active exam, if any.
pub struct ExamMonitor {
    clock: Arc<dyn Clock>,
    config: ExamConfig,
    active: Option<ActiveExam>,
}

impl ExamMonitor {
    /// Create a monitor with no active exam.
    pub fn new(clock: Arc<dyn Clock>, config: ExamConfig) -> Self {
        Self {
            clock,
            config,
            active: None,
        }
    }

    /// Begin tracking an exam. Replaces any exam already active.
    pub fn start_exam(&mut self, exam_id: &str) {
        info!(exam_id, "Exam started");
        self.active = Some(ActiveExam {
            exam_id: exam_id.to_string(),
            last_monotonic_ms: self.clock.monotonic_ms(),
            last_wall_ms: self.clock.now_ms(),
            rapid_answers: 0,
            reported: HashSet::new(),
        });
    }

    /// Stop tracking. Returns the exam that ended.
    pub fn end_exam(&mut self) -> Option<String> {
        let ended = self.active.take().map(|e| e.exam_id);
        if let Some(exam_id) = &ended {
            info!(exam_id = %exam_id, "Exam ended");
        }
        ended
    }

    /// Whether an exam is in progress.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Identifier of the active exam.
    pub fn active_exam(&self) -> Option<&str> {
        self.active.as_ref().map(|e| e.exam_id.as_str())
    }

    /// Process an exam heartbeat.
    pub fn on_heartbeat(&mut self) -> Vec<ExamFinding> {
        let mono = self.clock.monotonic_ms();
        let wall = self.clock.now_ms();
        let max_gap = u64::try_from(self.config.max_heartbeat_gap.as_millis()).unwrap_or(u64::MAX);

        let Some(exam) = self.active.as_mut() else {
            return Vec::new();
        };

        let mut findings = Vec::new();
        let gap_ms = mono.saturating_sub(exam.last_monotonic_ms);
        if gap_ms > max_gap {
            findings.push(ExamFinding::HeartbeatGap {
                exam_id: exam.exam_id.clone(),
                gap_ms,
            });
        }
        let regression_ms = exam.last_wall_ms - wall;
        if regression_ms > REGRESSION_TOLERANCE_MS {
            findings.push(ExamFinding::ClockRegression {
                exam_id: exam.exam_id.clone(),
                regression_ms,
            });
        }

        exam.last_monotonic_ms = mono;
        exam.last_wall_ms = wall;
        findings.retain(|f| exam.reported.insert(f.kind()));
        for finding in &findings {
            warn!(kind = finding.kind(), "Exam anomaly");
        }
        findings
    }

    /// Process a visibility change. Losing focus during an exam is an
    /// anomaly.
    pub fn on_visibility_change(&mut self, visible: bool) -> Option<ExamFinding> {
        let exam = self.active.as_mut()?;
        if visible {
            return None;
        }
        let finding = ExamFinding::FocusLost {
            exam_id: exam.exam_id.clone(),
        };
        exam.reported.insert(finding.kind()).then(|| {
            warn!(exam_id = %exam.exam_id, "Exam lost focus");
            finding
        })
    }

    /// Process a submitted answer and how long the question was shown.
    pub fn record_answer(&mut self, question_id: &str, elapsed: Duration) -> Option<ExamFinding> {
        let min_answer_time = self.config.min_answer_time;
        let threshold = self.config.rapid_answer_threshold;
        let exam = self.active.as_mut()?;

        if elapsed >= min_answer_time {
            return None;
        }
        exam.rapid_answers += 1;
        debug!(question_id, rapid = exam.rapid_answers, "Rapid answer");
        if exam.rapid_answers < threshold {
            return None;
        }

        let finding = ExamFinding::RapidAnswers {
            exam_id: exam.exam_id.clone(),
            count: exam.rapid_answers,
            question_id: question_id.to_string(),
        };
        exam.rapid_answers = 0;
        exam.reported.insert(finding.kind()).then_some(finding)
    }
}
