//! Core measurement types
//!
//! Ears, threshold outcomes and the session report shared between the test
//! engine, the result sinks and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ear under test
///
/// Each ear maps to one output channel; the other channel stays silent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Ear {
    Left,
    Right,
}

impl Ear {
    /// Output channel index (0 = left, 1 = right)
    pub fn channel(self) -> usize {
        match self {
            Ear::Left => 0,
            Ear::Right => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Ear::Left => "left",
            Ear::Right => "right",
        }
    }
}

impl std::fmt::Display for Ear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Ear {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Ear::Left),
            "right" => Ok(Ear::Right),
            other => Err(format!("earside must be 'left' or 'right', got '{}'", other)),
        }
    }
}

/// Why a combination ended without a confirmed threshold
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoResponseReason {
    /// Unanswered presentation at the safety ceiling
    SafetyLimitReached,
    /// Presentation counter hit `max_presentations`
    PresentationLimitReached,
}

impl std::fmt::Display for NoResponseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoResponseReason::SafetyLimitReached => write!(f, "safety limit reached"),
            NoResponseReason::PresentationLimitReached => write!(f, "presentation limit reached"),
        }
    }
}

/// Result of one threshold search
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ThresholdOutcome {
    /// Confirmed threshold in dBHL
    Threshold { level_db: i32 },
    /// No threshold could be established
    NoResponse { reason: NoResponseReason },
}

impl ThresholdOutcome {
    pub fn level(&self) -> Option<i32> {
        match self {
            ThresholdOutcome::Threshold { level_db } => Some(*level_db),
            ThresholdOutcome::NoResponse { .. } => None,
        }
    }
}

/// One (ear, frequency) measurement, immutable once written
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThresholdRecord {
    pub ear: Ear,
    pub frequency_hz: u32,
    #[serde(flatten)]
    pub outcome: ThresholdOutcome,
}

impl ThresholdRecord {
    pub fn threshold(ear: Ear, frequency_hz: u32, level_db: i32) -> Self {
        Self {
            ear,
            frequency_hz,
            outcome: ThresholdOutcome::Threshold { level_db },
        }
    }

    pub fn no_response(ear: Ear, frequency_hz: u32, reason: NoResponseReason) -> Self {
        Self {
            ear,
            frequency_hz,
            outcome: ThresholdOutcome::NoResponse { reason },
        }
    }

    /// Confirmed level, `None` for NO_RESPONSE
    pub fn level(&self) -> Option<i32> {
        self.outcome.level()
    }

    /// True if this record measures the given combination
    pub fn covers(&self, ear: Ear, frequency_hz: u32) -> bool {
        self.ear == ear && self.frequency_hz == frequency_hz
    }
}

/// Overall session status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    /// Terminal statuses freeze the session
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "RUNNING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(SessionStatus::Running),
            "COMPLETED" => Ok(SessionStatus::Completed),
            "CANCELLED" => Ok(SessionStatus::Cancelled),
            "FAILED" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status '{}'", other)),
        }
    }
}

/// Snapshot of a test session
///
/// Published while the session runs and handed to result sinks once it
/// reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub subject: Option<String>,
    pub status: SessionStatus,
    /// Completed fraction in [0, 1]
    pub progress: f64,
    pub records: Vec<ThresholdRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Device error message for FAILED sessions
    pub error: Option<String>,
}

impl SessionReport {
    /// Fresh RUNNING report with no records
    pub fn new(session_id: Uuid, subject: Option<String>) -> Self {
        Self {
            session_id,
            subject,
            status: SessionStatus::Running,
            progress: 0.0,
            records: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    /// Record for a combination, if measured
    pub fn record_for(&self, ear: Ear, frequency_hz: u32) -> Option<&ThresholdRecord> {
        self.records.iter().find(|r| r.covers(ear, frequency_hz))
    }

    /// Confirmed thresholds for one ear as (frequency, level) pairs
    pub fn thresholds_for(&self, ear: Ear) -> Vec<(u32, i32)> {
        self.records
            .iter()
            .filter(|r| r.ear == ear)
            .filter_map(|r| r.level().map(|level| (r.frequency_hz, level)))
            .collect()
    }
}
