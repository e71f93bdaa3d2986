//! Attendance events and the sink they are appended to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Row identifier assigned by the sink.
pub type LogId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    CheckIn,
    CheckOut,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CheckIn => "CHECK_IN",
            EventKind::CheckOut => "CHECK_OUT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "CHECK_IN" | "IN" => Ok(EventKind::CheckIn),
            "CHECK_OUT" | "OUT" => Ok(EventKind::CheckOut),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("camera id is empty")]
    EmptyCamera,
    #[error("identity id is empty")]
    EmptyIdentity,
    #[error("confidence is not finite: {0}")]
    NonFiniteConfidence(f32),
}

/// One committed attendance record. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    identity_id: String,
    display_name: Option<String>,
    kind: EventKind,
    camera_id: String,
    timestamp: DateTime<Utc>,
    confidence: f32,
}

impl AttendanceEvent {
    pub fn new(
        identity_id: impl Into<String>,
        display_name: Option<String>,
        kind: EventKind,
        camera_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        confidence: f32,
    ) -> Result<Self, EventError> {
        let identity_id = identity_id.into();
        let camera_id = camera_id.into();
        if identity_id.trim().is_empty() {
            return Err(EventError::EmptyIdentity);
        }
        if camera_id.trim().is_empty() {
            return Err(EventError::EmptyCamera);
        }
        if !confidence.is_finite() {
            return Err(EventError::NonFiniteConfidence(confidence));
        }
        Ok(Self {
            identity_id,
            display_name,
            kind,
            camera_id,
            timestamp,
            confidence,
        })
    }

    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("attendance log unavailable: {0}")]
    Unavailable(String),
    #[error("attendance log rejected event: {0}")]
    Rejected(String),
}

/// Append-only destination for committed events.
pub trait AttendanceSink {
    fn append(&self, event: &AttendanceEvent) -> Result<LogId, SinkError>;
}

/// How a session chooses the kind of each committed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitPolicy {
    /// Every commit uses the operator-selected kind.
    Fixed(EventKind),
    /// The Nth commit is CHECK_IN for odd N and CHECK_OUT for even N.
    Alternating,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        CommitPolicy::Fixed(EventKind::CheckIn)
    }
}

impl CommitPolicy {
    /// Kind for the commit with 1-based ordinal `n`.
    pub fn kind_for(self, n: u64) -> EventKind {
        match self {
            CommitPolicy::Fixed(kind) => kind,
            CommitPolicy::Alternating if n % 2 == 1 => EventKind::CheckIn,
            CommitPolicy::Alternating => EventKind::CheckOut,
        }
    }
}

impl fmt::Display for CommitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitPolicy::Fixed(EventKind::CheckIn) => f.write_str("check-in"),
            CommitPolicy::Fixed(EventKind::CheckOut) => f.write_str("check-out"),
            CommitPolicy::Alternating => f.write_str("alternate"),
        }
    }
}

impl FromStr for CommitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alternate" | "alternating" | "toggle" => Ok(CommitPolicy::Alternating),
            other => other
                .parse::<EventKind>()
                .map(CommitPolicy::Fixed)
                .map_err(|_| format!("unknown policy: {other} (expected check-in, check-out or alternate)")),
        }
    }
}
