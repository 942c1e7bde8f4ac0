//! Mission result records for outbound calls.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Lifecycle status of a mission call, as seen by polling agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    InProgress,
    Completed,
    Failed,
    EndedWithoutResult,
    TimedOut,
}

impl MissionStatus {
    /// Terminal statuses are write-once: a record never leaves one.
    pub fn is_terminal(self) -> bool {
        !matches!(self, MissionStatus::InProgress)
    }
}

/// What an outbound call was asked to do. The constructed system prompt
/// stays server-side — the carrier only ever routes audio.
#[derive(Debug, Clone)]
pub struct MissionDescriptor {
    pub to: String,
    pub mission: String,
    pub role: String,
    /// Full system prompt built from the outbound template.
    pub prompt: String,
}

/// Outcome record keyed by call sid, polled via GET /call/{sid}/result.
#[derive(Debug, Clone, Serialize)]
pub struct MissionRecord {
    pub call_sid: String,
    pub status: MissionStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_steps: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MissionRecord {
    pub fn in_progress(call_sid: &str) -> Self {
        let now = Utc::now();
        Self {
            call_sid: call_sid.to_string(),
            status: MissionStatus::InProgress,
            success: false,
            outcome: None,
            data: Value::Null,
            next_steps: None,
            started_at: now,
            updated_at: now,
        }
    }
}
