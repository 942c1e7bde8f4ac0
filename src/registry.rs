//! Registry of active call sessions and mission results.
//!
//! The registry is the single source of truth for "is this call active" and
//! the single writer of session lifecycle transitions. One mutex guards the
//! active set, the mission results, and the pending mission prompts, so
//! create / terminate / poll are serialized: once `terminate` returns, every
//! later poll observes the terminal status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::mission::{MissionDescriptor, MissionRecord, MissionStatus};
use crate::session::CallDirection;

/// How a session ended, as reported by the session itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The AI reported a mission result before hanging up.
    Completed,
    /// A leg failed: setup error, mid-call disconnect, or missing mission.
    Failed { reason: String },
    /// Clean end with no mission result (hang-up, carrier stop, or an
    /// inbound caller who never authenticated).
    EndedWithoutResult,
}

/// Handle to one active session. The cancellation token tears down the
/// session's pumps and abandons its in-flight relay calls.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub direction: CallDirection,
    pub cancel: CancellationToken,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("call {0} already has an active session")]
    DuplicateCallId(String),
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, SessionHandle>,
    results: HashMap<String, MissionRecord>,
    missions: HashMap<String, MissionDescriptor>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
    retention: Option<chrono::Duration>,
}

impl SessionRegistry {
    pub fn new(retention_hours: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            retention: Some(chrono::Duration::hours(retention_hours as i64)),
        }
    }

    /// Register a new session. Exactly one session per call sid; a duplicate
    /// fails without touching the existing session.
    pub async fn create(
        &self,
        call_sid: &str,
        direction: CallDirection,
    ) -> Result<SessionHandle, RegistryError> {
        let mut inner = self.inner.lock().await;
        if inner.active.contains_key(call_sid) {
            return Err(RegistryError::DuplicateCallId(call_sid.to_string()));
        }
        // Inbound calls get result records too; without this an inbound-only
        // deployment would accumulate them forever.
        self.purge_stale(&mut inner);
        let handle = SessionHandle {
            direction,
            cancel: CancellationToken::new(),
        };
        inner.active.insert(call_sid.to_string(), handle.clone());
        inner
            .results
            .entry(call_sid.to_string())
            .or_insert_with(|| MissionRecord::in_progress(call_sid));
        tracing::info!(call_sid, ?direction, "Session registered");
        Ok(handle)
    }

    pub async fn get(&self, call_sid: &str) -> Option<SessionHandle> {
        self.inner.lock().await.active.get(call_sid).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    /// Remove a session and finalize its result. Idempotent: terminating an
    /// already-closed session is a no-op, and a result that reached a
    /// terminal status (e.g. via `complete_mission`) is never overwritten.
    pub async fn terminate(&self, call_sid: &str, outcome: CallOutcome) {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.active.remove(call_sid) {
            handle.cancel.cancel();
            tracing::info!(call_sid, ?outcome, "Session deregistered");
        }
        inner.missions.remove(call_sid);

        let status = match &outcome {
            CallOutcome::Completed => MissionStatus::Completed,
            CallOutcome::Failed { .. } => MissionStatus::Failed,
            CallOutcome::EndedWithoutResult => MissionStatus::EndedWithoutResult,
        };
        if let Some(record) = inner.results.get_mut(call_sid) {
            if !record.status.is_terminal() {
                record.status = status;
                if let CallOutcome::Failed { reason } = &outcome {
                    record.outcome = Some(reason.clone());
                }
                record.updated_at = Utc::now();
            }
        }
    }

    /// Look up the mission result for a call. `None` means the call sid is
    /// unknown (pollers treat that as "keep polling").
    pub async fn poll_mission_result(&self, call_sid: &str) -> Option<MissionRecord> {
        self.inner.lock().await.results.get(call_sid).cloned()
    }

    /// Store the mission for an outbound call at dial time. The prompt never
    /// leaves the server; the media stream picks it up on the start event.
    pub async fn register_mission(&self, call_sid: &str, descriptor: MissionDescriptor) {
        let mut inner = self.inner.lock().await;
        self.purge_stale(&mut inner);
        inner
            .results
            .insert(call_sid.to_string(), MissionRecord::in_progress(call_sid));
        inner.missions.insert(call_sid.to_string(), descriptor);
        tracing::info!(call_sid, "Mission registered");
    }

    /// Consume the stored mission for an outbound call.
    pub async fn take_mission(&self, call_sid: &str) -> Option<MissionDescriptor> {
        self.inner.lock().await.missions.remove(call_sid)
    }

    /// Record the AI's reported mission result. Write-once: a second report
    /// or a later terminate cannot change it.
    pub async fn complete_mission(
        &self,
        call_sid: &str,
        success: bool,
        outcome: &str,
        data: Value,
        next_steps: Option<String>,
    ) {
        let mut inner = self.inner.lock().await;
        let record = inner
            .results
            .entry(call_sid.to_string())
            .or_insert_with(|| MissionRecord::in_progress(call_sid));
        if record.status.is_terminal() {
            tracing::warn!(call_sid, "Ignoring mission result for finalized call");
            return;
        }
        record.status = MissionStatus::Completed;
        record.success = success;
        record.outcome = Some(outcome.to_string());
        record.data = data;
        record.next_steps = next_steps;
        record.updated_at = Utc::now();
        tracing::info!(call_sid, success, "Mission result recorded");
    }

    /// Apply a carrier status callback. Dial failures finalize the record;
    /// a completed call that never reported finalizes as
    /// `ended_without_result`.
    pub async fn carrier_status(&self, call_sid: &str, status: &str) {
        let terminal = match status {
            "busy" | "no-answer" | "failed" | "canceled" => {
                Some((MissionStatus::Failed, Some(status.to_string())))
            }
            "completed" => Some((MissionStatus::EndedWithoutResult, None)),
            _ => None,
        };
        let Some((status, reason)) = terminal else {
            return;
        };

        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.results.get_mut(call_sid) {
            if !record.status.is_terminal() {
                record.status = status;
                record.outcome = reason;
                record.updated_at = Utc::now();
            }
        }
    }

    /// Poll until the mission reaches a terminal status or `timeout`
    /// elapses. Holds no lock while sleeping. On timeout the record is
    /// finalized as `timed_out` (write-once) and the underlying call is left
    /// running.
    pub async fn wait_for_result(
        &self,
        call_sid: &str,
        interval: Duration,
        timeout: Duration,
    ) -> MissionRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(record) = self.poll_mission_result(call_sid).await {
                if record.status.is_terminal() {
                    return record;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(interval).await;
        }

        let mut inner = self.inner.lock().await;
        let record = inner
            .results
            .entry(call_sid.to_string())
            .or_insert_with(|| MissionRecord::in_progress(call_sid));
        if !record.status.is_terminal() {
            record.status = MissionStatus::TimedOut;
            record.updated_at = Utc::now();
        }
        record.clone()
    }

    /// Drop terminal records past the retention window. Called with the lock
    /// held whenever a new call enters the registry.
    fn purge_stale(&self, inner: &mut Inner) {
        let Some(retention) = self.retention else {
            return;
        };
        let cutoff = Utc::now() - retention;
        inner
            .results
            .retain(|_, r| !r.status.is_terminal() || r.updated_at > cutoff);
    }
}
