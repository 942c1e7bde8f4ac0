//! Per-call session engine.
//!
//! A session owns one call's lifecycle: it pumps audio between the telephony
//! leg and the AI leg, feeds recognized speech through the passphrase gate,
//! intercepts tool invocations, and accumulates the transcript. One
//! `tokio::select!` loop is the single reader of both legs and the single
//! writer of the turn sequence, so transcript order and auth snapshots need
//! no further locking.

pub mod event;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::auth::{self, AuthState, Passphrase};
use crate::registry::{CallOutcome, SessionHandle, SessionRegistry};
use crate::relay::{RelayClient, ToolResult};
use crate::transcript::{CallRecord, TranscriptStore, Turn};
use event::{AiCommand, AiEvent, AiLeg, TelephonyCommand, TelephonyEvent, TelephonyLeg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Inbound,
    Outbound,
}

impl std::fmt::Display for CallDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallDirection::Inbound => f.write_str("inbound"),
            CallDirection::Outbound => f.write_str("outbound"),
        }
    }
}

/// Lifecycle of a session. Outbound calls skip the unauthenticated state:
/// the system placed the call, not an unverified caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    ActiveUnauthenticated,
    ActiveAuthenticated,
    Terminating,
    Closed,
}

/// Everything a session needs besides its legs.
pub struct SessionParams {
    pub call_sid: String,
    pub direction: CallDirection,
    pub handle: SessionHandle,
    pub registry: SessionRegistry,
    pub relay: Arc<RelayClient>,
    pub transcripts: TranscriptStore,
    pub passphrase: Passphrase,
    /// Instructions applied to the AI leg once the caller authenticates.
    pub authenticated_prompt: String,
    pub max_unauthenticated: Duration,
}

/// Result of a tool task, funneled back into the session loop so transcript
/// turns stay in occurrence order.
struct ToolCompletion {
    call_id: String,
    name: String,
    arguments: Value,
    result: ToolResult,
}

pub struct Session {
    call_sid: String,
    direction: CallDirection,
    state: SessionState,
    auth: AuthState,
    passphrase: Passphrase,
    authenticated_prompt: String,
    max_unauthenticated: Duration,
    handle: SessionHandle,
    registry: SessionRegistry,
    relay: Arc<RelayClient>,
    transcripts: TranscriptStore,
    turns: Vec<Turn>,
    started_at: chrono::DateTime<Utc>,
    /// Response currently being spoken, for barge-in cancellation.
    active_response: Option<String>,
    /// Set once the AI reports a mission result.
    mission_completed: bool,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        let auth = match params.direction {
            // The system placed the call; the callee is not being gated.
            CallDirection::Outbound => AuthState::Authenticated,
            CallDirection::Inbound => AuthState::Unauthenticated,
        };
        Self {
            call_sid: params.call_sid,
            direction: params.direction,
            state: SessionState::Connecting,
            auth,
            passphrase: params.passphrase,
            authenticated_prompt: params.authenticated_prompt,
            max_unauthenticated: params.max_unauthenticated,
            handle: params.handle,
            registry: params.registry,
            relay: params.relay,
            transcripts: params.transcripts,
            turns: Vec::new(),
            started_at: Utc::now(),
            active_response: None,
            mission_completed: false,
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            tracing::info!(call_sid = %self.call_sid, from = ?self.state, to = ?next, "Session state");
            self.state = next;
        }
    }

    /// Drive the call to completion. Consumes both legs; returns the final
    /// outcome after the transcript is flushed and the registry updated.
    pub async fn run(mut self, mut telephony: TelephonyLeg, mut ai: AiLeg) -> CallOutcome {
        match self.direction {
            CallDirection::Inbound => {
                self.set_state(SessionState::ActiveUnauthenticated);
                // Make the assistant speak first; the challenge instructions
                // are already active from the initial session settings.
                let _ = ai
                    .commands
                    .send(AiCommand::InjectUserText {
                        text: "[CALL CONNECTED - Speak your greeting now]".to_string(),
                    })
                    .await;
                let _ = ai.commands.send(AiCommand::CreateResponse).await;
            }
            CallDirection::Outbound => self.set_state(SessionState::ActiveAuthenticated),
        }

        let (tool_tx, mut tool_rx) = mpsc::channel::<ToolCompletion>(8);

        let unauth_deadline = tokio::time::sleep(self.max_unauthenticated);
        tokio::pin!(unauth_deadline);

        let outcome = loop {
            tokio::select! {
                _ = self.handle.cancel.cancelled() => {
                    tracing::info!(call_sid = %self.call_sid, "Session cancelled");
                    break self.end_outcome();
                }

                // The caller does not get unlimited chances at the gate.
                () = &mut unauth_deadline, if self.direction == CallDirection::Inbound
                    && self.auth == AuthState::Unauthenticated =>
                {
                    tracing::info!(call_sid = %self.call_sid, "Unauthenticated deadline, hanging up");
                    let _ = telephony.commands.send(TelephonyCommand::Hangup).await;
                    break CallOutcome::EndedWithoutResult;
                }

                tel_event = telephony.events.recv() => {
                    match tel_event {
                        Some(TelephonyEvent::Audio { payload }) => {
                            if ai.commands.send(AiCommand::AppendAudio { payload }).await.is_err() {
                                break self.leg_failure("assistant leg gone");
                            }
                        }
                        Some(TelephonyEvent::Mark) => {}
                        Some(TelephonyEvent::Stop) | None => {
                            tracing::info!(call_sid = %self.call_sid, "Telephony leg ended");
                            break self.end_outcome();
                        }
                    }
                }

                ai_event = ai.events.recv() => {
                    match ai_event {
                        Some(event) => {
                            if let Some(outcome) = self
                                .handle_ai_event(event, &telephony.commands, &ai.commands, &tool_tx)
                                .await
                            {
                                break outcome;
                            }
                        }
                        None => break self.leg_failure("assistant leg disconnected"),
                    }
                }

                Some(done) = tool_rx.recv() => {
                    self.finish_tool(done, &ai.commands).await;
                }
            }
        };

        self.set_state(SessionState::Terminating);
        drop(tool_rx); // pending relay tasks are abandoned
        let _ = ai.commands.send(AiCommand::Close).await;

        let record = CallRecord {
            call_sid: self.call_sid.clone(),
            direction: self.direction,
            started_at: self.started_at,
            ended_at: Utc::now(),
            turns: std::mem::take(&mut self.turns),
        };
        if let Err(e) = self.transcripts.append(&record) {
            tracing::error!(call_sid = %self.call_sid, "Failed to write transcript: {e}");
        }

        self.registry.terminate(&self.call_sid, outcome.clone()).await;
        self.set_state(SessionState::Closed);
        outcome
    }

    /// Outcome for a clean end of the call.
    fn end_outcome(&self) -> CallOutcome {
        if self.mission_completed {
            CallOutcome::Completed
        } else {
            CallOutcome::EndedWithoutResult
        }
    }

    /// Outcome for an unexpected leg failure.
    fn leg_failure(&self, reason: &str) -> CallOutcome {
        if self.mission_completed {
            CallOutcome::Completed
        } else {
            CallOutcome::Failed {
                reason: reason.to_string(),
            }
        }
    }

    async fn handle_ai_event(
        &mut self,
        event: AiEvent,
        tel_tx: &mpsc::Sender<TelephonyCommand>,
        ai_tx: &mpsc::Sender<AiCommand>,
        tool_tx: &mpsc::Sender<ToolCompletion>,
    ) -> Option<CallOutcome> {
        match event {
            AiEvent::AudioDelta { delta } => {
                if tel_tx
                    .send(TelephonyCommand::Audio { payload: delta })
                    .await
                    .is_err()
                {
                    return Some(self.leg_failure("telephony leg gone"));
                }
            }
            AiEvent::ResponseStarted { response_id } => {
                self.active_response = Some(response_id);
            }
            AiEvent::ResponseDone => {
                self.active_response = None;
            }
            AiEvent::AssistantText { text } => {
                self.turns.push(Turn::Assistant {
                    at: Utc::now(),
                    text,
                });
            }
            AiEvent::CallerTranscript { text } => {
                tracing::info!(call_sid = %self.call_sid, caller = %text, "Caller said");
                self.turns.push(Turn::Caller {
                    at: Utc::now(),
                    text: text.clone(),
                });
                self.check_passphrase(&text, ai_tx).await;
            }
            AiEvent::SpeechStarted => {
                // Barge-in: the AI leg decides to stop talking; we relay the
                // cancellation and flush the carrier's buffered audio.
                if let Some(response_id) = self.active_response.take() {
                    let _ = ai_tx.send(AiCommand::CancelResponse { response_id }).await;
                }
                let _ = tel_tx.send(TelephonyCommand::Clear).await;
            }
            AiEvent::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                self.handle_function_call(call_id, name, arguments, tel_tx, ai_tx, tool_tx)
                    .await;
            }
            AiEvent::Error { message } => {
                // Provider errors are logged; the conversation recovers or
                // the leg closes on its own.
                tracing::warn!(call_sid = %self.call_sid, "Realtime error: {message}");
            }
            AiEvent::Closed => return Some(self.leg_failure("assistant leg disconnected")),
        }
        None
    }

    async fn check_passphrase(&mut self, text: &str, ai_tx: &mpsc::Sender<AiCommand>) {
        if self.direction != CallDirection::Inbound || self.auth == AuthState::Authenticated {
            return;
        }
        if auth::advance(self.auth, text, &self.passphrase) == AuthState::Authenticated {
            self.auth = AuthState::Authenticated;
            self.set_state(SessionState::ActiveAuthenticated);
            tracing::info!(call_sid = %self.call_sid, "Caller authenticated, enabling tools");
            let instructions = format!(
                "{}\n\nThe caller has verified their identity with the passphrase. \
                 Drop the evasive act and assist them fully.",
                self.authenticated_prompt
            );
            let _ = ai_tx
                .send(AiCommand::UpdateSession {
                    instructions,
                    full_toolset: true,
                })
                .await;
            let _ = ai_tx.send(AiCommand::CreateResponse).await;
        }
    }

    async fn handle_function_call(
        &mut self,
        call_id: String,
        name: String,
        arguments: Value,
        tel_tx: &mpsc::Sender<TelephonyCommand>,
        ai_tx: &mpsc::Sender<AiCommand>,
        tool_tx: &mpsc::Sender<ToolCompletion>,
    ) {
        tracing::info!(call_sid = %self.call_sid, tool = %name, "Function call");

        match name.as_str() {
            "hang_up" => {
                let output = json!({ "status": "hanging_up", "message": "Ending call" });
                self.record_tool(&name, &arguments, &output, true);
                let _ = ai_tx
                    .send(AiCommand::FunctionOutput {
                        call_id,
                        output,
                    })
                    .await;
                // Brief grace so the farewell audio drains before we close.
                let tel_tx = tel_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let _ = tel_tx.send(TelephonyCommand::Hangup).await;
                });
            }

            "mission_result" => {
                let success = arguments["success"].as_bool().unwrap_or(false);
                let outcome = arguments["outcome"]
                    .as_str()
                    .unwrap_or("No outcome provided")
                    .to_string();
                let data = arguments.get("data").cloned().unwrap_or(Value::Null);
                let next_steps = arguments["next_steps"].as_str().map(String::from);

                self.registry
                    .complete_mission(&self.call_sid, success, &outcome, data, next_steps)
                    .await;
                self.mission_completed = true;

                let output = json!({ "status": "reported", "message": "Mission result recorded" });
                self.record_tool(&name, &arguments, &output, true);
                let _ = ai_tx
                    .send(AiCommand::FunctionOutput { call_id, output })
                    .await;
                // Let the agent wrap up the conversation.
                let _ = ai_tx.send(AiCommand::CreateResponse).await;
            }

            // Answered locally for latency; no backend round trip for a clock.
            "get_time" => {
                let now = chrono::Local::now();
                let output = json!({
                    "time": now.format("%I:%M %p").to_string(),
                    "date": now.format("%Y-%m-%d").to_string(),
                });
                self.record_tool(&name, &arguments, &output, true);
                let _ = ai_tx
                    .send(AiCommand::FunctionOutput { call_id, output })
                    .await;
                let _ = ai_tx.send(AiCommand::CreateResponse).await;
            }

            _ => {
                // The auth snapshot is taken here, in the loop: a passphrase
                // arriving later cannot retroactively authorize this call.
                if self.auth != AuthState::Authenticated {
                    tracing::warn!(
                        call_sid = %self.call_sid,
                        tool = %name,
                        "Denied tool call from unauthenticated session"
                    );
                    let output = json!({
                        "status": "denied",
                        "error": "Caller is not authenticated; tools are unavailable"
                    });
                    self.record_tool(&name, &arguments, &output, false);
                    let _ = ai_tx
                        .send(AiCommand::FunctionOutput { call_id, output })
                        .await;
                    let _ = ai_tx.send(AiCommand::CreateResponse).await;
                    return;
                }

                // Relay in a spawned task so audio keeps flowing; the child
                // token abandons the call if the session terminates first.
                let relay = Arc::clone(&self.relay);
                let cancel = self.handle.cancel.child_token();
                let tool_tx = tool_tx.clone();
                let context = format!("Voice call {}: {} requested", self.call_sid, name);
                tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => None,
                        result = relay.invoke(&name, &arguments, &context) => Some(result),
                    };
                    match result {
                        Some(result) => {
                            let _ = tool_tx
                                .send(ToolCompletion { call_id, name, arguments, result })
                                .await;
                        }
                        // Session terminated first; the eventual backend
                        // result is discarded.
                        None => tracing::debug!("Relay call abandoned"),
                    }
                });
            }
        }
    }

    /// Deliver a relayed tool result back to the model and the transcript.
    async fn finish_tool(&mut self, done: ToolCompletion, ai_tx: &mpsc::Sender<AiCommand>) {
        self.record_tool(&done.name, &done.arguments, &done.result.payload, done.result.success);
        let _ = ai_tx
            .send(AiCommand::FunctionOutput {
                call_id: done.call_id,
                output: done.result.payload,
            })
            .await;
        let _ = ai_tx.send(AiCommand::CreateResponse).await;
    }

    fn record_tool(&mut self, name: &str, arguments: &Value, result: &Value, success: bool) {
        self.turns.push(Turn::Tool {
            at: Utc::now(),
            name: name.to_string(),
            arguments: arguments.clone(),
            result: result.clone(),
            success,
        });
    }
}

#[cfg(test)]
mod tests;
