//! Twilio Media Stream WebSocket: attaches a call session to the socket.
//!
//! The handler waits for the carrier's `start` event (which carries the call
//! sid and direction), resolves the mission or challenge instructions,
//! connects the AI leg, registers the session, and then runs the session
//! state machine while a pump task shuttles between the socket and the
//! session's channels.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::openai;
use crate::registry::CallOutcome;
use crate::session::event::{TelephonyCommand, TelephonyEvent, TelephonyLeg};
use crate::session::{CallDirection, Session, SessionParams};
use crate::AppState;

/// How long we wait for Twilio's start event before giving up on the stream.
const START_TIMEOUT: Duration = Duration::from_secs(15);

/// Twilio Media Stream WebSocket event types.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
#[allow(dead_code)]
enum StreamEvent {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid", default)]
        stream_sid: String,
    },
    Stop {
        #[serde(rename = "streamSid", default)]
        stream_sid: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMetadata {
    #[serde(default)]
    call_sid: String,
    #[serde(default)]
    custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    /// Base64-encoded μ-law audio.
    payload: String,
}

/// WebSocket upgrade handler for GET /media-stream.
pub async fn handle_media_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_stream(socket, state))
}

async fn handle_media_stream(mut socket: WebSocket, state: AppState) {
    tracing::info!("Twilio media stream connected");

    let Some((stream_sid, start)) = wait_for_start(&mut socket).await else {
        tracing::warn!("Media stream closed before start event");
        return;
    };

    let call_sid = if start.call_sid.is_empty() {
        stream_sid.clone()
    } else {
        start.call_sid.clone()
    };
    let direction = match start.custom_parameters.get("call_direction").map(String::as_str) {
        Some("inbound") => CallDirection::Inbound,
        _ => CallDirection::Outbound,
    };
    tracing::info!(%call_sid, %stream_sid, %direction, "Stream started");

    // Resolve the AI leg's opening instructions and tool surface.
    let (instructions, full_toolset) = match direction {
        CallDirection::Inbound => (state.prompts.challenge.clone(), false),
        CallDirection::Outbound => match state.registry.take_mission(&call_sid).await {
            Some(descriptor) => {
                tracing::info!(
                    %call_sid,
                    to = %descriptor.to,
                    role = %descriptor.role,
                    mission = %descriptor.mission,
                    "Attaching mission to outbound call"
                );
                (descriptor.prompt, true)
            }
            None => {
                // Outbound calls are mission-only; never fall back to a
                // generic prompt.
                tracing::error!(%call_sid, "No stored mission for outbound call, terminating");
                state
                    .registry
                    .terminate(
                        &call_sid,
                        CallOutcome::Failed {
                            reason: "missing mission prompt".to_string(),
                        },
                    )
                    .await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        },
    };

    // One session per call sid.
    let handle = match state.registry.create(&call_sid, direction).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(%call_sid, "Refusing media stream: {e}");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    // Setup failure: the session never leaves the connecting state.
    let ai = match openai::leg::connect(&state.config.openai, &instructions, full_toolset).await {
        Ok(leg) => leg,
        Err(e) => {
            tracing::error!(%call_sid, "AI leg setup failed: {e}");
            state
                .registry
                .terminate(
                    &call_sid,
                    CallOutcome::Failed {
                        reason: format!("AI leg setup failed: {e}"),
                    },
                )
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (tel_event_tx, tel_event_rx) = mpsc::channel::<TelephonyEvent>(64);
    let (tel_cmd_tx, tel_cmd_rx) = mpsc::channel::<TelephonyCommand>(64);

    tokio::spawn(pump_socket(socket, stream_sid, tel_event_tx, tel_cmd_rx));

    let session = Session::new(SessionParams {
        call_sid: call_sid.clone(),
        direction,
        handle,
        registry: state.registry.clone(),
        relay: state.relay.clone(),
        transcripts: state.transcripts.clone(),
        passphrase: state.passphrase.clone(),
        authenticated_prompt: state.prompts.inbound.clone(),
        max_unauthenticated: Duration::from_secs(state.config.auth.max_unauthenticated_secs),
    });

    let outcome = session
        .run(
            TelephonyLeg {
                events: tel_event_rx,
                commands: tel_cmd_tx,
            },
            ai,
        )
        .await;
    tracing::info!(%call_sid, ?outcome, "Call finished");
}

/// Read the socket until Twilio's start event (bounded wait).
async fn wait_for_start(socket: &mut WebSocket) -> Option<(String, StartMetadata)> {
    let deadline = tokio::time::Instant::now() + START_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, socket.recv()).await.ok()??;
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => continue,
        };
        match serde_json::from_str::<StreamEvent>(&text) {
            Ok(StreamEvent::Start { stream_sid, start }) => return Some((stream_sid, start)),
            Ok(StreamEvent::Connected { .. }) => continue,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("Failed to parse stream event: {e}");
                continue;
            }
        }
    }
}

/// Shuttle between the Twilio socket and the session channels.
async fn pump_socket(
    mut socket: WebSocket,
    stream_sid: String,
    event_tx: mpsc::Sender<TelephonyEvent>,
    mut command_rx: mpsc::Receiver<TelephonyCommand>,
) {
    loop {
        tokio::select! {
            ws_msg = socket.recv() => {
                let text = match ws_msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Media stream closed");
                        let _ = event_tx.send(TelephonyEvent::Stop).await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Media stream error: {e}");
                        let _ = event_tx.send(TelephonyEvent::Stop).await;
                        break;
                    }
                    _ => continue,
                };

                let event: StreamEvent = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!("Failed to parse stream event: {e}");
                        continue;
                    }
                };

                let mapped = match event {
                    StreamEvent::Media { media } => Some(TelephonyEvent::Audio {
                        payload: media.payload,
                    }),
                    StreamEvent::Mark { .. } => Some(TelephonyEvent::Mark),
                    StreamEvent::Stop { .. } => {
                        let _ = event_tx.send(TelephonyEvent::Stop).await;
                        break;
                    }
                    StreamEvent::Connected { .. } | StreamEvent::Start { .. } => None,
                };

                if let Some(event) = mapped {
                    if event_tx.send(event).await.is_err() {
                        break; // session gone
                    }
                }
            }

            command = command_rx.recv() => {
                let Some(command) = command else {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };

                let result = match command {
                    TelephonyCommand::Audio { payload } => {
                        let msg = json!({
                            "event": "media",
                            "streamSid": stream_sid,
                            "media": { "payload": payload }
                        });
                        socket.send(Message::Text(msg.to_string().into())).await
                    }
                    TelephonyCommand::Clear => {
                        let msg = json!({ "event": "clear", "streamSid": stream_sid });
                        socket.send(Message::Text(msg.to_string().into())).await
                    }
                    TelephonyCommand::Hangup => {
                        let _ = socket.send(Message::Close(None)).await;
                        let _ = event_tx.send(TelephonyEvent::Stop).await;
                        break;
                    }
                };

                if let Err(e) = result {
                    tracing::error!("Failed to send to Twilio: {e}");
                    let _ = event_tx.send(TelephonyEvent::Stop).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_event_with_custom_parameters() {
        let event: StreamEvent = serde_json::from_str(
            r#"{
                "event": "start",
                "streamSid": "MZ1",
                "start": {
                    "callSid": "CA1",
                    "customParameters": {
                        "call_direction": "inbound",
                        "call_sid": "CA1"
                    }
                }
            }"#,
        )
        .unwrap();
        match event {
            StreamEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(
                    start.custom_parameters.get("call_direction").map(String::as_str),
                    Some("inbound")
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_media_event() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"event": "media", "streamSid": "MZ1", "media": {"payload": "AAAA"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            StreamEvent::Media { media } if media.payload == "AAAA"
        ));
    }

    #[test]
    fn parses_stop_event() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"event": "stop", "streamSid": "MZ1"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Stop { .. }));
    }
}
