//! AI leg: WebSocket connection to the OpenAI Realtime API.
//!
//! `connect` dials the provider, applies the initial session settings, and
//! spawns a pump that translates wire JSON into [`AiEvent`]s and
//! [`AiCommand`]s into client events. The session only ever sees the typed
//! channel pair.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::OpenAiConfig;
use crate::openai::protocol::{self, ServerEvent, SessionSettings};
use crate::session::event::{AiCommand, AiEvent, AiLeg};

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

#[derive(Debug, thiserror::Error)]
pub enum LegError {
    #[error("Failed to build realtime request: {0}")]
    Request(String),
    #[error("Realtime connection failed: {0}")]
    Connect(String),
    #[error("Failed to send session settings: {0}")]
    Setup(String),
}

/// Dial the Realtime API and start the pump. Failure here means the session
/// never leaves the connecting state.
pub async fn connect(
    config: &OpenAiConfig,
    instructions: &str,
    full_toolset: bool,
) -> Result<AiLeg, LegError> {
    let url = format!("{REALTIME_URL}?model={}", config.model);
    let mut request = url
        .into_client_request()
        .map_err(|e| LegError::Request(e.to_string()))?;

    let auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
        .map_err(|e| LegError::Request(e.to_string()))?;
    request.headers_mut().insert("Authorization", auth);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    let (mut ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| LegError::Connect(e.to_string()))?;
    tracing::info!(model = %config.model, "Connected to Realtime API");

    let settings = SessionSettings {
        instructions,
        voice: &config.voice,
        temperature: config.temperature,
        full_toolset,
    };
    ws.send(Message::Text(
        protocol::session_update(&settings).to_string().into(),
    ))
    .await
    .map_err(|e| LegError::Setup(e.to_string()))?;

    let (event_tx, event_rx) = mpsc::channel::<AiEvent>(64);
    let (command_tx, command_rx) = mpsc::channel::<AiCommand>(64);

    let voice = config.voice.clone();
    let temperature = config.temperature;
    tokio::spawn(pump(ws, event_tx, command_rx, voice, temperature));

    Ok(AiLeg {
        events: event_rx,
        commands: command_tx,
    })
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Shuttle between the provider socket and the session channels until either
/// side goes away.
async fn pump(
    ws: WsStream,
    event_tx: mpsc::Sender<AiEvent>,
    mut command_rx: mpsc::Receiver<AiCommand>,
    voice: String,
    temperature: f32,
) {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            ws_msg = stream.next() => {
                let text = match ws_msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::info!("Realtime connection closed");
                        let _ = event_tx.send(AiEvent::Closed).await;
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::error!("Realtime WebSocket error: {e}");
                        let _ = event_tx.send(AiEvent::Closed).await;
                        break;
                    }
                    _ => continue,
                };

                let event: ServerEvent = match serde_json::from_str(text.as_str()) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!("Unparseable realtime event: {e}");
                        continue;
                    }
                };

                let mapped = match event {
                    ServerEvent::AudioDelta { delta } => Some(AiEvent::AudioDelta { delta }),
                    ServerEvent::ResponseCreated { response } => Some(AiEvent::ResponseStarted {
                        response_id: response.id,
                    }),
                    ServerEvent::ResponseDone { response } => {
                        if let Some(text) = response.assistant_text() {
                            if event_tx.send(AiEvent::AssistantText { text }).await.is_err() {
                                break;
                            }
                        }
                        Some(AiEvent::ResponseDone)
                    }
                    ServerEvent::TranscriptionCompleted { transcript } => {
                        let text = transcript.trim().to_string();
                        if text.is_empty() {
                            None
                        } else {
                            Some(AiEvent::CallerTranscript { text })
                        }
                    }
                    ServerEvent::SpeechStarted => Some(AiEvent::SpeechStarted),
                    ServerEvent::FunctionCallDone {
                        call_id,
                        name,
                        arguments,
                    } => {
                        let arguments = serde_json::from_str(&arguments)
                            .unwrap_or_else(|_| serde_json::json!({}));
                        Some(AiEvent::FunctionCall {
                            call_id,
                            name,
                            arguments,
                        })
                    }
                    ServerEvent::Error { error } => Some(AiEvent::Error {
                        message: error.to_string(),
                    }),
                    ServerEvent::Other => None,
                };

                if let Some(event) = mapped {
                    if event_tx.send(event).await.is_err() {
                        break; // session gone
                    }
                }
            }

            command = command_rx.recv() => {
                let Some(command) = command else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };

                let payload = match command {
                    AiCommand::UpdateSession { instructions, full_toolset } => {
                        protocol::session_update(&SessionSettings {
                            instructions: &instructions,
                            voice: &voice,
                            temperature,
                            full_toolset,
                        })
                    }
                    AiCommand::AppendAudio { payload } => protocol::append_audio(&payload),
                    AiCommand::CancelResponse { response_id } => {
                        protocol::cancel_response(&response_id)
                    }
                    AiCommand::FunctionOutput { call_id, output } => {
                        protocol::function_output(&call_id, &output)
                    }
                    AiCommand::InjectUserText { text } => protocol::user_text_item(&text),
                    AiCommand::CreateResponse => protocol::response_create(),
                    AiCommand::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };

                if let Err(e) = sink.send(Message::Text(payload.to_string().into())).await {
                    tracing::error!("Failed to send to Realtime API: {e}");
                    let _ = event_tx.send(AiEvent::Closed).await;
                    break;
                }
            }
        }
    }
}
