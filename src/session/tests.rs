use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::event::*;
use super::*;
use crate::config::RelayConfig;
use crate::mission::MissionStatus;

struct Harness {
    call_sid: String,
    tel_events: mpsc::Sender<TelephonyEvent>,
    tel_commands: mpsc::Receiver<TelephonyCommand>,
    ai_events: mpsc::Sender<AiEvent>,
    ai_commands: mpsc::Receiver<AiCommand>,
    registry: SessionRegistry,
    transcript_dir: PathBuf,
    task: JoinHandle<CallOutcome>,
}

async fn spawn_session(tag: &str, direction: CallDirection, relay_url: &str) -> Harness {
    spawn_session_with_deadline(tag, direction, relay_url, Duration::from_secs(600)).await
}

async fn spawn_session_with_deadline(
    tag: &str,
    direction: CallDirection,
    relay_url: &str,
    max_unauthenticated: Duration,
) -> Harness {
    let call_sid = format!("CA-{tag}");
    let registry = SessionRegistry::new(24);
    let handle = registry.create(&call_sid, direction).await.unwrap();

    let transcript_dir =
        std::env::temp_dir().join(format!("voiceline-session-{}-{tag}", std::process::id()));
    let _ = std::fs::remove_dir_all(&transcript_dir);

    let (tel_event_tx, tel_event_rx) = mpsc::channel(32);
    let (tel_cmd_tx, tel_cmd_rx) = mpsc::channel(32);
    let (ai_event_tx, ai_event_rx) = mpsc::channel(32);
    let (ai_cmd_tx, ai_cmd_rx) = mpsc::channel(32);

    let session = Session::new(SessionParams {
        call_sid: call_sid.clone(),
        direction,
        handle,
        registry: registry.clone(),
        relay: Arc::new(RelayClient::new(&RelayConfig {
            url: relay_url.to_string(),
            voice_key: "shared-secret".to_string(),
            timeout_secs: 2,
        })),
        transcripts: TranscriptStore::new(&transcript_dir),
        passphrase: Passphrase::new("secret-phrase-xyz").unwrap(),
        authenticated_prompt: "You are the house assistant.".to_string(),
        max_unauthenticated,
    });

    let task = tokio::spawn(session.run(
        TelephonyLeg {
            events: tel_event_rx,
            commands: tel_cmd_tx,
        },
        AiLeg {
            events: ai_event_rx,
            commands: ai_cmd_tx,
        },
    ));

    let mut harness = Harness {
        call_sid,
        tel_events: tel_event_tx,
        tel_commands: tel_cmd_rx,
        ai_events: ai_event_tx,
        ai_commands: ai_cmd_rx,
        registry,
        transcript_dir,
        task,
    };

    if direction == CallDirection::Inbound {
        // Greeting kick: injected user text plus a response.create.
        assert!(matches!(
            harness.next_ai_command().await,
            AiCommand::InjectUserText { .. }
        ));
        assert!(matches!(
            harness.next_ai_command().await,
            AiCommand::CreateResponse
        ));
    }

    harness
}

impl Harness {
    async fn next_ai_command(&mut self) -> AiCommand {
        timeout(Duration::from_secs(5), self.ai_commands.recv())
            .await
            .expect("timed out waiting for AI command")
            .expect("AI command channel closed")
    }

    async fn next_tel_command(&mut self) -> TelephonyCommand {
        timeout(Duration::from_secs(5), self.tel_commands.recv())
            .await
            .expect("timed out waiting for telephony command")
            .expect("telephony command channel closed")
    }

    async fn finish(mut self) -> (CallOutcome, SessionRegistry, PathBuf, String) {
        self.tel_events.send(TelephonyEvent::Stop).await.unwrap();
        // Session closes its AI leg on the way out.
        loop {
            match timeout(Duration::from_secs(5), self.ai_commands.recv())
                .await
                .expect("timed out waiting for session to close")
            {
                Some(AiCommand::Close) | None => break,
                Some(_) => continue,
            }
        }
        let outcome = self.task.await.unwrap();
        (outcome, self.registry, self.transcript_dir, self.call_sid)
    }
}

/// Minimal one-shot HTTP backend: reads a full request, answers with a fixed
/// JSON body.
async fn stub_backend(body: &'static str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/tool", listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let n = socket.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if request_complete(&buf) {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    url
}

fn request_complete(buf: &[u8]) -> bool {
    let text = String::from_utf8_lossy(buf);
    let Some(header_end) = text.find("\r\n\r\n") else {
        return false;
    };
    let content_length = text
        .lines()
        .find_map(|l| l.to_lowercase().strip_prefix("content-length:").map(str::trim).map(String::from))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    buf.len() >= header_end + 4 + content_length
}

#[tokio::test]
async fn audio_is_relayed_in_both_directions() {
    let mut h = spawn_session("audio", CallDirection::Inbound, "http://127.0.0.1:9/tool").await;

    h.tel_events
        .send(TelephonyEvent::Audio {
            payload: "dGVzdA==".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(
        h.next_ai_command().await,
        AiCommand::AppendAudio {
            payload: "dGVzdA==".to_string()
        }
    );

    h.ai_events
        .send(AiEvent::AudioDelta {
            delta: "cmVwbHk=".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(
        h.next_tel_command().await,
        TelephonyCommand::Audio {
            payload: "cmVwbHk=".to_string()
        }
    );

    let (outcome, ..) = h.finish().await;
    assert_eq!(outcome, CallOutcome::EndedWithoutResult);
}

#[tokio::test]
async fn unauthenticated_tool_call_is_denied_without_backend() {
    // Relay points at a closed port: if the session ever contacted it the
    // result would say "failed", not "denied".
    let mut h = spawn_session("deny", CallDirection::Inbound, "http://127.0.0.1:9/tool").await;

    h.ai_events
        .send(AiEvent::FunctionCall {
            call_id: "c1".to_string(),
            name: "answer_user_query".to_string(),
            arguments: json!({"query": "what's on my calendar"}),
        })
        .await
        .unwrap();

    match h.next_ai_command().await {
        AiCommand::FunctionOutput { call_id, output } => {
            assert_eq!(call_id, "c1");
            assert_eq!(output["status"], "denied");
        }
        other => panic!("unexpected command: {other:?}"),
    }
    assert!(matches!(h.next_ai_command().await, AiCommand::CreateResponse));

    let (outcome, registry, _, call_sid) = h.finish().await;
    assert_eq!(outcome, CallOutcome::EndedWithoutResult);
    let record = registry.poll_mission_result(&call_sid).await.unwrap();
    assert_eq!(record.status, MissionStatus::EndedWithoutResult);
}

#[tokio::test]
async fn passphrase_enables_tools_and_relays_them() {
    let backend = stub_backend(r#"{"success":true,"result":{"answer":"one meeting at 3pm"}}"#).await;
    let mut h = spawn_session("unlock", CallDirection::Inbound, &backend).await;

    // No passphrase: gate stays closed.
    h.ai_events
        .send(AiEvent::CallerTranscript {
            text: "Hi, I need help".to_string(),
        })
        .await
        .unwrap();

    // Passphrase contained in a longer utterance flips the gate.
    h.ai_events
        .send(AiEvent::CallerTranscript {
            text: "it's ramon, secret-phrase-xyz".to_string(),
        })
        .await
        .unwrap();

    match h.next_ai_command().await {
        AiCommand::UpdateSession {
            instructions,
            full_toolset,
        } => {
            assert!(full_toolset);
            assert!(instructions.contains("You are the house assistant."));
        }
        other => panic!("expected session update, got {other:?}"),
    }
    assert!(matches!(h.next_ai_command().await, AiCommand::CreateResponse));

    // Now a tool call reaches the backend.
    h.ai_events
        .send(AiEvent::FunctionCall {
            call_id: "c2".to_string(),
            name: "answer_user_query".to_string(),
            arguments: json!({"query": "calendar today"}),
        })
        .await
        .unwrap();

    match h.next_ai_command().await {
        AiCommand::FunctionOutput { call_id, output } => {
            assert_eq!(call_id, "c2");
            assert_eq!(output["answer"], "one meeting at 3pm");
        }
        other => panic!("unexpected command: {other:?}"),
    }
    assert!(matches!(h.next_ai_command().await, AiCommand::CreateResponse));

    let (_, _, dir, call_sid) = h.finish().await;

    // Transcript keeps occurrence order: both utterances before the tool.
    let archive = std::fs::read_to_string(dir.join("voice-calls.md")).unwrap();
    assert!(archive.contains(&call_sid));
    let first = archive.find("Hi, I need help").unwrap();
    let second = archive.find("secret-phrase-xyz").unwrap();
    let tool = archive.find("answer_user_query").unwrap();
    assert!(first < second && second < tool);
}

#[tokio::test]
async fn barge_in_cancels_response_and_clears_buffer() {
    let mut h = spawn_session("barge", CallDirection::Outbound, "http://127.0.0.1:9/tool").await;

    h.ai_events
        .send(AiEvent::ResponseStarted {
            response_id: "resp_1".to_string(),
        })
        .await
        .unwrap();
    h.ai_events.send(AiEvent::SpeechStarted).await.unwrap();

    assert_eq!(
        h.next_ai_command().await,
        AiCommand::CancelResponse {
            response_id: "resp_1".to_string()
        }
    );
    assert_eq!(h.next_tel_command().await, TelephonyCommand::Clear);

    h.finish().await;
}

#[tokio::test]
async fn mission_result_is_recorded_write_once() {
    let mut h = spawn_session("mission", CallDirection::Outbound, "http://127.0.0.1:9/tool").await;

    h.ai_events
        .send(AiEvent::FunctionCall {
            call_id: "c3".to_string(),
            name: "mission_result".to_string(),
            arguments: json!({
                "success": true,
                "outcome": "left message",
                "data": {"with": "front desk"},
                "next_steps": "call back tomorrow"
            }),
        })
        .await
        .unwrap();

    match h.next_ai_command().await {
        AiCommand::FunctionOutput { output, .. } => assert_eq!(output["status"], "reported"),
        other => panic!("unexpected command: {other:?}"),
    }
    assert!(matches!(h.next_ai_command().await, AiCommand::CreateResponse));

    // Result visible to pollers before the call even ends.
    let record = h.registry.poll_mission_result(&h.call_sid).await.unwrap();
    assert_eq!(record.status, MissionStatus::Completed);
    assert!(record.success);
    assert_eq!(record.outcome.as_deref(), Some("left message"));

    let (outcome, registry, _, call_sid) = h.finish().await;
    assert_eq!(outcome, CallOutcome::Completed);
    // Termination does not rewrite the reported result.
    let record = registry.poll_mission_result(&call_sid).await.unwrap();
    assert_eq!(record.status, MissionStatus::Completed);
    assert_eq!(record.next_steps.as_deref(), Some("call back tomorrow"));
}

#[tokio::test]
async fn hang_up_acks_then_closes_the_call() {
    let mut h = spawn_session("hangup", CallDirection::Inbound, "http://127.0.0.1:9/tool").await;

    h.ai_events
        .send(AiEvent::FunctionCall {
            call_id: "c4".to_string(),
            name: "hang_up".to_string(),
            arguments: json!({}),
        })
        .await
        .unwrap();

    match h.next_ai_command().await {
        AiCommand::FunctionOutput { output, .. } => assert_eq!(output["status"], "hanging_up"),
        other => panic!("unexpected command: {other:?}"),
    }
    // Hangup arrives after the farewell grace.
    assert_eq!(h.next_tel_command().await, TelephonyCommand::Hangup);

    let (outcome, ..) = h.finish().await;
    assert_eq!(outcome, CallOutcome::EndedWithoutResult);
}

#[tokio::test(start_paused = true)]
async fn unauthenticated_deadline_hangs_up() {
    let mut h = spawn_session_with_deadline(
        "deadline",
        CallDirection::Inbound,
        "http://127.0.0.1:9/tool",
        Duration::from_secs(120),
    )
    .await;

    // No passphrase ever arrives; paused time runs out the clock. The wait
    // here must outlast the 120s deadline or its own timer fires first.
    let command = timeout(Duration::from_secs(600), h.tel_commands.recv())
        .await
        .expect("deadline never fired")
        .expect("telephony command channel closed");
    assert_eq!(command, TelephonyCommand::Hangup);

    let outcome = h.task.await.unwrap();
    assert_eq!(outcome, CallOutcome::EndedWithoutResult);
    assert!(h.registry.get(&h.call_sid).await.is_none());
}

#[tokio::test]
async fn ai_leg_loss_fails_the_session() {
    let mut h = spawn_session("aidrop", CallDirection::Inbound, "http://127.0.0.1:9/tool").await;

    h.ai_events.send(AiEvent::Closed).await.unwrap();

    let outcome = h.task.await.unwrap();
    assert!(matches!(outcome, CallOutcome::Failed { .. }));
    let record = h.registry.poll_mission_result(&h.call_sid).await.unwrap();
    assert_eq!(record.status, MissionStatus::Failed);
}

#[tokio::test]
async fn external_terminate_unblocks_the_session() {
    let h = spawn_session("cancel", CallDirection::Inbound, "http://127.0.0.1:9/tool").await;

    h.registry
        .terminate(
            &h.call_sid,
            CallOutcome::Failed {
                reason: "operator stop".to_string(),
            },
        )
        .await;

    // The cancel token unblocks the select loop; no task leaks past Closed.
    let outcome = timeout(Duration::from_secs(5), h.task).await.unwrap().unwrap();
    assert_eq!(outcome, CallOutcome::EndedWithoutResult);

    // The externally stored outcome wins; the session's own terminate is a
    // no-op on an already-terminal record.
    let record = h.registry.poll_mission_result(&h.call_sid).await.unwrap();
    assert_eq!(record.status, MissionStatus::Failed);
    assert_eq!(record.outcome.as_deref(), Some("operator stop"));
}
