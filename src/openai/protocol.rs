//! Typed views of the OpenAI Realtime wire protocol.
//!
//! Only the events the engine acts on get a variant; everything else parses
//! into `Other` and is ignored by the pump. Client events are built with
//! `serde_json::json!` since they are write-only.

use serde::Deserialize;
use serde_json::{json, Value};

/// Server → engine events.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseRef },

    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseBody },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallDone {
        call_id: String,
        name: String,
        /// JSON-encoded argument object.
        #[serde(default)]
        arguments: String,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Value,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ResponseRef {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResponseBody {
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
pub struct OutputItem {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

impl ResponseBody {
    /// Collect the assistant's text from a finished response.
    pub fn assistant_text(&self) -> Option<String> {
        let mut parts = Vec::new();
        for item in &self.output {
            if item.kind != "message" {
                continue;
            }
            for content in &item.content {
                if (content.kind == "text" || content.kind == "audio" || content.kind == "output_text")
                    && !content.text.is_empty()
                {
                    parts.push(content.text.clone());
                }
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Session parameters for the initial and follow-up `session.update`.
pub struct SessionSettings<'a> {
    pub instructions: &'a str,
    pub voice: &'a str,
    pub temperature: f32,
    pub full_toolset: bool,
}

pub fn session_update(settings: &SessionSettings<'_>) -> Value {
    json!({
        "type": "session.update",
        "session": {
            "modalities": ["text", "audio"],
            "instructions": settings.instructions,
            "voice": settings.voice,
            "input_audio_format": "g711_ulaw",
            "output_audio_format": "g711_ulaw",
            "input_audio_transcription": { "model": "whisper-1" },
            "turn_detection": {
                "type": "server_vad",
                "threshold": 0.5,
                "prefix_padding_ms": 300,
                "silence_duration_ms": 500
            },
            "tools": toolset(settings.full_toolset),
            "tool_choice": "auto",
            "temperature": settings.temperature
        }
    })
}

pub fn append_audio(payload: &str) -> Value {
    json!({ "type": "input_audio_buffer.append", "audio": payload })
}

pub fn cancel_response(response_id: &str) -> Value {
    json!({ "type": "response.cancel", "response_id": response_id })
}

pub fn function_output(call_id: &str, output: &Value) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "function_call_output",
            "call_id": call_id,
            "output": output.to_string()
        }
    })
}

pub fn user_text_item(text: &str) -> Value {
    json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{ "type": "input_text", "text": text }]
        }
    })
}

pub fn response_create() -> Value {
    json!({ "type": "response.create" })
}

/// Tool definitions offered to the model.
///
/// Before authentication only `hang_up` is exposed: an unverified caller must
/// not even see the tool surface.
pub fn toolset(full: bool) -> Value {
    let hang_up = json!({
        "type": "function",
        "name": "hang_up",
        "description": "End the phone call",
        "parameters": { "type": "object", "properties": {}, "required": [] }
    });

    if !full {
        return json!([hang_up]);
    }

    json!([
        hang_up,
        {
            "type": "function",
            "name": "answer_user_query",
            "description": "Consult the System 2 backend to answer a question or retrieve information. Use this for facts, memory, status updates, or web searches.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The specific question or information to retrieve"
                    }
                },
                "required": ["query"]
            }
        },
        {
            "type": "function",
            "name": "execute_system_action",
            "description": "Consult the System 2 backend to perform a specific action or task. Use this for messaging, file operations, calendar edits, or running system commands.",
            "parameters": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "description": "The specific action or task to perform"
                    }
                },
                "required": ["action"]
            }
        },
        {
            "type": "function",
            "name": "get_time",
            "description": "Get the current time",
            "parameters": {
                "type": "object",
                "properties": {
                    "timezone": { "type": "string", "description": "IANA timezone name" }
                },
                "required": []
            }
        },
        {
            "type": "function",
            "name": "mission_result",
            "description": "Report the outcome of your mission. Call this when the mission is complete, blocked, or cannot be completed. Always call before hanging up.",
            "parameters": {
                "type": "object",
                "properties": {
                    "success": {
                        "type": "boolean",
                        "description": "Whether the mission objective was achieved"
                    },
                    "outcome": {
                        "type": "string",
                        "description": "Brief description of what happened (1-2 sentences)"
                    },
                    "data": {
                        "type": "object",
                        "description": "Any relevant data collected during the call (names, times, confirmations, etc.)"
                    },
                    "next_steps": {
                        "type": "string",
                        "description": "Recommended follow-up actions"
                    }
                },
                "required": ["success", "outcome"]
            }
        }
    ])
}
