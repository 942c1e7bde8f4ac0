//! Leg messages for a call session.
//!
//! Both legs are modeled as mpsc channel pairs so the session state machine
//! never touches a socket: the Twilio media stream and the OpenAI Realtime
//! connection each run a pump task that translates wire JSON to these typed
//! messages. Tests drive a session with plain channels.

use serde_json::Value;
use tokio::sync::mpsc;

/// Event arriving from the telephony leg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyEvent {
    /// Base64 μ-law media payload, forwarded verbatim to the AI leg.
    Audio { payload: String },
    /// Playback marker echoed back by Twilio.
    Mark,
    /// Carrier ended the stream.
    Stop,
}

/// Command for the telephony leg pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelephonyCommand {
    /// Base64 μ-law media payload from the AI, relayed to the caller.
    Audio { payload: String },
    /// Flush buffered audio (barge-in).
    Clear,
    /// Close the call from our side.
    Hangup,
}

/// Event arriving from the AI leg.
#[derive(Debug, Clone, PartialEq)]
pub enum AiEvent {
    /// Base64 audio delta for the caller.
    AudioDelta { delta: String },
    /// Whisper transcription of a completed caller utterance.
    CallerTranscript { text: String },
    /// Assistant text extracted from a finished response.
    AssistantText { text: String },
    /// A response started; its id is needed for barge-in cancellation.
    ResponseStarted { response_id: String },
    ResponseDone,
    /// Caller started speaking over the assistant.
    SpeechStarted,
    /// Structured tool invocation from the model.
    FunctionCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    /// Provider-reported error; logged, not fatal.
    Error { message: String },
    /// The provider connection is gone.
    Closed,
}

/// Command for the AI leg pump.
#[derive(Debug, Clone, PartialEq)]
pub enum AiCommand {
    /// Swap instructions and toolset (session.update).
    UpdateSession {
        instructions: String,
        full_toolset: bool,
    },
    /// Append caller audio (base64 μ-law).
    AppendAudio { payload: String },
    /// Cancel an in-flight response (barge-in).
    CancelResponse { response_id: String },
    /// Deliver a function call result.
    FunctionOutput { call_id: String, output: Value },
    /// Inject a synthetic user message (greeting kick).
    InjectUserText { text: String },
    /// Ask the model to speak.
    CreateResponse,
    Close,
}

/// Channel ends the session holds for the telephony leg.
pub struct TelephonyLeg {
    pub events: mpsc::Receiver<TelephonyEvent>,
    pub commands: mpsc::Sender<TelephonyCommand>,
}

/// Channel ends the session holds for the AI leg.
pub struct AiLeg {
    pub events: mpsc::Receiver<AiEvent>,
    pub commands: mpsc::Sender<AiCommand>,
}
