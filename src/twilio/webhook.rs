//! TwiML webhooks: they answer the carrier fast and point the call at the
//! media-stream WebSocket. Call direction and sid travel as `<Parameter>`
//! custom parameters, never the mission content.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Form;
use serde::Deserialize;

use crate::twilio::normalize_number;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct IncomingCallForm {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
}

/// Handle POST /incoming-call — carrier webhook for inbound calls.
///
/// When an allowlist is configured, unknown callers get a spoken denial and
/// a hangup; everyone else is connected to the media stream and faces the
/// passphrase gate there.
pub async fn handle_incoming_call(
    State(state): State<AppState>,
    Form(form): Form<IncomingCallForm>,
) -> Response {
    let allowed = &state.config.twilio.allowed_callers;
    if !allowed.is_empty() {
        let normalized = normalize_number(&form.from);
        let permitted = allowed.iter().any(|n| normalize_number(n) == normalized);
        if !permitted {
            tracing::warn!(
                from = %form.from,
                call_sid = %form.call_sid,
                "Rejected inbound caller"
            );
            let twiml = r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>Access denied.</Say>
    <Hangup/>
</Response>"#;
            return ([("Content-Type", "text/xml")], twiml).into_response();
        }
    }

    tracing::info!(from = %form.from, call_sid = %form.call_sid, "Inbound call accepted");

    let twiml = connect_stream_twiml(
        &state.config.server.external_url,
        &[("call_direction", "inbound"), ("call_sid", &form.call_sid)],
    );
    ([("Content-Type", "text/xml")], twiml).into_response()
}

#[derive(Debug, Deserialize)]
pub struct TwimlQuery {
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

/// Handle GET/POST /twiml — TwiML for outbound calls once the callee picks
/// up. The mission prompt stays server-side keyed by call sid; only
/// direction and timezone ride along.
pub async fn handle_twiml(
    State(state): State<AppState>,
    Query(query): Query<TwimlQuery>,
) -> Response {
    let twiml = connect_stream_twiml(
        &state.config.server.external_url,
        &[
            ("call_direction", "outbound"),
            ("timezone", &query.timezone),
        ],
    );
    ([("Content-Type", "text/xml")], twiml).into_response()
}

fn connect_stream_twiml(external_url: &str, parameters: &[(&str, &str)]) -> String {
    let ws_url = media_stream_url(external_url);
    let params: String = parameters
        .iter()
        .map(|(name, value)| {
            format!(r#"            <Parameter name="{name}" value="{}" />{}"#, xml_escape(value), "\n")
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{ws_url}">
{params}        </Stream>
    </Connect>
</Response>"#
    )
}

fn media_stream_url(external_url: &str) -> String {
    format!(
        "{}/media-stream",
        external_url
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
