//! Call management API: outbound mission dialing, result polling, and the
//! carrier status callback.
//!
//! Sensitive endpoints require the `X-Voice-Key` shared secret. Polling a
//! sid we do not know yields a 404 that callers treat as "keep polling".

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use serde::Deserialize;
use serde_json::json;

use crate::mission::MissionDescriptor;
use crate::twilio::normalize_number;
use crate::AppState;

const VOICE_KEY_HEADER: &str = "X-Voice-Key";

/// GET / — health, version, and the number of calls in flight.
pub async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "voiceline",
        "version": env!("CARGO_PKG_VERSION"),
        "active_calls": state.registry.active_count().await,
    }))
}

fn verify_voice_key(headers: &HeaderMap, expected: &str) -> Result<(), Response> {
    let provided = headers.get(VOICE_KEY_HEADER).and_then(|v| v.to_str().ok());
    match provided {
        Some(key) if key == expected => Ok(()),
        _ => {
            tracing::warn!("Rejected request with bad voice key");
            Err((
                StatusCode::FORBIDDEN,
                Json(json!({ "detail": "Forbidden: Invalid Voice API Key" })),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallRequest {
    /// Mission objective for the call (required).
    pub mission: Option<String>,
    /// Legacy alias for `mission`.
    pub message: Option<String>,
    /// Persona for the voice agent.
    pub role: Option<String>,
    pub agent_timezone: Option<String>,
}

/// POST /call/number/{phone_number} — place an outbound mission call.
///
/// Returns as soon as the carrier accepts the dial; the mission outcome is
/// polled separately via /call/{call_sid}/result.
pub async fn handle_call_number(
    State(state): State<AppState>,
    Path(phone_number): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CallRequest>,
) -> Response {
    if let Err(resp) = verify_voice_key(&headers, &state.config.relay.voice_key) {
        return resp;
    }

    let Some(mission) = req.mission.or(req.message).filter(|m| !m.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "mission is required for outbound calls" })),
        )
            .into_response();
    };

    let to = if phone_number.starts_with('+') {
        phone_number
    } else {
        normalize_number(&phone_number)
    };
    if to.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "detail": "invalid phone number" })),
        )
            .into_response();
    }

    let role = req.role.unwrap_or_else(|| "personal assistant".to_string());
    let timezone = req
        .agent_timezone
        .unwrap_or_else(|| "America/Los_Angeles".to_string());
    let prompt = state.prompts.mission_prompt(&role, &mission);
    tracing::info!(%to, %role, "Outbound mission call requested");

    match state.twilio.call(&to, &timezone).await {
        Ok(dial) => {
            // The prompt stays server-side; Twilio only routes audio.
            state
                .registry
                .register_mission(
                    &dial.call_sid,
                    MissionDescriptor {
                        to: to.clone(),
                        mission,
                        role,
                        prompt,
                    },
                )
                .await;

            Json(json!({
                "success": true,
                "call_sid": dial.call_sid,
                "to": to,
                "from": state.twilio.from_number(),
                "status": dial.status,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!("Failed to initiate call: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResultQuery {
    /// Block until the mission reaches a terminal status (or the configured
    /// poll timeout elapses) instead of returning the current snapshot.
    #[serde(default)]
    pub wait: bool,
}

/// GET /call/{call_sid}/result — mission result, polled by the initiating
/// agent until a terminal status shows up. With `?wait=true` the request
/// blocks server-side and answers with the terminal record, or `timed_out`.
pub async fn handle_call_result(
    State(state): State<AppState>,
    Path(call_sid): Path<String>,
    Query(query): Query<ResultQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = verify_voice_key(&headers, &state.config.relay.voice_key) {
        return resp;
    }

    let Some(record) = state.registry.poll_mission_result(&call_sid).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "unknown", "call_sid": call_sid })),
        )
            .into_response();
    };

    if query.wait && !record.status.is_terminal() {
        let record = state
            .registry
            .wait_for_result(
                &call_sid,
                Duration::from_secs(state.config.mission.poll_interval_secs),
                Duration::from_secs(state.config.mission.poll_timeout_secs),
            )
            .await;
        return Json(record).into_response();
    }

    Json(record).into_response()
}

#[derive(Debug, Deserialize)]
pub struct StatusCallbackForm {
    #[serde(rename = "CallSid", default)]
    pub call_sid: String,
    #[serde(rename = "CallStatus", default)]
    pub call_status: String,
}

/// POST /call-status — Twilio call lifecycle callback.
pub async fn handle_call_status(
    State(state): State<AppState>,
    Form(form): Form<StatusCallbackForm>,
) -> Json<serde_json::Value> {
    tracing::info!(call_sid = %form.call_sid, status = %form.call_status, "Call status");
    if !form.call_sid.is_empty() {
        state
            .registry
            .carrier_status(&form.call_sid, &form.call_status)
            .await;
    }
    Json(json!({ "status": "received" }))
}
