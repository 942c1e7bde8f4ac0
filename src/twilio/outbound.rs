//! Twilio REST client for placing outbound calls.

use crate::config::TwilioConfig;

pub struct TwilioClient {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    external_url: String,
}

/// What the carrier tells us when it accepts a dial request.
#[derive(Debug)]
pub struct DialResult {
    pub call_sid: String,
    pub status: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Twilio API error: {0}")]
    Api(String),
}

impl TwilioClient {
    pub fn new(twilio_config: &TwilioConfig, external_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            from_number: twilio_config.phone_number.clone(),
            external_url: external_url.to_string(),
        }
    }

    pub fn from_number(&self) -> &str {
        &self.from_number
    }

    /// Dial `to`. When the callee answers, Twilio fetches /twiml (which
    /// opens the media stream); lifecycle events land on /call-status.
    /// Returns as soon as the carrier accepts the request — the mission
    /// itself resolves later via the result poller.
    pub async fn call(&self, to: &str, timezone: &str) -> Result<DialResult, OutboundError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
            self.account_sid
        );

        let twiml_url = format!("{}/twiml?timezone={}", self.external_url, urlencoded(timezone));
        let status_callback = format!("{}/call-status", self.external_url);

        let params = [
            ("To", to),
            ("From", &self.from_number),
            ("Url", &twiml_url),
            ("StatusCallback", &status_callback),
            ("StatusCallbackEvent", "initiated"),
            ("StatusCallbackEvent", "ringing"),
            ("StatusCallbackEvent", "answered"),
            ("StatusCallbackEvent", "completed"),
        ];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| OutboundError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OutboundError::Api(format!("{status}: {body}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| OutboundError::Request(e.to_string()))?;

        let call_sid = body["sid"].as_str().unwrap_or("unknown").to_string();
        let status = body["status"].as_str().unwrap_or("queued").to_string();

        tracing::info!(to, call_sid = %call_sid, %status, "Outbound call initiated");
        Ok(DialResult { call_sid, status })
    }
}

/// Simple URL encoding for query parameter values.
fn urlencoded(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                String::from(b as char)
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencodes_timezone_names() {
        assert_eq!(urlencoded("America/Los_Angeles"), "America%2FLos_Angeles");
        assert_eq!(urlencoded("UTC"), "UTC");
    }
}
