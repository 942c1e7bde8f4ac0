use serde::Deserialize;
use std::path::PathBuf;

use crate::auth::Passphrase;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub twilio: TwilioConfig,
    pub openai: OpenAiConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
    #[serde(default)]
    pub mission: MissionConfig,
    pub transcripts: TranscriptConfig,
    pub prompts: PromptConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Public base URL Twilio can reach (https://...). Rewritten to wss://
    /// for the media stream.
    pub external_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
    /// Inbound allowlist (E.164). Empty list means any caller may ring in
    /// and face the passphrase gate.
    #[serde(default)]
    pub allowed_callers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_realtime_model")]
    pub model: String,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_realtime_model() -> String {
    "gpt-realtime".to_string()
}

fn default_voice() -> String {
    "alloy".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    /// Spoken passphrase that unlocks tool access on inbound calls.
    pub passphrase: String,
    /// How long an inbound caller gets before the unauthenticated call is
    /// hung up.
    #[serde(default = "default_max_unauthenticated_secs")]
    pub max_unauthenticated_secs: u64,
}

fn default_max_unauthenticated_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// System 2 tool-execution endpoint.
    pub url: String,
    /// Shared secret for the X-Voice-Key header, both inbound (our API) and
    /// outbound (to the backend).
    pub voice_key: String,
    #[serde(default = "default_relay_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_relay_timeout_secs() -> u64 {
    45
}

#[derive(Debug, Deserialize, Clone)]
pub struct MissionConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Terminal mission records older than this are purged.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for MissionConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    300
}

fn default_retention_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct TranscriptConfig {
    /// Directory for per-day transcript files and the voice-calls archive.
    pub dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    /// Assistant instructions for authenticated inbound calls.
    pub inbound: String,
    /// Outbound mission template with {ROLE} and {MISSION} placeholders.
    pub outbound: String,
    /// Pre-authentication instructions: evasive, solicits identification.
    pub challenge: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}. Copy config.example.toml there")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("auth.passphrase must be set; refusing to start with the gate open")]
    MissingPassphrase,
    #[error("relay.voice_key must be set")]
    MissingVoiceKey,
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env from the same directory as config.toml
        let env_path = config_dir().join(".env");
        match dotenvy::from_path(&env_path) {
            Ok(()) => tracing::info!("Loaded .env from {}", env_path.display()),
            Err(dotenvy::Error::Io(_)) => {
                tracing::debug!(
                    "No .env file at {}, using environment only",
                    env_path.display()
                );
            }
            Err(e) => tracing::warn!("Failed to parse .env: {e}"),
        }

        let path = config_path();
        tracing::info!("Loading config from {}", path.display());

        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut config: Config = toml::from_str(&contents)?;

        // Env var overrides for secrets
        if let Ok(v) = std::env::var("TWILIO_ACCOUNT_SID") {
            config.twilio.account_sid = v;
        }
        if let Ok(v) = std::env::var("TWILIO_AUTH_TOKEN") {
            config.twilio.auth_token = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            config.openai.api_key = v;
        }
        if let Ok(v) = std::env::var("VOICE_API_KEY") {
            config.relay.voice_key = v;
        }
        if let Ok(v) = std::env::var("VOICE_PASSPHRASE") {
            config.auth.passphrase = v;
        }
        if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
            config.server.external_url = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Fail closed: a server missing its passphrase or credentials must not
    /// accept calls at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Passphrase::new(&self.auth.passphrase).is_err() {
            return Err(ConfigError::MissingPassphrase);
        }
        if self.relay.voice_key.trim().is_empty() {
            return Err(ConfigError::MissingVoiceKey);
        }
        if self.twilio.account_sid.trim().is_empty() {
            return Err(ConfigError::MissingCredential("twilio.account_sid"));
        }
        if self.twilio.auth_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential("twilio.auth_token"));
        }
        if self.twilio.phone_number.trim().is_empty() {
            return Err(ConfigError::MissingCredential("twilio.phone_number"));
        }
        if self.openai.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential("openai.api_key"));
        }
        Ok(())
    }
}

fn config_dir() -> PathBuf {
    if let Ok(p) = std::env::var("VOICELINE_CONFIG") {
        // If pointing to a file, use its parent directory
        let path = PathBuf::from(p);
        return path.parent().map(|p| p.to_path_buf()).unwrap_or(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".voiceline")
}

fn config_path() -> PathBuf {
    if let Ok(p) = std::env::var("VOICELINE_CONFIG") {
        return PathBuf::from(p);
    }

    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        toml::from_str(
            r#"
            [server]
            host = "0.0.0.0"
            port = 8000
            external_url = "https://voice.example.com"

            [twilio]
            account_sid = "AC123"
            auth_token = "token"
            phone_number = "+15550001111"

            [openai]
            api_key = "sk-test"

            [auth]
            passphrase = "secret-phrase-xyz"

            [relay]
            url = "http://127.0.0.1:18789/tool"
            voice_key = "shared-secret"

            [transcripts]
            dir = "/tmp/voiceline-transcripts"

            [prompts]
            inbound = "prompts/inbound.txt"
            outbound = "prompts/outbound.txt"
            challenge = "prompts/challenge.txt"
            "#,
        )
        .expect("sample config parses")
    }

    #[test]
    fn sample_config_validates_with_defaults() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.openai.model, "gpt-realtime");
        assert_eq!(config.auth.max_unauthenticated_secs, 120);
        assert_eq!(config.relay.timeout_secs, 45);
        assert_eq!(config.mission.poll_interval_secs, 5);
        assert_eq!(config.mission.poll_timeout_secs, 300);
    }

    #[test]
    fn empty_passphrase_fails_closed() {
        let mut config = sample();
        config.auth.passphrase = "   ".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPassphrase)
        ));
    }

    #[test]
    fn missing_voice_key_is_rejected() {
        let mut config = sample();
        config.relay.voice_key = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingVoiceKey)
        ));
    }

    #[test]
    fn missing_twilio_credential_is_rejected() {
        let mut config = sample();
        config.twilio.auth_token = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential("twilio.auth_token"))
        ));
    }
}
