//! System prompt loading and mission prompt construction.
//!
//! Prompts are plain text files referenced from config. They are loaded once
//! at startup and a missing or empty file aborts startup — a call must never
//! connect with blank instructions.

use crate::config::PromptConfig;

#[derive(Debug, Clone)]
pub struct Prompts {
    /// Assistant instructions for authenticated inbound calls.
    pub inbound: String,
    /// Outbound mission template with {ROLE} and {MISSION} placeholders.
    outbound_template: String,
    /// Pre-authentication instructions (troll mode): evasive, never helpful,
    /// keeps asking who is calling.
    pub challenge: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Failed to load {label} prompt from {path}: {source}")]
    Read {
        label: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[error("Required {label} prompt is empty: {path}")]
    Empty { label: &'static str, path: String },
}

impl Prompts {
    pub fn load(config: &PromptConfig) -> Result<Self, PromptError> {
        Ok(Self {
            inbound: read_required(&config.inbound, "inbound")?,
            outbound_template: read_required(&config.outbound, "outbound")?,
            challenge: read_required(&config.challenge, "challenge")?,
        })
    }

    /// Build the system prompt for an outbound mission call.
    pub fn mission_prompt(&self, role: &str, mission: &str) -> String {
        self.outbound_template
            .replace("{ROLE}", role)
            .replace("{MISSION}", mission)
    }
}

fn read_required(path: &str, label: &'static str) -> Result<String, PromptError> {
    let content = std::fs::read_to_string(path).map_err(|e| PromptError::Read {
        label,
        path: path.to_string(),
        source: e,
    })?;
    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(PromptError::Empty {
            label,
            path: path.to_string(),
        });
    }
    tracing::info!(label, path, bytes = content.len(), "Loaded prompt");
    Ok(content)
}
