//! Spoken-passphrase gate for inbound calls.
//!
//! The gate is a pure function of the current state and one utterance. The
//! session owns acting on a transition (swapping the AI leg's instructions
//! and toolset); nothing here has side effects.

/// Per-session authentication state. Monotonic: once `Authenticated`, a
/// session never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

/// Configured passphrase, normalized once at startup.
#[derive(Debug, Clone)]
pub struct Passphrase(String);

#[derive(Debug, thiserror::Error)]
#[error("passphrase is empty")]
pub struct EmptyPassphrase;

impl Passphrase {
    pub fn new(raw: &str) -> Result<Self, EmptyPassphrase> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(EmptyPassphrase);
        }
        Ok(Self(normalized))
    }

    /// Case-insensitive, whitespace-normalized containment match.
    pub fn matches(&self, utterance: &str) -> bool {
        normalize(utterance).contains(&self.0)
    }
}

/// Lowercase and collapse all whitespace runs to single spaces.
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Evaluate one recognized utterance against the gate.
pub fn advance(state: AuthState, utterance: &str, passphrase: &Passphrase) -> AuthState {
    match state {
        // Monotonic: no utterance can revoke authentication mid-call.
        AuthState::Authenticated => AuthState::Authenticated,
        AuthState::Unauthenticated => {
            if passphrase.matches(utterance) {
                AuthState::Authenticated
            } else {
                AuthState::Unauthenticated
            }
        }
    }
}
