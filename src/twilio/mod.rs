pub mod media;
pub mod outbound;
pub mod webhook;

/// Normalize a phone number to E.164-ish `+digits` for allowlist checks and
/// dialing. Returns an empty string when no digits survive.
pub fn normalize_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        String::new()
    } else {
        format!("+{digits}")
    }
}
