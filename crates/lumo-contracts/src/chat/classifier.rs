/// What the user is asking for, decided by case-insensitive substring
/// matching on the raw request text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Essay,
    Story,
    Song,
    General,
}

impl RequestKind {
    /// Essay and general requests pull an encyclopedia reference first;
    /// story and song requests only use web search snippets.
    pub fn wants_reference(self) -> bool {
        matches!(self, RequestKind::Essay | RequestKind::General)
    }
}

const GREETINGS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "greetings",
    "good morning",
    "good afternoon",
    "good evening",
    "hi there",
];

pub const GREETING_RESPONSES: &[&str] = &[
    "Hello! How can I help you today?",
    "Hi there! I'm here to assist you. What's on your mind?",
    "Hey! Great to see you. What would you like to know?",
    "Greetings! I'm ready to help you with any questions.",
    "Hello! I'm your assistant. How may I help you today?",
];

pub fn is_greeting(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    GREETINGS.iter().any(|greeting| *greeting == normalized)
}

/// Picks a canned greeting reply. The seed only varies which of the fixed
/// responses comes back; any seed is valid.
pub fn greeting_response(seed: u64) -> &'static str {
    GREETING_RESPONSES[(seed as usize) % GREETING_RESPONSES.len()]
}

pub fn classify_request(text: &str) -> RequestKind {
    let lowered = text.to_lowercase();
    if lowered.contains("essay") || lowered.contains("write about") {
        return RequestKind::Essay;
    }
    if lowered.contains("story") {
        return RequestKind::Story;
    }
    if lowered.contains("song") {
        return RequestKind::Song;
    }
    RequestKind::General
}

/// Strips the essay-request framing so only the topic is left for the
/// reference lookup ("write essay on Mount Everest" -> "mount everest").
pub fn extract_topic(text: &str) -> String {
    text.to_lowercase()
        .replace("write essay on", "")
        .replace("essay on", "")
        .replace("write about", "")
        .trim()
        .to_string()
}
