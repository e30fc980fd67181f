use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::events::{EventPayload, EventWriter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-session conversation state with an explicit open/close lifecycle.
/// The in-memory message log has a single writer (the thread driving the
/// active interaction); the transcript on disk is append-only JSONL.
#[derive(Debug, Clone)]
pub struct SessionContext {
    id: String,
    messages: Vec<ChatMessage>,
    events: EventWriter,
    closed: bool,
}

impl SessionContext {
    pub fn open(events_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let id = Uuid::new_v4().to_string();
        let events = EventWriter::new(events_path.as_ref(), id.clone());
        events.emit("session_started", EventPayload::new())?;
        Ok(Self {
            id,
            messages: Vec::new(),
            events,
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn events(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn record_user(&mut self, content: &str) -> anyhow::Result<()> {
        self.record(ChatMessage::user(content), "user_message")
    }

    pub fn record_assistant(&mut self, content: &str) -> anyhow::Result<()> {
        self.record(ChatMessage::assistant(content), "assistant_message")
    }

    fn record(&mut self, message: ChatMessage, event_type: &str) -> anyhow::Result<()> {
        let mut payload = EventPayload::new();
        payload.insert(
            "content".to_string(),
            Value::String(message.content.clone()),
        );
        self.events.emit(event_type, payload)?;
        self.messages.push(message);
        Ok(())
    }

    pub fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        let mut payload = EventPayload::new();
        payload.insert(
            "message_count".to_string(),
            Value::Number(self.messages.len().into()),
        );
        self.events.emit("session_closed", payload)?;
        self.closed = true;
        Ok(())
    }
}
