use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tender_stream::{Citation, HistoryTurn, MessageRole};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One entry of the in-memory conversation history.
pub struct ConversationMessage {
    pub id: u64,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_streaming: bool,
    /// Partial answer kept after an explicit stop.
    #[serde(default)]
    pub interrupted: bool,
}

impl ConversationMessage {
    pub fn user(id: u64, content: impl Into<String>) -> Self {
        Self {
            id,
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            citations: Vec::new(),
            confidence: None,
            is_streaming: false,
            interrupted: false,
        }
    }

    pub fn assistant_placeholder(id: u64) -> Self {
        Self {
            id,
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            citations: Vec::new(),
            confidence: None,
            is_streaming: true,
            interrupted: false,
        }
    }

    pub fn to_history_turn(&self) -> HistoryTurn {
        HistoryTurn::new(self.role, self.content.clone())
    }
}
