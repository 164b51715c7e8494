use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageRole` values.
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Supporting reference attached to a generated answer.
pub struct Citation {
    pub source: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub similarity: f64,
}

impl Citation {
    pub fn new(source: impl Into<String>, similarity: f64) -> Self {
        Self {
            source: source.into(),
            snippet: String::new(),
            similarity,
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }
}

/// One decoded protocol event.
///
/// The serialized form is the frame payload: an object tagged by `type`.
///
/// ```
/// use tender_stream::StreamEvent;
///
/// let event: StreamEvent = serde_json::from_str(r#"{"type":"content","content":"Hel"}"#)
///     .expect("content frame");
/// assert_eq!(event, StreamEvent::content("Hel"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        message: String,
    },
    Content {
        content: String,
    },
    Citations {
        #[serde(default)]
        citations: Vec<Citation>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self::Content {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// True for `done` and `error`, after which a stream carries nothing else.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Content { .. } => "content",
            Self::Citations { .. } => "citations",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Encodes the event as one newline-terminated wire frame.
    pub fn to_frame(&self) -> Result<String, StreamError> {
        Ok(format!("data: {}\n", serde_json::to_string(self)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Prior conversation turn forwarded to the generator for context.
pub struct HistoryTurn {
    pub role: MessageRole,
    pub content: String,
}

impl HistoryTurn {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
/// Request descriptor for one streamed generation.
///
/// `route` selects the endpoint and is not part of the JSON body; extra
/// `parameters` are flattened into the body next to the fixed fields.
pub struct StreamRequest {
    #[serde(skip)]
    pub route: String,
    pub target_id: String,
    pub message: String,
    pub history: Vec<HistoryTurn>,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl StreamRequest {
    pub fn new(
        route: impl Into<String>,
        target_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            route: route.into(),
            target_id: target_id.into(),
            message: message.into(),
            history: Vec::new(),
            parameters: Map::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.route.trim().is_empty() {
            return Err(StreamError::InvalidRequest(
                "stream route must not be empty".to_string(),
            ));
        }
        if self.target_id.trim().is_empty() {
            return Err(StreamError::InvalidRequest(
                "target id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `StreamError` values.
pub enum StreamError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stream endpoint returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("invalid stream request: {0}")]
    InvalidRequest(String),
    #[error("no async runtime available to drive the stream: {0}")]
    Runtime(String),
}
