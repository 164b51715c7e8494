//! Single-shot command streaming ("rewrite this selection").
//!
//! A command streams one response for a captured selection and, on
//! completion, yields an edit that replaces exactly that selection. The edit
//! refuses to apply when the document no longer holds the original text at
//! the captured offsets.
use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::{
    StreamController, StreamError, StreamOutcome, StreamRequest, StreamSnapshot, StreamTransport,
};

#[derive(Debug, Error)]
/// Enumerates supported `CommandError` values.
pub enum CommandError {
    #[error(
        "selection {start}..{end} is out of bounds or not on a character boundary (document is {len} bytes)"
    )]
    InvalidSelection { start: usize, end: usize, len: usize },
    #[error("document changed since selection {start}..{end} was captured; edit not applied")]
    StaleSelection { start: usize, end: usize },
    #[error("command stream failed: {0}")]
    Stream(String),
    #[error(transparent)]
    Start(#[from] StreamError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Byte range of a document plus the text it held when captured.
pub struct SelectionSpan {
    pub start_offset: usize,
    pub end_offset: usize,
    pub original_text: String,
}

impl SelectionSpan {
    pub fn capture(document: &str, start: usize, end: usize) -> Result<Self, CommandError> {
        let invalid = || CommandError::InvalidSelection {
            start,
            end,
            len: document.len(),
        };
        if start > end {
            return Err(invalid());
        }
        let text = document.get(start..end).ok_or_else(invalid)?;
        Ok(Self {
            start_offset: start,
            end_offset: end,
            original_text: text.to_string(),
        })
    }

    /// True when `document` still holds the captured text at the captured offsets.
    pub fn matches(&self, document: &str) -> bool {
        document.get(self.start_offset..self.end_offset) == Some(self.original_text.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Public struct `CommandRequest` describing one parameterized generation.
pub struct CommandRequest {
    pub command: String,
    pub target_id: String,
    pub selection: SelectionSpan,
    pub instruction: Option<String>,
    pub parameters: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(
        command: impl Into<String>,
        target_id: impl Into<String>,
        selection: SelectionSpan,
    ) -> Self {
        Self {
            command: command.into(),
            target_id: target_id.into(),
            selection,
            instruction: None,
            parameters: Map::new(),
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    fn to_stream_request(&self, route: &str) -> StreamRequest {
        let mut request = StreamRequest::new(
            route,
            self.target_id.clone(),
            self.selection.original_text.clone(),
        );
        request.parameters = self.parameters.clone();
        request
            .parameters
            .insert("command".to_string(), json!(self.command));
        request.parameters.insert(
            "selection".to_string(),
            json!({
                "start_offset": self.selection.start_offset,
                "end_offset": self.selection.end_offset,
            }),
        );
        if let Some(instruction) = &self.instruction {
            request
                .parameters
                .insert("instruction".to_string(), json!(instruction));
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Replacement of a captured selection with generated text.
pub struct CommandEdit {
    pub span: SelectionSpan,
    pub replacement: String,
}

impl CommandEdit {
    /// Returns `document` with the selection replaced.
    pub fn apply(&self, document: &str) -> Result<String, CommandError> {
        self.ensure_current(document)?;
        let mut edited = String::with_capacity(
            document.len() - self.span.original_text.len() + self.replacement.len(),
        );
        edited.push_str(&document[..self.span.start_offset]);
        edited.push_str(&self.replacement);
        edited.push_str(&document[self.span.end_offset..]);
        Ok(edited)
    }

    pub fn apply_in_place(&self, document: &mut String) -> Result<(), CommandError> {
        self.ensure_current(document)?;
        document.replace_range(
            self.span.start_offset..self.span.end_offset,
            &self.replacement,
        );
        Ok(())
    }

    fn ensure_current(&self, document: &str) -> Result<(), CommandError> {
        if self.span.matches(document) {
            return Ok(());
        }
        tracing::warn!(
            start = self.span.start_offset,
            end = self.span.end_offset,
            "rejecting command edit against a changed document"
        );
        Err(CommandError::StaleSelection {
            start: self.span.start_offset,
            end: self.span.end_offset,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Completed(CommandEdit),
    Aborted { partial_text: String },
}

/// Runs parameterized commands one at a time over the shared decoder and controller.
pub struct CommandStreamer {
    controller: StreamController,
    route: String,
}

impl CommandStreamer {
    pub fn new(transport: Arc<dyn StreamTransport>, route: impl Into<String>) -> Self {
        Self {
            controller: StreamController::new(transport),
            route: route.into(),
        }
    }

    /// Registers a live preview receiving the accumulated text after each delta.
    pub fn on_preview<F>(&mut self, preview: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.controller
            .on_text_delta(move |_delta, accumulated| preview(accumulated));
    }

    pub fn on_status<F>(&mut self, status: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.controller.on_event(move |event| {
            if let crate::StreamEvent::Status { message } = event {
                status(message);
            }
        });
    }

    /// Streams the command and returns the edit for its selection.
    ///
    /// A new `execute` supersedes one still in flight, which then resolves
    /// as [`CommandOutcome::Aborted`].
    pub async fn execute(&self, request: &CommandRequest) -> Result<CommandOutcome, CommandError> {
        let handle = self
            .controller
            .start(request.to_stream_request(&self.route))?;
        tracing::debug!(
            command = %request.command,
            epoch = handle.epoch(),
            selection_bytes = request.selection.original_text.len(),
            "command stream started"
        );

        match handle.join().await {
            StreamOutcome::Completed { text, .. } => Ok(CommandOutcome::Completed(CommandEdit {
                span: request.selection.clone(),
                replacement: text,
            })),
            StreamOutcome::Failed { message } => Err(CommandError::Stream(message)),
            StreamOutcome::Aborted { partial_text } => Ok(CommandOutcome::Aborted { partial_text }),
        }
    }

    /// Aborts the in-flight command, if any.
    pub fn cancel(&self) -> bool {
        self.controller.stop()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.controller.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use futures_util::stream::{self, StreamExt};
    use serde_json::json;

    use super::{CommandEdit, CommandError, CommandOutcome, CommandRequest, CommandStreamer, SelectionSpan};
    use crate::{ByteChunkStream, StreamError, StreamEvent, StreamRequest, StreamTransport};

    struct CannedTransport {
        body: String,
        requests: Mutex<Vec<StreamRequest>>,
    }

    #[async_trait]
    impl StreamTransport for CannedTransport {
        async fn open(&self, request: &StreamRequest) -> Result<ByteChunkStream, StreamError> {
            self.requests.lock().expect("requests").push(request.clone());
            // Three-byte chunks exercise frame reassembly.
            let chunks = self
                .body
                .as_bytes()
                .chunks(3)
                .map(|chunk| Ok(chunk.to_vec()))
                .collect::<Vec<_>>();
            Ok(stream::iter(chunks).boxed())
        }
    }

    fn canned(events: &[StreamEvent]) -> Arc<CannedTransport> {
        Arc::new(CannedTransport {
            body: events
                .iter()
                .map(|event| event.to_frame().expect("frame"))
                .collect(),
            requests: Mutex::new(Vec::new()),
        })
    }

    const DOCUMENT: &str = "Scope: the supplier shall deliver stuff quickly. Price: fixed.";

    fn selection() -> SelectionSpan {
        let start = DOCUMENT.find("the supplier").expect("start");
        let end = DOCUMENT.find(" Price").expect("end");
        SelectionSpan::capture(DOCUMENT, start, end).expect("selection")
    }

    #[test]
    fn unit_capture_validates_bounds_and_char_boundaries() {
        assert!(SelectionSpan::capture("abc", 2, 1).is_err());
        assert!(SelectionSpan::capture("abc", 0, 4).is_err());
        assert!(matches!(
            SelectionSpan::capture("€uro", 1, 3),
            Err(CommandError::InvalidSelection { len: 6, .. })
        ));
        let span = SelectionSpan::capture("€uro", 3, 6).expect("boundary aligned");
        assert_eq!(span.original_text, "uro");
    }

    #[test]
    fn unit_edit_replaces_only_the_captured_span() {
        let edit = CommandEdit {
            span: selection(),
            replacement: "the supplier shall deliver all goods within 30 days.".to_string(),
        };
        assert_eq!(
            edit.apply(DOCUMENT).expect("apply"),
            "Scope: the supplier shall deliver all goods within 30 days. Price: fixed."
        );

        let mut document = DOCUMENT.to_string();
        edit.apply_in_place(&mut document).expect("apply in place");
        assert_eq!(document, edit.apply(DOCUMENT).expect("apply"));
    }

    #[test]
    fn regression_edit_is_rejected_when_document_changed_under_the_span() {
        let edit = CommandEdit {
            span: selection(),
            replacement: "rewritten".to_string(),
        };

        let shifted = format!("Draft 2. {DOCUMENT}");
        assert!(matches!(
            edit.apply(&shifted),
            Err(CommandError::StaleSelection { .. })
        ));

        let mut truncated = "Scope: short".to_string();
        assert!(edit.apply_in_place(&mut truncated).is_err());
        assert_eq!(truncated, "Scope: short");
    }

    #[tokio::test]
    async fn functional_execute_streams_command_and_returns_edit() {
        let transport = canned(&[
            StreamEvent::status("Rewriting"),
            StreamEvent::content("the supplier shall deliver "),
            StreamEvent::content("within 30 days."),
            StreamEvent::Done { confidence: Some(0.7) },
        ]);
        let previews = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let mut streamer = CommandStreamer::new(transport.clone(), "commands/rewrite");
        let sink = Arc::clone(&previews);
        streamer.on_preview(move |text| sink.lock().expect("previews").push(text.to_string()));
        let sink = Arc::clone(&statuses);
        streamer.on_status(move |status| sink.lock().expect("statuses").push(status.to_string()));

        let request = CommandRequest::new("rewrite", "tender-9", selection())
            .with_instruction("make it precise");
        let outcome = streamer.execute(&request).await.expect("execute");

        let edit = match outcome {
            CommandOutcome::Completed(edit) => edit,
            other => panic!("expected completed command, got {other:?}"),
        };
        assert_eq!(
            edit.apply(DOCUMENT).expect("apply"),
            "Scope: the supplier shall deliver within 30 days. Price: fixed."
        );
        assert_eq!(
            previews.lock().expect("previews").last().map(String::as_str),
            Some("the supplier shall deliver within 30 days.")
        );
        assert_eq!(*statuses.lock().expect("statuses"), vec!["Rewriting"]);

        let requests = transport.requests.lock().expect("requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].route, "commands/rewrite");
        assert_eq!(requests[0].message, "the supplier shall deliver stuff quickly.");
        assert_eq!(requests[0].parameters["command"], json!("rewrite"));
        assert_eq!(requests[0].parameters["instruction"], json!("make it precise"));
        assert_eq!(
            requests[0].parameters["selection"],
            json!({"start_offset": 7, "end_offset": 48})
        );
    }

    #[tokio::test]
    async fn functional_execute_surfaces_remote_error() {
        let transport = canned(&[
            StreamEvent::content("half"),
            StreamEvent::error("quota exceeded"),
        ]);
        let streamer = CommandStreamer::new(transport, "commands/rewrite");
        let error = streamer
            .execute(&CommandRequest::new("rewrite", "tender-9", selection()))
            .await
            .expect_err("remote error");
        assert!(matches!(error, CommandError::Stream(message) if message == "quota exceeded"));
        assert_eq!(streamer.snapshot().error.as_deref(), Some("quota exceeded"));
    }
}
