//! Maps decoded stream events onto the in-memory conversation history.
//!
//! A turn appends the user message plus an empty streaming placeholder.
//! Content deltas grow the placeholder; `done` seals it with the stashed
//! citations and confidence; `error` or an abort removes it so the user
//! message is again the last entry and a retry never duplicates a turn.
use thiserror::Error;
use tender_stream::{Citation, HistoryTurn, StreamEvent};

use crate::ConversationMessage;

pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `TurnPhase` values.
pub enum TurnPhase {
    /// No conversation yet.
    Idle,
    /// History present and no response in flight.
    AwaitingUserTurn,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the most recent turn settled.
pub enum TurnOutcome {
    Sealed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What an explicit stop does with the partial answer.
pub enum AbortPolicy {
    #[default]
    Discard,
    KeepInterrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileEffect {
    Ignored,
    Updated,
    Sealed { message_id: u64 },
    Interrupted { message_id: u64 },
    Removed { message_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
/// Result of beginning a turn; `history` excludes the new user message.
pub struct TurnStart {
    pub user_message_id: u64,
    pub placeholder_id: u64,
    pub history: Vec<HistoryTurn>,
    pub discarded_placeholder: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
/// Enumerates supported `ReconcileError` values.
pub enum ReconcileError {
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("cannot replace history while a response is streaming")]
    StreamingInProgress,
}

#[derive(Debug, Default)]
struct PendingSeal {
    citations: Vec<Citation>,
    confidence: Option<f64>,
}

#[derive(Debug)]
pub struct SessionReconciler {
    messages: Vec<ConversationMessage>,
    phase: TurnPhase,
    last_outcome: Option<TurnOutcome>,
    placeholder_id: Option<u64>,
    status_label: Option<String>,
    pending: PendingSeal,
    last_error: Option<String>,
    history_limit: usize,
    next_id: u64,
}

impl Default for SessionReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl SessionReconciler {
    pub fn new(history_limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            phase: TurnPhase::Idle,
            last_outcome: None,
            placeholder_id: None,
            status_label: None,
            pending: PendingSeal::default(),
            last_error: None,
            history_limit,
            next_id: 1,
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn is_streaming(&self) -> bool {
        self.phase == TurnPhase::Streaming
    }

    pub fn last_outcome(&self) -> Option<TurnOutcome> {
        self.last_outcome
    }

    /// Transient progress label shown instead of content while streaming.
    pub fn status_label(&self) -> Option<&str> {
        self.status_label.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn placeholder(&self) -> Option<&ConversationMessage> {
        let id = self.placeholder_id?;
        self.messages.iter().rev().find(|message| message.id == id)
    }

    /// Appends the user message and a streaming placeholder.
    ///
    /// A turn still streaming is discarded first; its user message stays.
    pub fn begin_turn(&mut self, text: &str) -> Result<TurnStart, ReconcileError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ReconcileError::EmptyMessage);
        }

        let discarded_placeholder = if self.is_streaming() {
            tracing::debug!("new turn supersedes an unsealed placeholder");
            self.remove_placeholder().is_some()
        } else {
            false
        };

        let history = self.history_window(self.history_limit);
        let user_message_id = self.allocate_id();
        self.messages
            .push(ConversationMessage::user(user_message_id, text));
        let placeholder_id = self.allocate_id();
        self.messages
            .push(ConversationMessage::assistant_placeholder(placeholder_id));

        self.placeholder_id = Some(placeholder_id);
        self.phase = TurnPhase::Streaming;
        self.last_outcome = None;
        self.last_error = None;
        self.status_label = None;
        self.pending = PendingSeal::default();

        Ok(TurnStart {
            user_message_id,
            placeholder_id,
            history,
            discarded_placeholder,
        })
    }

    pub fn apply(&mut self, event: &StreamEvent) -> ReconcileEffect {
        if !self.is_streaming() {
            tracing::trace!(kind = event.kind(), "ignoring event outside a streaming turn");
            return ReconcileEffect::Ignored;
        }

        match event {
            StreamEvent::Status { message } => {
                self.status_label = Some(message.clone());
                ReconcileEffect::Updated
            }
            StreamEvent::Content { content } => {
                self.status_label = None;
                match self.placeholder_mut() {
                    Some(placeholder) => {
                        placeholder.content.push_str(content);
                        ReconcileEffect::Updated
                    }
                    None => ReconcileEffect::Ignored,
                }
            }
            StreamEvent::Citations { citations } => {
                self.pending.citations = citations.clone();
                ReconcileEffect::Updated
            }
            StreamEvent::Done { confidence } => {
                if confidence.is_some() {
                    self.pending.confidence = *confidence;
                }
                self.seal()
            }
            StreamEvent::Error { message } => self.fail(message),
        }
    }

    /// Removes the placeholder after a stream-level failure.
    pub fn fail(&mut self, message: &str) -> ReconcileEffect {
        if !self.is_streaming() {
            return ReconcileEffect::Ignored;
        }
        let removed = self.remove_placeholder();
        self.last_error = Some(message.to_string());
        self.settle(TurnOutcome::Failed);
        tracing::debug!(error = %message, "turn failed; placeholder removed");
        removed.map_or(ReconcileEffect::Ignored, |message_id| {
            ReconcileEffect::Removed { message_id }
        })
    }

    /// Settles a turn that was stopped on purpose. Never records an error.
    pub fn abort(&mut self, policy: AbortPolicy) -> ReconcileEffect {
        if !self.is_streaming() {
            return ReconcileEffect::Ignored;
        }

        let keep = policy == AbortPolicy::KeepInterrupted
            && self
                .placeholder()
                .is_some_and(|placeholder| !placeholder.content.is_empty());
        let effect = if keep {
            let pending = std::mem::take(&mut self.pending);
            match self.placeholder_mut() {
                Some(placeholder) => {
                    placeholder.is_streaming = false;
                    placeholder.interrupted = true;
                    placeholder.citations = pending.citations;
                    placeholder.confidence = pending.confidence;
                    let message_id = placeholder.id;
                    self.placeholder_id = None;
                    ReconcileEffect::Interrupted { message_id }
                }
                None => ReconcileEffect::Ignored,
            }
        } else {
            self.remove_placeholder()
                .map_or(ReconcileEffect::Ignored, |message_id| {
                    ReconcileEffect::Removed { message_id }
                })
        };
        self.settle(TurnOutcome::Aborted);
        effect
    }

    /// Replaces the history with persisted messages.
    pub fn hydrate(
        &mut self,
        messages: Vec<ConversationMessage>,
    ) -> Result<(), ReconcileError> {
        if self.is_streaming() {
            return Err(ReconcileError::StreamingInProgress);
        }
        self.messages = Vec::with_capacity(messages.len());
        for mut message in messages {
            message.id = self.allocate_id();
            message.is_streaming = false;
            self.messages.push(message);
        }
        self.phase = if self.messages.is_empty() {
            TurnPhase::Idle
        } else {
            TurnPhase::AwaitingUserTurn
        };
        self.last_outcome = None;
        self.last_error = None;
        self.status_label = None;
        Ok(())
    }

    /// Drops the whole conversation.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.phase = TurnPhase::Idle;
        self.last_outcome = None;
        self.placeholder_id = None;
        self.pending = PendingSeal::default();
        self.clear_transient();
    }

    pub fn clear_transient(&mut self) {
        self.status_label = None;
        self.last_error = None;
    }

    /// Trailing settled messages, oldest first, for request context.
    pub fn history_window(&self, limit: usize) -> Vec<HistoryTurn> {
        let settled = self
            .messages
            .iter()
            .filter(|message| !message.is_streaming && !message.content.is_empty())
            .collect::<Vec<_>>();
        let skip = settled.len().saturating_sub(limit);
        settled
            .into_iter()
            .skip(skip)
            .map(ConversationMessage::to_history_turn)
            .collect()
    }

    fn seal(&mut self) -> ReconcileEffect {
        let pending = std::mem::take(&mut self.pending);
        let effect = match self.placeholder_mut() {
            Some(placeholder) => {
                placeholder.is_streaming = false;
                placeholder.citations = pending.citations;
                placeholder.confidence = pending.confidence;
                ReconcileEffect::Sealed {
                    message_id: placeholder.id,
                }
            }
            None => ReconcileEffect::Ignored,
        };
        self.placeholder_id = None;
        self.settle(TurnOutcome::Sealed);
        effect
    }

    fn settle(&mut self, outcome: TurnOutcome) {
        self.phase = if self.messages.is_empty() {
            TurnPhase::Idle
        } else {
            TurnPhase::AwaitingUserTurn
        };
        self.last_outcome = Some(outcome);
        self.status_label = None;
        self.pending = PendingSeal::default();
    }

    fn remove_placeholder(&mut self) -> Option<u64> {
        let id = self.placeholder_id.take()?;
        let index = self.messages.iter().rposition(|message| message.id == id)?;
        self.messages.remove(index);
        Some(id)
    }

    fn placeholder_mut(&mut self) -> Option<&mut ConversationMessage> {
        let id = self.placeholder_id?;
        self.messages.iter_mut().rev().find(|message| message.id == id)
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
