//! Chat session driver tying one stream controller to the reconciler.
//!
//! Every submit stops the previous stream before the history is touched, so
//! a late delta can never land in the new placeholder. Controller handlers
//! lock the reconciler while the dispatch gate is held; the lock order is
//! always gate then reconciler.
use std::sync::{Arc, Mutex};

use tender_stream::{
    StreamController, StreamError, StreamEvent, StreamHandle, StreamOutcome, StreamRequest,
    StreamSnapshot, StreamTransport,
};
use thiserror::Error;

use crate::persistence::{PersistedMessage, SessionError, SessionPersistence};
use crate::reconciler::{
    AbortPolicy, ReconcileError, SessionReconciler, TurnOutcome, TurnPhase, DEFAULT_HISTORY_LIMIT,
};
use crate::{lock_or_recover, ConversationMessage};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no persisted session is configured")]
    MissingSession,
}

#[derive(Debug, Clone)]
pub struct ChatSessionConfig {
    pub route: String,
    pub target_id: String,
    pub session_id: Option<String>,
    pub history_limit: usize,
    pub abort_policy: AbortPolicy,
}

impl Default for ChatSessionConfig {
    fn default() -> Self {
        Self {
            route: "chat/stream".to_string(),
            target_id: String::new(),
            session_id: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            abort_policy: AbortPolicy::Discard,
        }
    }
}

/// A submitted turn: the live stream plus the history entries it owns.
pub struct ChatTurn {
    pub handle: StreamHandle,
    pub user_message_id: u64,
    pub assistant_message_id: u64,
}

impl ChatTurn {
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub phase: TurnPhase,
    pub last_outcome: Option<TurnOutcome>,
    pub last_error: Option<String>,
    pub status_label: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub stream: StreamSnapshot,
}

pub struct ChatSession {
    controller: StreamController,
    reconciler: Arc<Mutex<SessionReconciler>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    config: ChatSessionConfig,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn StreamTransport>, config: ChatSessionConfig) -> Self {
        let reconciler = Arc::new(Mutex::new(SessionReconciler::new(config.history_limit)));
        let mut controller = StreamController::new(transport);

        let sink = Arc::clone(&reconciler);
        controller.on_event(move |event| {
            lock_or_recover(&sink).apply(event);
        });
        let sink = Arc::clone(&reconciler);
        controller.on_error(move |message| {
            lock_or_recover(&sink).fail(message);
        });
        let sink = Arc::clone(&reconciler);
        let abort_policy = config.abort_policy;
        controller.on_abort(move |_partial| {
            lock_or_recover(&sink).abort(abort_policy);
        });

        Self {
            controller,
            reconciler,
            persistence: None,
            config,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SessionPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn config(&self) -> &ChatSessionConfig {
        &self.config
    }

    /// Observes decoded events after the history has been updated.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.controller.on_event(handler);
    }

    pub fn on_text_delta<F>(&mut self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.controller.on_text_delta(handler);
    }

    /// Submits a user message and starts streaming the answer.
    pub fn send_message(&self, text: &str) -> Result<ChatTurn, ChatError> {
        if text.trim().is_empty() {
            return Err(ReconcileError::EmptyMessage.into());
        }

        // Settle the running turn as a plain discard; the abort handler then
        // finds nothing left to do.
        {
            let mut reconciler = lock_or_recover(&self.reconciler);
            if reconciler.is_streaming() {
                reconciler.abort(AbortPolicy::Discard);
            }
        }
        self.controller.stop();

        let (turn, message) = {
            let mut reconciler = lock_or_recover(&self.reconciler);
            let turn = reconciler.begin_turn(text)?;
            let message = reconciler
                .messages()
                .iter()
                .find(|message| message.id == turn.user_message_id)
                .map(|message| message.content.clone())
                .unwrap_or_else(|| text.trim().to_string());
            (turn, message)
        };

        let mut request = StreamRequest::new(
            self.config.route.clone(),
            self.config.target_id.clone(),
            message,
        )
        .with_history(turn.history);
        if let Some(session_id) = self.config.session_id.as_deref() {
            request = request.with_parameter("session_id", session_id.into());
        }

        match self.controller.start(request) {
            Ok(handle) => Ok(ChatTurn {
                handle,
                user_message_id: turn.user_message_id,
                assistant_message_id: turn.placeholder_id,
            }),
            Err(error) => {
                lock_or_recover(&self.reconciler).fail(&error.to_string());
                Err(error.into())
            }
        }
    }

    /// Waits for the turn and persists a settled exchange when a session is set.
    pub async fn complete_turn(&self, turn: ChatTurn) -> Result<StreamOutcome, ChatError> {
        let ChatTurn {
            handle,
            user_message_id,
            assistant_message_id,
        } = turn;
        let outcome = handle.join().await;

        let (Some(persistence), Some(session_id)) =
            (self.persistence.as_ref(), self.config.session_id.as_deref())
        else {
            return Ok(outcome);
        };

        let exchange = {
            let reconciler = lock_or_recover(&self.reconciler);
            let find = |id: u64| {
                reconciler
                    .messages()
                    .iter()
                    .find(|message| message.id == id && !message.is_streaming)
                    .map(PersistedMessage::from)
            };
            find(user_message_id).zip(find(assistant_message_id))
        };

        if let Some((user, assistant)) = exchange {
            persistence.append_message(session_id, &user).await?;
            persistence.append_message(session_id, &assistant).await?;
            tracing::debug!(session_id, "turn persisted");
        }
        Ok(outcome)
    }

    /// Aborts the active turn. Returns false when nothing was streaming.
    pub fn stop(&self) -> bool {
        self.controller.stop()
    }

    /// Stops streaming and clears transient status and error state.
    pub fn reset(&self) {
        self.controller.reset();
        lock_or_recover(&self.reconciler).clear_transient();
    }

    /// Stops streaming and drops the whole conversation.
    pub fn clear(&self) {
        self.controller.reset();
        lock_or_recover(&self.reconciler).clear();
    }

    /// Replaces the history with the configured session's persisted messages.
    pub async fn hydrate(&self) -> Result<usize, ChatError> {
        let (Some(persistence), Some(session_id)) =
            (self.persistence.as_ref(), self.config.session_id.as_deref())
        else {
            return Err(ChatError::MissingSession);
        };

        let messages = persistence
            .list_messages(session_id)
            .await?
            .into_iter()
            .map(PersistedMessage::into_conversation_message)
            .collect::<Vec<_>>();
        let count = messages.len();
        lock_or_recover(&self.reconciler).hydrate(messages)?;
        tracing::debug!(session_id, count, "session history loaded");
        Ok(count)
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        lock_or_recover(&self.reconciler).messages().to_vec()
    }

    pub fn status_label(&self) -> Option<String> {
        lock_or_recover(&self.reconciler)
            .status_label()
            .map(str::to_string)
    }

    pub fn is_streaming(&self) -> bool {
        lock_or_recover(&self.reconciler).is_streaming()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let stream = self.controller.snapshot();
        let reconciler = lock_or_recover(&self.reconciler);
        ChatSnapshot {
            phase: reconciler.phase(),
            last_outcome: reconciler.last_outcome(),
            last_error: reconciler.last_error().map(str::to_string),
            status_label: reconciler.status_label().map(str::to_string),
            messages: reconciler.messages().to_vec(),
            stream,
        }
    }
}
