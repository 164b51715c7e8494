//! Conversation state for streamed tender answers.
//!
//! Reconciles stream events into a message history, drives chat turns over a
//! [`tender_stream::StreamController`] and talks to the durable session store.
pub mod chat;
mod message;
pub mod persistence;
pub mod reconciler;

pub use chat::{ChatError, ChatSession, ChatSessionConfig, ChatSnapshot, ChatTurn};
pub use message::ConversationMessage;
pub use persistence::{
    HttpSessionPersistence, HttpSessionPersistenceConfig, PersistedMessage, RetryPolicy,
    SessionError, SessionPersistence, SessionSummary,
};
pub use reconciler::{
    AbortPolicy, ReconcileEffect, ReconcileError, SessionReconciler, TurnOutcome, TurnPhase,
    TurnStart, DEFAULT_HISTORY_LIMIT,
};

pub(crate) fn lock_or_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
