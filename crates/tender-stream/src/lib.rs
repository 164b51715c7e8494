//! Incremental event-stream client for generated tender responses.
//!
//! Decodes `data:` framed events out of arbitrarily chunked response bodies,
//! drives one active stream at a time with generation-tagged dispatch, and
//! offers a single-shot command variant that turns a finished stream into a
//! span replacement.
mod cancel;
pub mod command;
pub mod controller;
pub mod decoder;
mod transport;
mod types;

pub use cancel::CancellationToken;
pub use command::{
    CommandEdit, CommandError, CommandOutcome, CommandRequest, CommandStreamer, SelectionSpan,
};
pub use controller::{StreamController, StreamHandle, StreamOutcome, StreamSnapshot};
pub use decoder::FrameDecoder;
pub use transport::{
    new_request_id, ByteChunkStream, HttpStreamTransport, HttpStreamTransportConfig,
    StreamTransport, REQUEST_ID_HEADER,
};
pub use types::{
    Citation, HistoryTurn, MessageRole, StreamError, StreamEvent, StreamRequest,
};

pub(crate) fn lock_or_recover<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
