use std::io::{ErrorKind, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use tender_stream::CancellationToken;

/// Writes streamed text to stdout (or any writer) from event handlers.
///
/// The first write failure is logged once and later text is dropped. A
/// `BrokenPipe` additionally resolves [`StreamOutput::reader_gone`] so the
/// caller can stop the stream; handlers cannot stop it themselves.
pub(crate) struct StreamOutput<W> {
    writer: Mutex<W>,
    failed: AtomicBool,
    reader_gone: CancellationToken,
}

impl<W: Write> StreamOutput<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            failed: AtomicBool::new(false),
            reader_gone: CancellationToken::new(),
        }
    }

    pub(crate) fn write(&self, text: &str) {
        if text.is_empty() || self.failed.load(Ordering::Acquire) {
            return;
        }
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = writer
            .write_all(text.as_bytes())
            .and_then(|()| writer.flush());
        let Err(error) = result else {
            return;
        };
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        if error.kind() == ErrorKind::BrokenPipe {
            tracing::warn!(error = %error, "output closed by reader; stopping the response");
            self.reader_gone.cancel();
        } else {
            tracing::warn!(error = %error, "failed to write response text; dropping the rest");
        }
    }

    /// Resolves once the reader has closed the output.
    pub(crate) async fn reader_gone(&self) {
        self.reader_gone.cancelled().await;
    }
}
