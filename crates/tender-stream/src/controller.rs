//! Single-stream controller with generation-tagged dispatch.
//!
//! Every `start` bumps an epoch. The read loop spawned for that start only
//! dispatches while its epoch is still current, and the check plus the handler
//! calls happen under one dispatch gate, so once `start`, `stop` or `reset`
//! returns no handler of a superseded stream runs again.
//!
//! Handlers run while the gate is held and therefore must not call back into
//! `start`, `stop` or `reset` on the same controller.
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::{
    lock_or_recover, CancellationToken, Citation, FrameDecoder, StreamError, StreamEvent,
    StreamRequest, StreamTransport,
};

pub const CLOSED_WITHOUT_TERMINAL_FRAME: &str = "stream closed before a terminal frame";

type EventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;
type TextDeltaHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
type TextHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
/// How a stream ended.
pub enum StreamOutcome {
    Completed {
        text: String,
        citations: Vec<Citation>,
        confidence: Option<f64>,
    },
    Failed {
        message: String,
    },
    /// Stopped, reset or superseded; never reported through error handlers.
    Aborted {
        partial_text: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Observable controller state.
pub struct StreamSnapshot {
    pub is_streaming: bool,
    pub accumulated_text: String,
    pub accumulated_citations: Vec<Citation>,
    pub confidence: Option<f64>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub outcome: Option<StreamOutcome>,
}

#[derive(Clone, Default)]
struct StreamHandlers {
    event: Vec<EventHandler>,
    text_delta: Vec<TextDeltaHandler>,
    complete: Vec<TextHandler>,
    error: Vec<TextHandler>,
    abort: Vec<TextHandler>,
}

struct ActiveStream {
    epoch: u64,
    cancellation: CancellationToken,
}

#[derive(Default)]
struct DispatchGate {
    epoch: u64,
    active: Option<ActiveStream>,
}

impl DispatchGate {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    fn release(&mut self, epoch: u64) {
        if self.active.as_ref().map(|active| active.epoch) == Some(epoch) {
            self.active = None;
        }
    }
}

#[derive(Default)]
struct ControllerShared {
    gate: Mutex<DispatchGate>,
    state: Mutex<StreamSnapshot>,
}

/// Owns at most one live stream and fans its events out to registered handlers.
pub struct StreamController {
    transport: Arc<dyn StreamTransport>,
    handlers: Arc<StreamHandlers>,
    shared: Arc<ControllerShared>,
}

/// Live context of one started stream.
pub struct StreamHandle {
    epoch: u64,
    request: StreamRequest,
    cancellation: CancellationToken,
    task: JoinHandle<StreamOutcome>,
}

impl StreamHandle {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn request(&self) -> &StreamRequest {
        &self.request
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Aborts this stream only; a newer stream on the same controller is unaffected.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Waits for the read loop to finish.
    pub async fn join(self) -> StreamOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(error) => StreamOutcome::Failed {
                message: format!("stream task failed: {error}"),
            },
        }
    }
}

impl StreamController {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            transport,
            handlers: Arc::new(StreamHandlers::default()),
            shared: Arc::new(ControllerShared::default()),
        }
    }

    /// Registers a handler invoked for every decoded event.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers)
            .event
            .push(Arc::new(handler));
    }

    /// Registers a handler receiving `(delta, accumulated_text)` for each `content` event.
    pub fn on_text_delta<F>(&mut self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers)
            .text_delta
            .push(Arc::new(handler));
    }

    pub fn on_complete<F>(&mut self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers)
            .complete
            .push(Arc::new(handler));
    }

    pub fn on_error<F>(&mut self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers)
            .error
            .push(Arc::new(handler));
    }

    /// Registers a handler receiving the partial text of an explicitly aborted stream.
    pub fn on_abort<F>(&mut self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Arc::make_mut(&mut self.handlers)
            .abort
            .push(Arc::new(handler));
    }

    /// Starts a stream, superseding the active one if any.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: StreamRequest) -> Result<StreamHandle, StreamError> {
        request.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|error| StreamError::Runtime(error.to_string()))?;

        let cancellation = CancellationToken::new();
        let epoch = {
            let mut gate = lock_or_recover(&self.shared.gate);
            if let Some(previous) = gate.active.take() {
                tracing::debug!(epoch = previous.epoch, "superseding active stream");
                previous.cancellation.cancel();
            }
            gate.epoch = gate.epoch.wrapping_add(1);
            gate.active = Some(ActiveStream {
                epoch: gate.epoch,
                cancellation: cancellation.clone(),
            });
            *lock_or_recover(&self.shared.state) = StreamSnapshot {
                is_streaming: true,
                ..StreamSnapshot::default()
            };
            gate.epoch
        };

        tracing::debug!(
            epoch,
            route = %request.route,
            target_id = %request.target_id,
            "starting stream"
        );
        let task = runtime.spawn(run_stream(
            Arc::clone(&self.transport),
            Arc::clone(&self.handlers),
            Arc::clone(&self.shared),
            request.clone(),
            epoch,
            cancellation.clone(),
        ));

        Ok(StreamHandle {
            epoch,
            request,
            cancellation,
            task,
        })
    }

    /// Aborts the active stream. Returns false when nothing was streaming.
    ///
    /// Completion and error handlers are not called; abort handlers receive
    /// the partial text, which also stays readable through [`Self::snapshot`].
    pub fn stop(&self) -> bool {
        let mut gate = lock_or_recover(&self.shared.gate);
        let Some(active) = gate.active.take() else {
            return false;
        };
        active.cancellation.cancel();
        // Fence the loop off: its epoch is no longer current.
        gate.epoch = gate.epoch.wrapping_add(1);

        let partial_text = {
            let mut state = lock_or_recover(&self.shared.state);
            state.is_streaming = false;
            state.status = None;
            state.outcome = Some(StreamOutcome::Aborted {
                partial_text: state.accumulated_text.clone(),
            });
            state.accumulated_text.clone()
        };
        tracing::debug!(epoch = active.epoch, "stream stopped");
        for handler in &self.handlers.abort {
            call_guarded(|| handler(&partial_text));
        }
        true
    }

    /// Stops the active stream and clears all accumulated state.
    pub fn reset(&self) {
        self.stop();
        let _gate = lock_or_recover(&self.shared.gate);
        *lock_or_recover(&self.shared.state) = StreamSnapshot::default();
    }

    pub fn is_streaming(&self) -> bool {
        lock_or_recover(&self.shared.state).is_streaming
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        lock_or_recover(&self.shared.state).clone()
    }
}

#[derive(Default)]
struct RunAccumulator {
    text: String,
    citations: Vec<Citation>,
    confidence: Option<f64>,
}

async fn run_stream(
    transport: Arc<dyn StreamTransport>,
    handlers: Arc<StreamHandlers>,
    shared: Arc<ControllerShared>,
    request: StreamRequest,
    epoch: u64,
    cancellation: CancellationToken,
) -> StreamOutcome {
    let mut run = RunAccumulator::default();

    let opened = tokio::select! {
        biased;
        _ = cancellation.cancelled() => {
            return finish_aborted(&shared, &handlers, epoch, run.text);
        }
        opened = transport.open(&request) => opened,
    };
    let mut body = match opened {
        Ok(body) => body,
        Err(error) => return finish_failed(&shared, &handlers, epoch, run.text, error),
    };

    let mut decoder = FrameDecoder::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return finish_aborted(&shared, &handlers, epoch, run.text);
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                tracing::trace!(epoch, bytes = chunk.len(), "stream chunk received");
                let events = decoder.feed(&chunk);
                if let Some(outcome) = dispatch_events(&shared, &handlers, epoch, &mut run, events)
                {
                    return outcome;
                }
            }
            Some(Err(error)) => {
                return finish_failed(&shared, &handlers, epoch, run.text, error);
            }
            None => {
                let events = decoder.flush();
                if let Some(outcome) = dispatch_events(&shared, &handlers, epoch, &mut run, events)
                {
                    return outcome;
                }
                // Only a terminal frame settles a stream; a bare close is a dropped connection.
                return finish_failed(
                    &shared,
                    &handlers,
                    epoch,
                    run.text,
                    StreamError::Transport(CLOSED_WITHOUT_TERMINAL_FRAME.to_string()),
                );
            }
        }
    }
}

fn dispatch_events(
    shared: &ControllerShared,
    handlers: &StreamHandlers,
    epoch: u64,
    run: &mut RunAccumulator,
    events: Vec<StreamEvent>,
) -> Option<StreamOutcome> {
    if events.is_empty() {
        return None;
    }

    let mut gate = lock_or_recover(&shared.gate);
    if !gate.is_current(epoch) {
        tracing::trace!(epoch, "discarding events from superseded stream");
        return Some(StreamOutcome::Aborted {
            partial_text: std::mem::take(&mut run.text),
        });
    }

    for event in events {
        apply_to_run(run, &event);
        sync_state(shared, run, &event);

        for handler in &handlers.event {
            call_guarded(|| handler(&event));
        }

        match event {
            StreamEvent::Content { content } => {
                for handler in &handlers.text_delta {
                    call_guarded(|| handler(&content, &run.text));
                }
            }
            StreamEvent::Done { .. } => {
                gate.release(epoch);
                for handler in &handlers.complete {
                    call_guarded(|| handler(&run.text));
                }
                return Some(StreamOutcome::Completed {
                    text: std::mem::take(&mut run.text),
                    citations: std::mem::take(&mut run.citations),
                    confidence: run.confidence,
                });
            }
            StreamEvent::Error { message } => {
                gate.release(epoch);
                tracing::warn!(epoch, error = %message, "stream reported an error");
                for handler in &handlers.error {
                    call_guarded(|| handler(&message));
                }
                return Some(StreamOutcome::Failed { message });
            }
            StreamEvent::Status { .. } | StreamEvent::Citations { .. } => {}
        }
    }
    None
}

fn apply_to_run(run: &mut RunAccumulator, event: &StreamEvent) {
    match event {
        StreamEvent::Content { content } => run.text.push_str(content),
        StreamEvent::Citations { citations } => run.citations = citations.clone(),
        StreamEvent::Done { confidence } => {
            if confidence.is_some() {
                run.confidence = *confidence;
            }
        }
        StreamEvent::Status { .. } | StreamEvent::Error { .. } => {}
    }
}

fn sync_state(shared: &ControllerShared, run: &RunAccumulator, event: &StreamEvent) {
    let mut state = lock_or_recover(&shared.state);
    match event {
        StreamEvent::Status { message } => state.status = Some(message.clone()),
        StreamEvent::Content { .. } => {
            state.status = None;
            state.accumulated_text.clone_from(&run.text);
        }
        StreamEvent::Citations { .. } => {
            state.accumulated_citations.clone_from(&run.citations);
        }
        StreamEvent::Done { .. } => {
            state.is_streaming = false;
            state.status = None;
            state.confidence = run.confidence;
            state.outcome = Some(StreamOutcome::Completed {
                text: run.text.clone(),
                citations: run.citations.clone(),
                confidence: run.confidence,
            });
        }
        StreamEvent::Error { message } => {
            state.is_streaming = false;
            state.status = None;
            state.error = Some(message.clone());
            state.outcome = Some(StreamOutcome::Failed {
                message: message.clone(),
            });
        }
    }
}

fn finish_failed(
    shared: &ControllerShared,
    handlers: &StreamHandlers,
    epoch: u64,
    partial_text: String,
    error: StreamError,
) -> StreamOutcome {
    let mut gate = lock_or_recover(&shared.gate);
    if !gate.is_current(epoch) {
        return StreamOutcome::Aborted { partial_text };
    }
    gate.release(epoch);

    let message = error.to_string();
    tracing::warn!(epoch, error = %message, "stream transport failed");
    {
        let mut state = lock_or_recover(&shared.state);
        state.is_streaming = false;
        state.status = None;
        state.error = Some(message.clone());
        state.outcome = Some(StreamOutcome::Failed {
            message: message.clone(),
        });
    }
    for handler in &handlers.error {
        call_guarded(|| handler(&message));
    }
    StreamOutcome::Failed { message }
}

// Reached when the handle itself was cancelled; `stop` has already settled
// state for its own cancellations by moving the epoch on.
fn finish_aborted(
    shared: &ControllerShared,
    handlers: &StreamHandlers,
    epoch: u64,
    partial_text: String,
) -> StreamOutcome {
    let mut gate = lock_or_recover(&shared.gate);
    if gate.is_current(epoch) && gate.active.is_some() {
        gate.release(epoch);
        gate.epoch = gate.epoch.wrapping_add(1);
        {
            let mut state = lock_or_recover(&shared.state);
            state.is_streaming = false;
            state.status = None;
            state.outcome = Some(StreamOutcome::Aborted {
                partial_text: partial_text.clone(),
            });
        }
        tracing::debug!(epoch, "stream cancelled through its handle");
        for handler in &handlers.abort {
            call_guarded(|| handler(&partial_text));
        }
    }
    StreamOutcome::Aborted { partial_text }
}

fn call_guarded(handler: impl FnOnce()) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(handler)).is_err() {
        tracing::warn!("stream handler panicked");
    }
}
