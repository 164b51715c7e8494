use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use httpmock::prelude::*;
use serde_json::json;
use tender_session::{
    ChatSession, ChatSessionConfig, HttpSessionPersistence, HttpSessionPersistenceConfig,
    SessionPersistence, TurnOutcome, TurnPhase,
};
use tender_stream::{
    ByteChunkStream, CommandOutcome, CommandRequest, CommandStreamer, HttpStreamTransport,
    HttpStreamTransportConfig, MessageRole, SelectionSpan, StreamError, StreamEvent,
    StreamOutcome, StreamRequest, StreamTransport,
};

fn http_transport(server: &MockServer) -> Arc<HttpStreamTransport> {
    Arc::new(
        HttpStreamTransport::new(HttpStreamTransportConfig {
            api_base: format!("{}/api", server.base_url()),
            api_key: None,
            connect_timeout_ms: 2_000,
        })
        .expect("transport"),
    )
}

fn http_persistence(server: &MockServer) -> Arc<HttpSessionPersistence> {
    Arc::new(
        HttpSessionPersistence::new(HttpSessionPersistenceConfig {
            api_base: format!("{}/api", server.base_url()),
            request_timeout_ms: 2_000,
            max_retries: 0,
            ..HttpSessionPersistenceConfig::default()
        })
        .expect("persistence"),
    )
}

/// Replays a fixed body one byte per chunk with a pause between chunks.
struct TricklingTransport {
    body: Vec<u8>,
    pause: Duration,
    requests: Mutex<Vec<StreamRequest>>,
}

impl TricklingTransport {
    fn new(events: &[StreamEvent], pause: Duration) -> Self {
        let body = events
            .iter()
            .map(|event| event.to_frame().expect("frame"))
            .collect::<String>()
            .into_bytes();
        Self {
            body,
            pause,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StreamTransport for TricklingTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteChunkStream, StreamError> {
        self.requests
            .lock()
            .expect("requests")
            .push(request.clone());
        let pause = self.pause;
        let bytes = self.body.clone();
        Ok(stream::iter(bytes)
            .then(move |byte| async move {
                tokio::time::sleep(pause).await;
                Ok::<_, StreamError>(vec![byte])
            })
            .boxed())
    }
}

#[tokio::test]
async fn integration_multi_turn_chat_persists_each_sealed_exchange() {
    let server = MockServer::start();
    let first = server.mock(|when, then| {
        when.method(POST)
            .path("/api/chat/stream")
            .json_body_includes(json!({"message": "Who is the buyer?"}).to_string());
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(concat!(
                "data: {\"type\":\"content\",\"content\":\"The port \"}\n\n",
                "data: {\"type\":\"content\",\"content\":\"authority.\"}\n\n",
                "data: {\"type\":\"done\",\"confidence\":0.92}\n\n"
            ));
    });
    let second = server.mock(|when, then| {
        when.method(POST)
            .path("/api/chat/stream")
            .json_body_includes(
                json!({
                    "message": "Where is it based?",
                    "history": [
                        {"role": "user", "content": "Who is the buyer?"},
                        {"role": "assistant", "content": "The port authority."}
                    ]
                })
                .to_string(),
            );
        then.status(200)
            .header("content-type", "text/event-stream")
            .body("data: {\"type\":\"content\",\"content\":\"Rotterdam.\"}\n\ndata: [DONE]\n\n");
    });
    let append = server.mock(|when, then| {
        when.method(POST).path("/api/sessions/s-7/messages");
        then.status(204);
    });

    let session = ChatSession::new(
        http_transport(&server),
        ChatSessionConfig {
            target_id: "tender-11".to_string(),
            session_id: Some("s-7".to_string()),
            ..ChatSessionConfig::default()
        },
    )
    .with_persistence(http_persistence(&server));

    let turn = session.send_message("Who is the buyer?").expect("first turn");
    let outcome = session.complete_turn(turn).await.expect("first outcome");
    assert!(matches!(outcome, StreamOutcome::Completed { .. }));

    let turn = session.send_message("Where is it based?").expect("second turn");
    session.complete_turn(turn).await.expect("second outcome");

    first.assert_calls(1);
    second.assert_calls(1);
    append.assert_calls(4);

    let messages = session.messages();
    let transcript = messages
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        transcript,
        vec![
            (MessageRole::User, "Who is the buyer?"),
            (MessageRole::Assistant, "The port authority."),
            (MessageRole::User, "Where is it based?"),
            (MessageRole::Assistant, "Rotterdam."),
        ]
    );
    assert_eq!(messages[1].confidence, Some(0.92));
    assert!(messages.iter().all(|message| !message.is_streaming));
}

#[tokio::test]
async fn integration_http_failure_leaves_retryable_user_message() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/chat/stream");
        then.status(502).body("bad gateway");
    });

    let session = ChatSession::new(
        http_transport(&server),
        ChatSessionConfig {
            target_id: "tender-11".to_string(),
            ..ChatSessionConfig::default()
        },
    );
    let turn = session.send_message("Summarize lot 2").expect("turn");
    let outcome = session.complete_turn(turn).await.expect("outcome");

    assert!(matches!(outcome, StreamOutcome::Failed { .. }));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].role, MessageRole::User);
    assert_eq!(snapshot.last_outcome, Some(TurnOutcome::Failed));
    assert!(snapshot
        .last_error
        .as_deref()
        .is_some_and(|error| error.contains("502")));
}

#[tokio::test]
async fn integration_stop_mid_stream_over_slow_transport() {
    let transport = Arc::new(TricklingTransport::new(
        &[
            StreamEvent::content("Partial answer that keeps going"),
            StreamEvent::Done { confidence: None },
        ],
        Duration::from_millis(2),
    ));
    let session = ChatSession::new(
        transport.clone(),
        ChatSessionConfig {
            target_id: "tender-11".to_string(),
            ..ChatSessionConfig::default()
        },
    );

    let turn = session.send_message("Explain the scoring").expect("turn");
    // The first frame needs dozens of single-byte chunks; stop well before it completes.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(session.stop());
    let outcome = session.complete_turn(turn).await.expect("outcome");

    assert!(matches!(outcome, StreamOutcome::Aborted { .. }));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, TurnPhase::AwaitingUserTurn);
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.last_error, None);
    assert_eq!(transport.requests.lock().expect("requests").len(), 1);
}

#[tokio::test]
async fn integration_command_rewrite_applies_to_unchanged_document() {
    let transport = Arc::new(TricklingTransport::new(
        &[
            StreamEvent::status("Rewriting"),
            StreamEvent::content("Delivery within "),
            StreamEvent::content("10 days."),
            StreamEvent::Done { confidence: None },
        ],
        Duration::from_millis(0),
    ));
    let mut document = "Scope: Deliveries happen eventually, maybe. Price: fixed.".to_string();
    let selection = SelectionSpan::capture(&document, 7, 43).expect("selection");
    assert_eq!(selection.original_text, "Deliveries happen eventually, maybe.");

    let mut streamer = CommandStreamer::new(transport.clone(), "commands/stream");
    let previews = Arc::new(Mutex::new(Vec::new()));
    let sink = previews.clone();
    streamer.on_preview(move |accumulated| sink.lock().expect("previews").push(accumulated.to_string()));

    let request = CommandRequest::new("improve", "tender-11", selection)
        .with_instruction("be concrete");
    let edit = match streamer.execute(&request).await.expect("execute") {
        CommandOutcome::Completed(edit) => edit,
        other => panic!("unexpected outcome: {other:?}"),
    };
    edit.apply_in_place(&mut document).expect("apply");

    assert_eq!(document, "Scope: Delivery within 10 days. Price: fixed.");
    assert_eq!(
        previews.lock().expect("previews").last().map(String::as_str),
        Some("Delivery within 10 days.")
    );
    let sent = transport.requests.lock().expect("requests");
    assert_eq!(sent[0].route, "commands/stream");
    assert_eq!(sent[0].parameters["instruction"], "be concrete");
    assert_eq!(sent[0].parameters["selection"]["end_offset"], 43);
}

#[tokio::test]
async fn integration_session_lifecycle_over_rest() {
    let server = MockServer::start();
    let create = server.mock(|when, then| {
        when.method(POST)
            .path("/api/sessions")
            .json_body(json!({"title": "Harbor works"}));
        then.status(201)
            .json_body(json!({"id": "s-20", "title": "Harbor works"}));
    });
    let delete = server.mock(|when, then| {
        when.method(DELETE).path("/api/sessions/s-20");
        then.status(204);
    });

    let persistence = http_persistence(&server);
    let created = persistence
        .create_session("Harbor works")
        .await
        .expect("create");
    persistence
        .delete_session(&created.id)
        .await
        .expect("delete");

    create.assert_calls(1);
    delete.assert_calls(1);
}
