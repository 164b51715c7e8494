use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tender_session::{AbortPolicy, ChatSession, ChatSessionConfig};
use tender_stream::{StreamEvent, StreamOutcome};

use crate::bootstrap::{build_persistence, build_stream_transport};
use crate::cli_args::{ChatArgs, Cli};
use crate::stream_output::StreamOutput;

pub(crate) async fn execute_chat_command(cli: &Cli, args: &ChatArgs) -> Result<()> {
    let transport = build_stream_transport(cli)?;
    let mut session = ChatSession::new(
        transport,
        ChatSessionConfig {
            route: cli.chat_route.clone(),
            target_id: args.target.clone(),
            session_id: args.session.clone(),
            history_limit: cli.history_limit,
            abort_policy: if args.keep_partial {
                AbortPolicy::KeepInterrupted
            } else {
                AbortPolicy::Discard
            },
        },
    );

    let output = Arc::new(StreamOutput::new(std::io::stdout()));
    let sink = output.clone();
    session.on_text_delta(move |delta, _accumulated| sink.write(delta));
    session.on_event(|event| {
        if let StreamEvent::Status { message } = event {
            eprintln!("[{message}]");
        }
    });

    if let Some(session_id) = args.session.as_deref() {
        session = session.with_persistence(build_persistence(cli)?);
        let loaded = session
            .hydrate()
            .await
            .with_context(|| format!("failed to load session '{session_id}'"))?;
        tracing::debug!(session_id, loaded, "chat history loaded");
    }

    let turn = session.send_message(&args.message)?;
    let outcome = tokio::select! {
        outcome = session.complete_turn(turn) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            session.stop();
            output.write("\n");
            eprintln!("response interrupted");
            return Ok(());
        }
        _ = output.reader_gone() => {
            session.stop();
            return Ok(());
        }
    };

    match outcome {
        StreamOutcome::Completed {
            citations,
            confidence,
            ..
        } => {
            output.write("\n");
            for (index, citation) in citations.iter().enumerate() {
                eprintln!(
                    "[{}] {} ({:.2})",
                    index + 1,
                    citation.source,
                    citation.similarity
                );
            }
            if let Some(confidence) = confidence {
                eprintln!("confidence: {confidence:.2}");
            }
            Ok(())
        }
        StreamOutcome::Failed { message } => {
            output.write("\n");
            bail!("response failed: {message}")
        }
        StreamOutcome::Aborted { .. } => {
            output.write("\n");
            eprintln!("response interrupted");
            Ok(())
        }
    }
}
