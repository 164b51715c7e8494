use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tender_stream::{CommandOutcome, CommandRequest, CommandStreamer, SelectionSpan};

use crate::bootstrap::build_stream_transport;
use crate::cli_args::{Cli, RewriteArgs};
use crate::stream_output::StreamOutput;

pub(crate) async fn execute_rewrite_command(cli: &Cli, args: &RewriteArgs) -> Result<()> {
    let document = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let selection = SelectionSpan::capture(&document, args.start, args.end)?;

    let mut request = CommandRequest::new(args.command.clone(), args.target.clone(), selection);
    if let Some(instruction) = &args.instruction {
        request = request.with_instruction(instruction.clone());
    }

    let mut streamer = CommandStreamer::new(build_stream_transport(cli)?, cli.command_route.clone());
    streamer.on_status(|status| eprintln!("[{status}]"));
    let output = Arc::new(StreamOutput::new(std::io::stdout()));
    if args.dry_run {
        let sink = output.clone();
        let printed = Mutex::new(0usize);
        streamer.on_preview(move |accumulated| {
            let mut printed = match printed.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            sink.write(accumulated.get(*printed..).unwrap_or_default());
            *printed = accumulated.len();
        });
    }

    let outcome = tokio::select! {
        outcome = streamer.execute(&request) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            streamer.cancel();
            eprintln!("rewrite interrupted; file left unchanged");
            return Ok(());
        }
        _ = output.reader_gone() => {
            streamer.cancel();
            return Ok(());
        }
    };

    let edit = match outcome {
        CommandOutcome::Completed(edit) => edit,
        CommandOutcome::Aborted { .. } => {
            eprintln!("rewrite interrupted; file left unchanged");
            return Ok(());
        }
    };

    if args.dry_run {
        output.write("\n");
        return Ok(());
    }

    // Re-read so edits made while streaming are detected.
    let mut current = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to re-read {}", args.file.display()))?;
    edit.apply_in_place(&mut current)
        .with_context(|| format!("refusing to rewrite {}", args.file.display()))?;
    std::fs::write(&args.file, current)
        .with_context(|| format!("failed to write {}", args.file.display()))?;
    eprintln!(
        "rewrote bytes {}..{} of {} ({} bytes of replacement)",
        edit.span.start_offset,
        edit.span.end_offset,
        args.file.display(),
        edit.replacement.len()
    );
    Ok(())
}
