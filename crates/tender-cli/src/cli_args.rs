use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "tender",
    about = "Stream generated answers and rewrites for tender documents",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "TENDER_API_BASE",
        default_value = "http://127.0.0.1:8000/api",
        help = "Base URL of the generation API; stream routes are appended to it."
    )]
    pub(crate) api_base: String,

    #[arg(
        long,
        env = "TENDER_API_KEY",
        hide_env_values = true,
        help = "Bearer token sent with every request."
    )]
    pub(crate) api_key: Option<String>,

    #[arg(
        long,
        env = "TENDER_PERSISTENCE_BASE",
        help = "Base URL of the session store. Defaults to --api-base."
    )]
    pub(crate) persistence_base: Option<String>,

    #[arg(
        long,
        env = "TENDER_CONNECT_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Connect timeout for stream requests in milliseconds. Streams themselves have no total timeout."
    )]
    pub(crate) connect_timeout_ms: u64,

    #[arg(
        long,
        env = "TENDER_HISTORY_LIMIT",
        default_value_t = tender_session::DEFAULT_HISTORY_LIMIT,
        value_parser = parse_positive_usize,
        help = "Number of prior messages forwarded as conversation context."
    )]
    pub(crate) history_limit: usize,

    #[arg(
        long,
        default_value = "chat/stream",
        help = "Route of the chat stream endpoint, relative to --api-base."
    )]
    pub(crate) chat_route: String,

    #[arg(
        long,
        default_value = "commands/stream",
        help = "Route of the command stream endpoint, relative to --api-base."
    )]
    pub(crate) command_route: String,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Ask a question and stream the answer to stdout.
    Chat(ChatArgs),
    /// Rewrite a byte range of a file with a streamed command result.
    Rewrite(RewriteArgs),
    /// Manage persisted chat sessions.
    #[command(subcommand)]
    Sessions(SessionsCommand),
}

#[derive(Debug, Args)]
pub(crate) struct ChatArgs {
    #[arg(long, help = "Tender the question is about.")]
    pub(crate) target: String,

    #[arg(
        long,
        help = "Persisted session to load history from and append the exchange to."
    )]
    pub(crate) session: Option<String>,

    #[arg(
        long,
        default_value_t = false,
        help = "Keep a partial answer in the session when the stream is interrupted."
    )]
    pub(crate) keep_partial: bool,

    pub(crate) message: String,
}

#[derive(Debug, Args)]
pub(crate) struct RewriteArgs {
    #[arg(long, help = "Tender the document belongs to.")]
    pub(crate) target: String,

    #[arg(long, help = "File whose selection is rewritten in place.")]
    pub(crate) file: PathBuf,

    #[arg(long, help = "Selection start as a byte offset.")]
    pub(crate) start: usize,

    #[arg(long, help = "Selection end as a byte offset (exclusive).")]
    pub(crate) end: usize,

    #[arg(long, help = "Command name, for example improve or shorten.")]
    pub(crate) command: String,

    #[arg(long, help = "Optional free-form instruction forwarded with the command.")]
    pub(crate) instruction: Option<String>,

    #[arg(
        long,
        default_value_t = false,
        help = "Print the rewritten selection instead of writing the file."
    )]
    pub(crate) dry_run: bool,
}

#[derive(Debug, Subcommand)]
pub(crate) enum SessionsCommand {
    /// List persisted sessions.
    List {
        #[arg(long, default_value_t = false, help = "Print sessions as JSON.")]
        json: bool,
    },
    /// Create a session and print its id.
    Create { title: String },
    /// Delete a session.
    Delete { id: String },
}
