mod bootstrap;
mod chat_command;
mod cli_args;
mod rewrite_command;
mod sessions_command;
mod stream_output;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::init_tracing;
use crate::chat_command::execute_chat_command;
use crate::cli_args::{Cli, CliCommand};
use crate::rewrite_command::execute_rewrite_command;
use crate::sessions_command::execute_sessions_command;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        CliCommand::Chat(args) => execute_chat_command(&cli, args).await,
        CliCommand::Rewrite(args) => execute_rewrite_command(&cli, args).await,
        CliCommand::Sessions(command) => execute_sessions_command(&cli, command).await,
    }
}
