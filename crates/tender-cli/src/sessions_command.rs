use anyhow::{Context, Result};
use tender_session::SessionPersistence;

use crate::bootstrap::build_persistence;
use crate::cli_args::{Cli, SessionsCommand};

pub(crate) async fn execute_sessions_command(cli: &Cli, command: &SessionsCommand) -> Result<()> {
    let persistence = build_persistence(cli)?;
    match command {
        SessionsCommand::List { json } => {
            let sessions = persistence
                .list_sessions()
                .await
                .context("failed to list sessions")?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
                return Ok(());
            }
            if sessions.is_empty() {
                println!("no sessions");
            }
            for session in sessions {
                println!(
                    "{}\t{}\tmessages={}",
                    session.id, session.title, session.message_count
                );
            }
        }
        SessionsCommand::Create { title } => {
            let session = persistence
                .create_session(title)
                .await
                .context("failed to create session")?;
            println!("{}", session.id);
        }
        SessionsCommand::Delete { id } => {
            persistence
                .delete_session(id)
                .await
                .with_context(|| format!("failed to delete session '{id}'"))?;
            println!("deleted {id}");
        }
    }
    Ok(())
}
