use std::fs;
use std::path::PathBuf;

use cadence_agent::replies::StaticReplyFetcher;
use clap::Subcommand;

use crate::commands::{finish, with_agent, CommandResult};

#[derive(Debug, Subcommand)]
pub enum InboxCommand {
    #[command(about = "Process a JSON array of inbound messages exported from a mailbox")]
    Ingest {
        #[arg(help = "Path to the JSON file")]
        path: PathBuf,
    },
}

pub fn run(command: InboxCommand) -> CommandResult {
    match command {
        InboxCommand::Ingest { path } => ingest(path),
    }
}

fn ingest(path: PathBuf) -> CommandResult {
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            return CommandResult::failure(
                "inbox ingest",
                "invalid_request",
                format!("could not read `{}`: {error}", path.display()),
                9,
            );
        }
    };
    let fetcher = match StaticReplyFetcher::from_json(&raw) {
        Ok(fetcher) => fetcher,
        Err(error) => {
            return CommandResult::failure("inbox ingest", "invalid_request", error.to_string(), 9);
        }
    };

    let outcome = with_agent("inbox ingest", |_, agent| async move {
        let report = agent
            .replies
            .poll(&fetcher)
            .await
            .map_err(|error| ("persistence", error.to_string(), 10u8))?;
        let message = format!(
            "{} messages: {} processed, {} duplicates, {} unmatched, {} errors",
            report.fetched, report.processed, report.duplicates, report.unmatched, report.errors
        );
        Ok((message, report))
    });
    finish("inbox ingest", outcome)
}
