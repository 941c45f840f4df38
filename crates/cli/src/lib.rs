pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::agent::AgentCommand;
use commands::inbox::InboxCommand;
use commands::leads::LeadCommand;
use commands::queue::QueueCommand;

#[derive(Debug, Parser)]
#[command(
    name = "cadence",
    about = "Cadence outreach agent operator CLI",
    long_about = "Operate the Cadence outreach agent: migrations, readiness checks, config inspection, agent control, queue recovery and inbox ingestion.",
    after_help = "Examples:\n  cadence doctor --json\n  cadence agent start\n  cadence agent status\n  cadence queue retry <id>"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the deterministic demo lead dataset")]
    Seed,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, LLM and SMTP readiness, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Control the agent and inspect its state")]
    Agent(AgentCommand),
    #[command(subcommand, about = "Inspect and recover the email queue")]
    Queue(QueueCommand),
    #[command(subcommand, about = "Per-lead controls and decision explanations")]
    Leads(LeadCommand),
    #[command(subcommand, about = "Feed inbound replies to the agent")]
    Inbox(InboxCommand),
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Agent(command) => commands::agent::run(command),
        Command::Queue(command) => commands::queue::run(command),
        Command::Leads(command) => commands::leads::run(command),
        Command::Inbox(command) => commands::inbox::run(command),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
