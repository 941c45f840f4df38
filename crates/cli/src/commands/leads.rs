use cadence_core::domain::lead::LeadId;
use clap::Subcommand;

use crate::commands::{control_failure, finish, with_agent, CommandResult};

#[derive(Debug, Subcommand)]
pub enum LeadCommand {
    #[command(about = "Show what the agent would do with a lead right now, and why")]
    Explain { id: String },
    #[command(about = "Stop the agent from contacting a lead")]
    Pause { id: String },
    #[command(about = "Let the agent contact a paused lead again")]
    Resume { id: String },
}

pub fn run(command: LeadCommand) -> CommandResult {
    match command {
        LeadCommand::Explain { id } => {
            let outcome = with_agent("leads explain", |_, agent| async move {
                let explanation =
                    agent.control.explain_lead(&LeadId(id)).await.map_err(control_failure)?;
                Ok((explanation.explanation.clone(), explanation))
            });
            finish("leads explain", outcome)
        }
        LeadCommand::Pause { id } => {
            let outcome = with_agent("leads pause", |_, agent| async move {
                let lead = agent.control.pause_lead(&LeadId(id)).await.map_err(control_failure)?;
                Ok((format!("lead {} paused", lead.id), lead))
            });
            finish("leads pause", outcome)
        }
        LeadCommand::Resume { id } => {
            let outcome = with_agent("leads resume", |_, agent| async move {
                let lead = agent.control.resume_lead(&LeadId(id)).await.map_err(control_failure)?;
                Ok((format!("lead {} resumed", lead.id), lead))
            });
            finish("leads resume", outcome)
        }
    }
}
