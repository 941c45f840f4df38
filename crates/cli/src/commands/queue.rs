use std::time::Duration;

use cadence_core::domain::email_queue::EmailQueueId;
use clap::Subcommand;

use crate::commands::{control_failure, finish, with_agent, CommandResult};

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    #[command(about = "Counts of queue rows by state, including permanently failed ones")]
    Status,
    #[command(about = "Give a failed row a fresh retry budget and dispatch it")]
    Retry {
        #[arg(help = "Queue entry id")]
        id: String,
    },
}

pub fn run(command: QueueCommand) -> CommandResult {
    match command {
        QueueCommand::Status => {
            let outcome = with_agent("queue status", |_, agent| async move {
                let summary = agent.control.queue_status().await.map_err(control_failure)?;
                let message = format!(
                    "{} pending, {} processing, {} failed ({} permanently)",
                    summary.pending, summary.processing, summary.failed, summary.permanently_failed
                );
                Ok((message, summary))
            });
            finish("queue status", outcome)
        }
        QueueCommand::Retry { id } => {
            let outcome = with_agent("queue retry", |config, agent| async move {
                let queue_id = EmailQueueId(id);
                agent.control.retry_failed(&queue_id).await.map_err(control_failure)?;
                agent.pool.wait_idle(Duration::from_secs(config.server.graceful_shutdown_secs)).await;
                agent.pool.shutdown();

                let entry = agent
                    .stores
                    .queue
                    .find_by_id(&queue_id)
                    .await
                    .map_err(|error| ("persistence", error.to_string(), 10u8))?
                    .ok_or_else(|| ("not_found", format!("queue entry not found: {queue_id}"), 8u8))?;
                Ok((format!("queue entry {} requeued, now {}", entry.id, entry.status), entry))
            });
            finish("queue retry", outcome)
        }
    }
}
