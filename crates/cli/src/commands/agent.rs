use std::time::Duration;

use cadence_core::chrono::{Duration as ChronoDuration, Utc};
use cadence_core::domain::action_log::{ActionLogQuery, ActionType};
use cadence_core::domain::agent_config::AgentSettingsPatch;
use cadence_core::domain::lead::LeadId;
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::commands::{control_failure, finish, with_agent, CommandResult};

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    #[command(about = "Mark the agent running; creates the agent record on first use")]
    Start {
        #[arg(long, help = "Restart even if the agent is already running")]
        force: bool,
    },
    #[command(about = "Stop the agent; queued rows stay in the database")]
    Stop,
    #[command(about = "Pause sending without stopping the agent")]
    Pause,
    #[command(about = "Resume sending after a pause")]
    Resume,
    #[command(about = "Run one cycle now and wait for its sends to settle")]
    RunNow,
    #[command(about = "Show state, remaining capacity, health and queue summary")]
    Status,
    #[command(about = "Change send limits and business hours")]
    Settings(SettingsArgs),
    #[command(about = "Page through the agent action log")]
    Logs(LogsArgs),
    #[command(about = "Reset the daily and hourly send counters")]
    ResetCounters,
    #[command(about = "Aggregate action, lead and counter statistics")]
    Stats {
        #[arg(long, help = "Only count actions from the last N hours")]
        since_hours: Option<u32>,
    },
}

#[derive(Debug, Default, Args)]
pub struct SettingsArgs {
    #[arg(long)]
    pub daily_limit: Option<u32>,
    #[arg(long)]
    pub hourly_limit: Option<u32>,
    #[arg(long, value_name = "HH:MM")]
    pub business_hours_start: Option<String>,
    #[arg(long, value_name = "HH:MM")]
    pub business_hours_end: Option<String>,
    #[arg(long)]
    pub respect_business_hours: Option<bool>,
}

impl From<SettingsArgs> for AgentSettingsPatch {
    fn from(args: SettingsArgs) -> Self {
        Self {
            daily_email_limit: args.daily_limit,
            hourly_email_limit: args.hourly_limit,
            business_hours_start: args.business_hours_start,
            business_hours_end: args.business_hours_end,
            respect_business_hours: args.respect_business_hours,
        }
    }
}

#[derive(Debug, Args)]
pub struct LogsArgs {
    #[arg(long, default_value_t = 50)]
    pub limit: u32,
    #[arg(long, default_value_t = 0)]
    pub offset: u32,
    #[arg(long, help = "Filter by action type, e.g. send_initial_email or error")]
    pub action_type: Option<String>,
    #[arg(long)]
    pub lead: Option<String>,
    #[arg(long)]
    pub run_id: Option<String>,
}

impl Default for LogsArgs {
    fn default() -> Self {
        Self { limit: 50, offset: 0, action_type: None, lead: None, run_id: None }
    }
}

#[derive(Debug, Serialize)]
struct RunNowOutput {
    cycle: cadence_agent::CycleReport,
    settled: bool,
    still_in_flight: usize,
}

pub fn run(command: AgentCommand) -> CommandResult {
    match command {
        AgentCommand::Start { force } => {
            let outcome = with_agent("agent start", |_, agent| async move {
                let config = agent.control.start(force).await.map_err(control_failure)?;
                Ok(("agent started".to_string(), config))
            });
            finish("agent start", outcome)
        }
        AgentCommand::Stop => {
            let outcome = with_agent("agent stop", |_, agent| async move {
                let config = agent.control.stop().await.map_err(control_failure)?;
                Ok(("agent stopped".to_string(), config))
            });
            finish("agent stop", outcome)
        }
        AgentCommand::Pause => {
            let outcome = with_agent("agent pause", |_, agent| async move {
                let config = agent.control.pause().await.map_err(control_failure)?;
                Ok(("agent paused".to_string(), config))
            });
            finish("agent pause", outcome)
        }
        AgentCommand::Resume => {
            let outcome = with_agent("agent resume", |_, agent| async move {
                let config = agent.control.resume().await.map_err(control_failure)?;
                Ok(("agent resumed".to_string(), config))
            });
            finish("agent resume", outcome)
        }
        AgentCommand::RunNow => run_now(),
        AgentCommand::Status => {
            let outcome = with_agent("agent status", |_, agent| async move {
                let status = agent.control.status().await.map_err(control_failure)?;
                let message = format!(
                    "agent {}: {} of {} daily sends left",
                    status.state, status.capacity.daily.remaining, status.config.daily_email_limit
                );
                Ok((message, status))
            });
            finish("agent status", outcome)
        }
        AgentCommand::Settings(args) => {
            let patch = AgentSettingsPatch::from(args);
            let outcome = with_agent("agent settings", |_, agent| async move {
                let config = agent.control.update_settings(patch).await.map_err(control_failure)?;
                Ok(("settings updated".to_string(), config))
            });
            finish("agent settings", outcome)
        }
        AgentCommand::Logs(args) => logs(args),
        AgentCommand::ResetCounters => {
            let outcome = with_agent("agent reset-counters", |_, agent| async move {
                let config = agent.control.reset_counters().await.map_err(control_failure)?;
                Ok(("daily and hourly counters reset".to_string(), config))
            });
            finish("agent reset-counters", outcome)
        }
        AgentCommand::Stats { since_hours } => {
            let since = since_hours.map(|hours| Utc::now() - ChronoDuration::hours(hours.into()));
            let outcome = with_agent("agent stats", |_, agent| async move {
                let stats = agent.control.statistics(since).await.map_err(control_failure)?;
                let message = format!(
                    "{} emails sent, {} errors, {} replies",
                    stats.total_emails_sent, stats.total_errors, stats.total_replies_received
                );
                Ok((message, stats))
            });
            finish("agent stats", outcome)
        }
    }
}

fn run_now() -> CommandResult {
    let outcome = with_agent("agent run-now", |config, agent| async move {
        let cycle = agent.control.run_now().await.map_err(control_failure)?;
        let settled =
            agent.pool.wait_idle(Duration::from_secs(config.server.graceful_shutdown_secs)).await;
        let still_in_flight = agent.pool.in_flight();
        agent.pool.shutdown();

        let mut message =
            format!("cycle {} {}: {} queued", cycle.run_id, cycle.status.as_str(), cycle.emails_queued);
        if !settled {
            message.push_str(&format!(
                "; {still_in_flight} sends still waiting, the server will pick them up"
            ));
        }
        Ok((message, RunNowOutput { cycle, settled, still_in_flight }))
    });
    finish("agent run-now", outcome)
}

fn logs(args: LogsArgs) -> CommandResult {
    let action_type = match args.action_type.as_deref() {
        Some(raw) => match ActionType::parse(raw) {
            Some(action_type) => Some(action_type),
            None => {
                return CommandResult::failure(
                    "agent logs",
                    "invalid_request",
                    format!("unknown action type `{raw}`"),
                    9,
                );
            }
        },
        None => None,
    };
    let query = ActionLogQuery {
        action_type,
        lead_id: args.lead.map(LeadId),
        run_id: args.run_id,
        limit: args.limit,
        offset: args.offset,
    };

    let outcome = with_agent("agent logs", |_, agent| async move {
        let page = agent.control.logs(query).await.map_err(control_failure)?;
        let message = format!("{} of {} log entries", page.entries.len(), page.total);
        Ok((message, page))
    });
    finish("agent logs", outcome)
}
