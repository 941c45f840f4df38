//! Operator control surface.
//!
//! Every entry point the CLI and server expose goes through [`AgentControl`]. Flag changes
//! are written with `save_control`, which never touches the send counters, and each one
//! leaves a `control` entry in the audit log.

use std::collections::BTreeMap;
use std::sync::Arc;

use cadence_core::chrono::{DateTime, Utc};
use cadence_core::decision::{self, Decision};
use cadence_core::delivery::{DeliveryEngine, DeliveryError};
use cadence_core::domain::action_log::{
    ActionLogQuery, ActionResult, ActionStatistics, ActionType, AgentActionLog,
};
use cadence_core::domain::agent_config::{AgentConfig, AgentSettingsPatch};
use cadence_core::domain::email_queue::{EmailQueueEntry, EmailQueueId, QueueSummary};
use cadence_core::domain::lead::{Lead, LeadId};
use cadence_core::errors::{ApplicationError, DomainError};
use cadence_core::lifecycle::{self, LeadEvent, LeadTransitionError};
use cadence_core::monitor::{self, HealthReport};
use cadence_core::rate_limit::{self, Capacity, Verdict};
use cadence_core::safety;
use cadence_core::schedule::{self, Clock};
use cadence_db::repositories::RepositoryError;
use serde::Serialize;
use thiserror::Error;

use crate::queue::{QueueError, SendJob, TaskQueue};
use crate::runner::{AgentRunner, CycleReport};
use crate::stores::{AgentStores, LeadUpdateError};

pub const MAX_LOG_PAGE: u32 = 500;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("agent config not found; run `cadence migrate` and `cadence agent start`")]
    ConfigMissing,
    #[error("agent is already running (use --force to restart)")]
    AlreadyRunning,
    #[error("agent is not running")]
    NotRunning,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
    #[error("lead not found: {0}")]
    LeadNotFound(LeadId),
    #[error("queue entry not found: {0}")]
    QueueEntryNotFound(EmailQueueId),
    #[error("lead {0} is being updated concurrently; retry the command")]
    LeadContended(LeadId),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Transition(#[from] LeadTransitionError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<LeadUpdateError> for ControlError {
    fn from(error: LeadUpdateError) -> Self {
        match error {
            LeadUpdateError::Repository(error) => Self::Repository(error),
            LeadUpdateError::Transition(error) => Self::Transition(error),
            LeadUpdateError::Contended(id) => Self::LeadContended(id),
        }
    }
}

impl From<ControlError> for ApplicationError {
    fn from(error: ControlError) -> Self {
        match error {
            ControlError::ConfigMissing => Self::ConfigMissing,
            ControlError::AlreadyRunning
            | ControlError::NotRunning
            | ControlError::LeadContended(_) => {
                Self::StateConflict(error.to_string())
            }
            ControlError::InvalidSettings(message) => Self::InvalidInput(message),
            ControlError::LeadNotFound(_) | ControlError::QueueEntryNotFound(_) => {
                Self::NotFound(error.to_string())
            }
            ControlError::Delivery(error) => Self::Domain(DomainError::Delivery(error)),
            ControlError::Transition(error) => Self::Domain(DomainError::LeadTransition(error)),
            ControlError::Repository(error) => Self::Persistence(error.to_string()),
            ControlError::Queue(error) => Self::Integration(error.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentStatus {
    pub state: &'static str,
    pub config: AgentConfig,
    pub capacity: Capacity,
    pub send_gate: Verdict,
    pub within_business_hours: bool,
    pub error_rate_pct: f64,
    pub health: HealthReport,
    pub queue: QueueSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogPage {
    pub entries: Vec<AgentActionLog>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentStatistics {
    pub actions: ActionStatistics,
    pub leads_by_status: BTreeMap<String, u64>,
    pub total_emails_sent: u64,
    pub total_errors: u64,
    pub total_replies_received: u64,
    pub error_rate_pct: f64,
    pub emails_sent_today: u32,
    pub emails_sent_this_hour: u32,
    pub since: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LeadExplanation {
    pub decision: Decision,
    pub contact_check: Verdict,
    pub outstanding_email: bool,
    pub explanation: String,
}

fn state_label(config: &AgentConfig) -> &'static str {
    match (config.is_running, config.is_paused) {
        (true, false) => "running",
        (true, true) => "paused",
        (false, _) => "stopped",
    }
}

pub struct AgentControl {
    stores: AgentStores,
    engine: DeliveryEngine,
    queue: Arc<dyn TaskQueue>,
    runner: Arc<AgentRunner>,
    clock: Arc<dyn Clock>,
}

impl AgentControl {
    pub fn new(
        stores: AgentStores,
        engine: DeliveryEngine,
        queue: Arc<dyn TaskQueue>,
        runner: Arc<AgentRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { stores, engine, queue, runner, clock }
    }

    async fn config(&self) -> Result<AgentConfig, ControlError> {
        self.stores.agent.load().await?.ok_or(ControlError::ConfigMissing)
    }

    async fn audit(&self, command: &str, reason: impl Into<String>) -> Result<(), ControlError> {
        let log = AgentActionLog::new(ActionType::Control, ActionResult::Success, self.clock.now())
            .with_reason(reason)
            .with_metadata("command", command);
        self.stores.actions.append(log).await?;
        tracing::info!(event_name = "agent.control", command);
        Ok(())
    }

    /// Creates the agent record on first use. A running agent is only restarted with `force`.
    pub async fn start(&self, force: bool) -> Result<AgentConfig, ControlError> {
        let now = self.clock.now();
        let mut config = self.stores.agent.ensure(now).await?;
        if config.is_running && !force {
            return Err(ControlError::AlreadyRunning);
        }

        config.is_running = true;
        config.is_paused = false;
        config.agent_started_at = Some(now);
        config.agent_stopped_at = None;
        config.next_agent_run_at = Some(now);
        config.updated_at = now;
        self.stores.agent.save_control(&config).await?;
        self.audit("start", if force { "Agent restarted (forced)" } else { "Agent started" }).await?;
        self.config().await
    }

    pub async fn stop(&self) -> Result<AgentConfig, ControlError> {
        let now = self.clock.now();
        let mut config = self.config().await?;
        if !config.is_running {
            return Err(ControlError::NotRunning);
        }

        config.is_running = false;
        config.agent_stopped_at = Some(now);
        config.next_agent_run_at = None;
        config.updated_at = now;
        self.stores.agent.save_control(&config).await?;
        self.audit("stop", "Agent stopped").await?;
        self.config().await
    }

    pub async fn pause(&self) -> Result<AgentConfig, ControlError> {
        self.set_paused(true).await
    }

    pub async fn resume(&self) -> Result<AgentConfig, ControlError> {
        self.set_paused(false).await
    }

    async fn set_paused(&self, paused: bool) -> Result<AgentConfig, ControlError> {
        let mut config = self.config().await?;
        if !config.is_running {
            return Err(ControlError::NotRunning);
        }
        config.is_paused = paused;
        config.updated_at = self.clock.now();
        self.stores.agent.save_control(&config).await?;

        let (command, reason) =
            if paused { ("pause", "Agent paused") } else { ("resume", "Agent resumed") };
        self.audit(command, reason).await?;
        self.config().await
    }

    /// Runs one cycle immediately. Requires a running agent.
    pub async fn run_now(&self) -> Result<CycleReport, ControlError> {
        let config = self.config().await?;
        if !config.is_running {
            return Err(ControlError::NotRunning);
        }
        self.audit("run_now", "Manual cycle requested").await?;
        Ok(self.runner.run_cycle().await)
    }

    pub async fn status(&self) -> Result<AgentStatus, ControlError> {
        let now = self.clock.now();
        let mut config = self.config().await?;
        let reset = rate_limit::roll_windows(&mut config, now);
        if !reset.is_empty() {
            self.stores.agent.apply_window_reset(&reset).await?;
        }

        let capacity = rate_limit::remaining_capacity(&mut config, now);
        let send_gate = safety::can_send_now(Some(&mut config), now);
        let within_business_hours = schedule::is_business_hours(
            now,
            &config.timezone,
            &config.business_hours_start,
            &config.business_hours_end,
            &config.active_weekdays,
        );

        Ok(AgentStatus {
            state: state_label(&config),
            capacity,
            send_gate,
            within_business_hours,
            error_rate_pct: config.error_rate_pct(),
            health: monitor::evaluate_health(&config, now),
            queue: self.stores.queue.summary().await?,
            config,
        })
    }

    pub async fn update_settings(
        &self,
        patch: AgentSettingsPatch,
    ) -> Result<AgentConfig, ControlError> {
        if patch.is_empty() {
            return Err(ControlError::InvalidSettings("no settings provided".to_string()));
        }
        let mut config = self.config().await?;
        apply_settings(&mut config, &patch)?;
        config.updated_at = self.clock.now();
        self.stores.agent.save_control(&config).await?;

        let changed = serde_json::to_string(&patch).unwrap_or_default();
        self.audit("update_settings", format!("Settings updated: {changed}")).await?;
        self.config().await
    }

    pub async fn logs(&self, mut query: ActionLogQuery) -> Result<LogPage, ControlError> {
        query.limit = query.limit.clamp(1, MAX_LOG_PAGE);
        let total = self.stores.actions.count(&query).await?;
        let entries = self.stores.actions.list(&query).await?;
        Ok(LogPage { entries, total, limit: query.limit, offset: query.offset })
    }

    pub async fn reset_counters(&self) -> Result<AgentConfig, ControlError> {
        self.config().await?;
        self.stores.agent.reset_counters(self.clock.now()).await?;
        self.audit("reset_counters", "Daily and hourly counters reset").await?;
        self.config().await
    }

    pub async fn statistics(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<AgentStatistics, ControlError> {
        let config = self.config().await?;
        Ok(AgentStatistics {
            actions: self.stores.actions.statistics(since).await?,
            leads_by_status: self.stores.leads.count_by_status().await?,
            total_emails_sent: config.total_emails_sent,
            total_errors: config.total_errors,
            total_replies_received: config.total_replies_received,
            error_rate_pct: config.error_rate_pct(),
            emails_sent_today: config.emails_sent_today,
            emails_sent_this_hour: config.emails_sent_this_hour,
            since,
        })
    }

    pub async fn queue_status(&self) -> Result<QueueSummary, ControlError> {
        Ok(self.stores.queue.summary().await?)
    }

    /// Puts a failed row back to `pending` with a fresh retry budget and dispatches it.
    pub async fn retry_failed(&self, id: &EmailQueueId) -> Result<EmailQueueEntry, ControlError> {
        let stored = self
            .stores
            .queue
            .find_by_id(id)
            .await?
            .ok_or_else(|| ControlError::QueueEntryNotFound(id.clone()))?;

        let requeued = self.engine.requeue(stored.clone(), self.clock.now())?;
        if !self.stores.queue.compare_and_save(&stored, requeued.entry.clone()).await? {
            return Err(DeliveryError::ClaimConflict(id.clone()).into());
        }
        self.stores.queue.append_transition(requeued.transition).await?;

        let entry = requeued.entry;
        let task_id = self.queue.enqueue(SendJob { queue_id: entry.id.clone() }, None).await?;
        let mut stamped = entry.clone();
        stamped.task_id = Some(task_id);
        self.stores.queue.compare_and_save(&entry, stamped).await?;

        self.audit("retry_failed", format!("Queue entry {id} requeued")).await?;
        self.stores.queue.find_by_id(id).await?.ok_or_else(|| ControlError::QueueEntryNotFound(id.clone()))
    }

    pub async fn pause_lead(&self, id: &LeadId) -> Result<Lead, ControlError> {
        self.apply_lead_event(id, LeadEvent::Paused).await
    }

    pub async fn resume_lead(&self, id: &LeadId) -> Result<Lead, ControlError> {
        self.apply_lead_event(id, LeadEvent::Resumed).await
    }

    async fn apply_lead_event(&self, id: &LeadId, event: LeadEvent) -> Result<Lead, ControlError> {
        let command = event.name();
        let now = self.clock.now();
        let lead = self
            .stores
            .update_lead(id, |lead| lifecycle::apply(lead, event.clone(), now).map(drop))
            .await?
            .ok_or_else(|| ControlError::LeadNotFound(id.clone()))?;

        let log = AgentActionLog::new(ActionType::Control, ActionResult::Success, self.clock.now())
            .for_lead(&lead)
            .with_reason(format!("Lead {command} by operator"))
            .with_metadata("command", command);
        self.stores.actions.append(log).await?;
        Ok(lead)
    }

    /// What the decision engine would do with this lead right now.
    pub async fn explain_lead(&self, id: &LeadId) -> Result<LeadExplanation, ControlError> {
        let now = self.clock.now();
        let lead = self.lead(id).await?;
        let outstanding = self.stores.queue.outstanding_lead_ids().await?.contains(&lead.id);
        let decision = decision::evaluate_lead(&lead, now);

        Ok(LeadExplanation {
            explanation: decision::explain_decision(&decision),
            contact_check: safety::can_contact_lead(&lead, now),
            outstanding_email: outstanding,
            decision,
        })
    }

    async fn lead(&self, id: &LeadId) -> Result<Lead, ControlError> {
        self.stores.leads.find_by_id(id).await?.ok_or_else(|| ControlError::LeadNotFound(id.clone()))
    }
}

fn apply_settings(config: &mut AgentConfig, patch: &AgentSettingsPatch) -> Result<(), ControlError> {
    let daily = patch.daily_email_limit.unwrap_or(config.daily_email_limit);
    let hourly = patch.hourly_email_limit.unwrap_or(config.hourly_email_limit);
    if daily == 0 || hourly == 0 {
        return Err(ControlError::InvalidSettings("email limits must be at least 1".to_string()));
    }
    if hourly > daily {
        return Err(ControlError::InvalidSettings(format!(
            "hourly limit ({hourly}) cannot exceed daily limit ({daily})"
        )));
    }

    let start = patch.business_hours_start.as_deref().unwrap_or(&config.business_hours_start);
    let end = patch.business_hours_end.as_deref().unwrap_or(&config.business_hours_end);
    let (Some(start_time), Some(end_time)) = (schedule::parse_hhmm(start), schedule::parse_hhmm(end))
    else {
        return Err(ControlError::InvalidSettings(format!(
            "business hours must be HH:MM, got `{start}` to `{end}`"
        )));
    };
    if start_time >= end_time {
        return Err(ControlError::InvalidSettings(format!(
            "business hours start ({start}) must be before end ({end})"
        )));
    }

    let (start, end) = (start.trim().to_string(), end.trim().to_string());
    config.daily_email_limit = daily;
    config.hourly_email_limit = hourly;
    config.business_hours_start = start;
    config.business_hours_end = end;
    if let Some(respect) = patch.respect_business_hours {
        config.respect_business_hours = respect;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cadence_core::decision::DecisionAction;
    use cadence_core::delivery::RetryPolicy;
    use cadence_core::domain::action_log::{ActionLogQuery, ActionType};
    use cadence_core::domain::agent_config::AgentSettingsPatch;
    use cadence_core::domain::email_queue::{EmailKind, EmailQueueId, QueueStatus};
    use cadence_core::domain::lead::{Lead, LeadId, LeadStatus};

    use super::{AgentControl, ControlError};
    use crate::runner::{AgentRunner, CycleStatus, RunnerSettings};
    use crate::stores::AgentStores;
    use crate::testing::{self, RecordingQueue};

    fn control(stores: &AgentStores, queue: Arc<RecordingQueue>) -> AgentControl {
        let runner = AgentRunner::new(
            stores.clone(),
            testing::engine(),
            queue.clone(),
            testing::clock(),
            RunnerSettings::default(),
        );
        AgentControl::new(stores.clone(), testing::engine(), queue, Arc::new(runner), testing::clock())
    }

    #[tokio::test]
    async fn start_stop_and_pause_follow_the_run_flags() {
        let stores = AgentStores::in_memory(None);
        let control = control(&stores, Arc::new(RecordingQueue::default()));

        assert!(matches!(control.stop().await, Err(ControlError::ConfigMissing)));

        let started = control.start(false).await.expect("start");
        assert!(started.is_running);
        assert_eq!(started.agent_started_at, Some(testing::now()));
        assert!(matches!(control.start(false).await, Err(ControlError::AlreadyRunning)));
        assert!(control.start(true).await.is_ok());

        assert!(control.pause().await.expect("pause").is_paused);
        assert_eq!(control.status().await.expect("status").state, "paused");
        assert!(!control.resume().await.expect("resume").is_paused);

        let stopped = control.stop().await.expect("stop");
        assert!(!stopped.is_running);
        assert!(matches!(control.stop().await, Err(ControlError::NotRunning)));
        assert!(matches!(control.pause().await, Err(ControlError::NotRunning)));
        assert_eq!(stopped.next_agent_run_at, None);
        assert!(matches!(control.run_now().await, Err(ControlError::NotRunning)));

        let query = ActionLogQuery { action_type: Some(ActionType::Control), ..ActionLogQuery::default() };
        assert_eq!(stores.actions.count(&query).await.expect("count"), 5);
    }

    #[tokio::test]
    async fn run_now_executes_a_cycle() {
        let stores = AgentStores::in_memory(Some(testing::running_config()));
        stores
            .leads
            .save(Lead::new(LeadId("L-1".to_string()), "ada@acme.io", testing::now()))
            .await
            .expect("save");
        let queue = Arc::new(RecordingQueue::default());

        let report = control(&stores, queue.clone()).run_now().await.expect("run");
        assert_eq!(report.status, CycleStatus::Completed);
        assert_eq!(queue.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn settings_are_validated_before_saving() {
        let stores = AgentStores::in_memory(Some(testing::running_config()));
        let control = control(&stores, Arc::new(RecordingQueue::default()));

        let invalid = [
            AgentSettingsPatch::default(),
            AgentSettingsPatch { daily_email_limit: Some(0), ..AgentSettingsPatch::default() },
            AgentSettingsPatch { hourly_email_limit: Some(80), ..AgentSettingsPatch::default() },
            AgentSettingsPatch {
                business_hours_start: Some("9am".to_string()),
                ..AgentSettingsPatch::default()
            },
            AgentSettingsPatch {
                business_hours_start: Some("18:00".to_string()),
                ..AgentSettingsPatch::default()
            },
        ];
        for patch in invalid {
            assert!(matches!(
                control.update_settings(patch).await,
                Err(ControlError::InvalidSettings(_))
            ));
        }

        let updated = control
            .update_settings(AgentSettingsPatch {
                daily_email_limit: Some(120),
                hourly_email_limit: Some(20),
                business_hours_start: Some("08:30".to_string()),
                respect_business_hours: Some(true),
                ..AgentSettingsPatch::default()
            })
            .await
            .expect("update");
        assert_eq!(updated.daily_email_limit, 120);
        assert_eq!(updated.hourly_email_limit, 20);
        assert_eq!(updated.business_hours_start, "08:30");
        assert_eq!(updated.business_hours_end, "17:00");
        assert!(updated.respect_business_hours);
        assert!(updated.is_running, "settings never change run flags");
    }

    #[tokio::test]
    async fn logs_are_paged_and_filtered() {
        let stores = AgentStores::in_memory(None);
        let control = control(&stores, Arc::new(RecordingQueue::default()));
        control.start(false).await.expect("start");
        control.pause().await.expect("pause");
        control.resume().await.expect("resume");

        let page = control
            .logs(ActionLogQuery { limit: 2, ..ActionLogQuery::default() })
            .await
            .expect("logs");
        assert_eq!(page.total, 3);
        assert_eq!(page.entries.len(), 2);

        let none = control
            .logs(ActionLogQuery { action_type: Some(ActionType::Cycle), ..ActionLogQuery::default() })
            .await
            .expect("logs");
        assert_eq!(none.total, 0);
    }

    #[tokio::test]
    async fn failed_rows_can_be_retried_by_hand() {
        let stores = AgentStores::in_memory(Some(testing::running_config()));
        let queue = Arc::new(RecordingQueue::default());
        let control = control(&stores, queue.clone());
        let engine = testing::engine();

        let entry = engine.create_entry(
            LeadId("L-1".to_string()),
            EmailKind::Initial,
            1,
            "Quick intro",
            testing::now(),
        );
        let claimed = engine.claim(entry, None, testing::now()).expect("claim").entry;
        let failed = engine
            .mark_failed(claimed, "relay rejected", RetryPolicy::FailTerminal, testing::now())
            .expect("fail")
            .entry;
        stores.queue.save(failed.clone()).await.expect("save");

        let retried = control.retry_failed(&failed.id).await.expect("retry");
        assert_eq!(retried.status, QueueStatus::Pending);
        assert_eq!(retried.retry_count, 0);
        assert!(retried.task_id.is_some());
        assert_eq!(queue.jobs().await.len(), 1);

        assert!(matches!(
            control.retry_failed(&failed.id).await,
            Err(ControlError::Delivery(_))
        ));
        assert!(matches!(
            control.retry_failed(&EmailQueueId("missing".to_string())).await,
            Err(ControlError::QueueEntryNotFound(_))
        ));
    }

    #[tokio::test]
    async fn lead_overrides_and_explanations() {
        let stores = AgentStores::in_memory(Some(testing::running_config()));
        let control = control(&stores, Arc::new(RecordingQueue::default()));
        let id = LeadId("L-1".to_string());
        stores.leads.save(Lead::new(id.clone(), "ada@acme.io", testing::now())).await.expect("save");

        let explained = control.explain_lead(&id).await.expect("explain");
        assert_eq!(explained.decision.action, DecisionAction::SendInitial);
        assert!(explained.contact_check.allowed);
        assert!(explained.explanation.contains("Action: send_initial_email"));

        assert!(control.pause_lead(&id).await.expect("pause").agent_paused);
        let explained = control.explain_lead(&id).await.expect("explain");
        assert_eq!(explained.decision.action, DecisionAction::Skip);
        assert!(!explained.contact_check.allowed);

        let resumed = control.resume_lead(&id).await.expect("resume");
        assert!(!resumed.agent_paused);
        assert_eq!(resumed.status, LeadStatus::New);

        assert!(matches!(
            control.pause_lead(&LeadId("nope".to_string())).await,
            Err(ControlError::LeadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn statistics_combine_counters_and_audit_trail() {
        let stores = AgentStores::in_memory(Some(testing::running_config()));
        stores.agent.record_send_attempt(true, testing::now()).await.expect("record");
        stores.agent.record_send_attempt(false, testing::now()).await.expect("record");
        let control = control(&stores, Arc::new(RecordingQueue::default()));

        let stats = control.statistics(None).await.expect("stats");
        assert_eq!(stats.total_emails_sent, 2);
        assert_eq!(stats.total_errors, 1);
        assert!((stats.error_rate_pct - 50.0).abs() < f64::EPSILON);

        let reset = control.reset_counters().await.expect("reset");
        assert_eq!(reset.emails_sent_today, 0);
        assert_eq!(reset.total_emails_sent, 2, "lifetime totals survive a reset");
    }
}
