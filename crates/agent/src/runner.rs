//! One autonomous agent cycle.
//!
//! A cycle checks the global gates, sizes the batch to the remaining quota, decides per
//! lead, and hands each send to the task queue as a pending row. Per-lead failures are
//! recorded and the cycle moves on; the cycle itself never returns an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use cadence_core::chrono::{DateTime, Utc};
use cadence_core::config::AgentLoopConfig;
use cadence_core::decision::{self, Decision, DecisionAction, CANDIDATE_BATCH};
use cadence_core::delivery::DeliveryEngine;
use cadence_core::domain::action_log::{ActionResult, ActionType, AgentActionLog};
use cadence_core::domain::email_queue::{EmailKind, EmailQueueEntry};
use cadence_core::domain::lead::{ContentVariant, Lead};
use cadence_core::lifecycle::{self, LeadEvent};
use cadence_core::rate_limit;
use cadence_core::safety;
use cadence_core::schedule::Clock;
use cadence_db::repositories::RepositoryError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::queue::{QueueError, SendJob, TaskQueue};
use crate::stores::{AgentStores, LeadUpdateError};

pub const DEFAULT_CYCLE_CEILING: u32 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    ConfigMissing,
    Disabled,
    Blocked,
    RateLimited,
    Idle,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMissing => "config_missing",
            Self::Disabled => "disabled",
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the cycle got past the running check and counts as agent activity.
    pub fn is_activity(&self) -> bool {
        !matches!(self, Self::ConfigMissing | Self::Disabled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CycleReport {
    pub run_id: String,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub decisions_made: usize,
    pub emails_queued: u32,
    pub leads_closed: u32,
    pub leads_skipped: u32,
    pub errors: u32,
    pub block_reason: Option<String>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl CycleReport {
    fn start(run_id: String, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: CycleStatus::Completed,
            started_at,
            completed_at: None,
            decisions_made: 0,
            emails_queued: 0,
            leads_closed: 0,
            leads_skipped: 0,
            errors: 0,
            block_reason: None,
            error: None,
            execution_time_ms: 0,
        }
    }

    fn finish(&mut self, status: CycleStatus, block_reason: Option<String>) {
        self.status = status;
        self.block_reason = block_reason;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerSettings {
    pub cycle_ceiling: u32,
    pub candidate_batch: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self { cycle_ceiling: DEFAULT_CYCLE_CEILING, candidate_batch: CANDIDATE_BATCH }
    }
}

impl From<&AgentLoopConfig> for RunnerSettings {
    fn from(config: &AgentLoopConfig) -> Self {
        Self { cycle_ceiling: config.hard_cycle_ceiling, candidate_batch: config.candidate_batch }
    }
}

#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    LeadUpdate(#[from] LeadUpdateError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct AgentRunner {
    stores: AgentStores,
    engine: DeliveryEngine,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    settings: RunnerSettings,
}

impl AgentRunner {
    pub fn new(
        stores: AgentStores,
        engine: DeliveryEngine,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        settings: RunnerSettings,
    ) -> Self {
        Self { stores, engine, queue, clock, settings }
    }

    pub async fn run_cycle(&self) -> CycleReport {
        let timer = Instant::now();
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        let mut report = CycleReport::start(run_id, self.clock.now());

        tracing::info!(event_name = "agent.cycle.started", correlation_id = %report.run_id);

        if let Err(error) = self.cycle(&mut report).await {
            tracing::error!(
                event_name = "agent.cycle.failed",
                correlation_id = %report.run_id,
                error = %error,
            );
            report.status = CycleStatus::Failed;
            report.error = Some(error.to_string());
        }

        let completed_at = self.clock.now();
        report.completed_at = Some(completed_at);
        report.execution_time_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);

        if report.status.is_activity() {
            if let Err(error) = self.close_cycle(&report, completed_at).await {
                tracing::error!(
                    event_name = "agent.cycle.bookkeeping_failed",
                    correlation_id = %report.run_id,
                    error = %error,
                );
            }
        }

        tracing::info!(
            event_name = "agent.cycle.finished",
            correlation_id = %report.run_id,
            status = report.status.as_str(),
            emails_queued = report.emails_queued,
            leads_closed = report.leads_closed,
            errors = report.errors,
            execution_time_ms = report.execution_time_ms,
        );
        report
    }

    async fn cycle(&self, report: &mut CycleReport) -> Result<(), CycleError> {
        let now = self.clock.now();
        let Some(mut config) = self.stores.agent.load().await? else {
            report.finish(CycleStatus::ConfigMissing, Some("Agent config not found".to_string()));
            return Ok(());
        };
        if !config.is_running {
            report.finish(CycleStatus::Disabled, Some("Agent is not running".to_string()));
            return Ok(());
        }

        let reset = rate_limit::roll_windows(&mut config, now);
        if !reset.is_empty() {
            self.stores.agent.apply_window_reset(&reset).await?;
        }

        let verdict = safety::can_send_now(Some(&mut config), now);
        if !verdict.allowed {
            report.finish(CycleStatus::Blocked, Some(verdict.reason));
            return Ok(());
        }

        // Every outstanding row counts against the window it will eventually send in.
        let capacity = rate_limit::remaining_capacity(&mut config, now);
        let outstanding = self.stores.queue.count_outstanding().await?;
        let max_sends =
            capacity.sendable().saturating_sub(outstanding).min(self.settings.cycle_ceiling);
        if max_sends == 0 {
            let reason = if capacity.sendable() == 0 {
                "No send capacity left".to_string()
            } else {
                format!("Remaining capacity is held by {outstanding} queued emails")
            };
            report.finish(CycleStatus::RateLimited, Some(reason));
            return Ok(());
        }

        let candidates = self.candidates().await?;
        let batch = decision::make_decisions(&candidates, max_sends as usize, now);
        report.decisions_made = batch.sends.len() + batch.closures.len();

        for deferred in &batch.deferred {
            report.leads_skipped += 1;
            if deferred.action == DecisionAction::Skip {
                self.record(report, deferred, ActionResult::Skipped, config.emails_sent_today)
                    .await;
            } else {
                tracing::debug!(
                    event_name = "agent.decision.wait",
                    correlation_id = %report.run_id,
                    lead_id = %deferred.lead.id,
                    reason = %deferred.reason,
                );
            }
        }

        if report.decisions_made == 0 {
            report.finish(CycleStatus::Idle, None);
            return Ok(());
        }

        for decision in &batch.sends {
            match self.queue_send(report, decision).await {
                Ok(None) => self.skip_changed(report, decision),
                Ok(Some(entry)) => {
                    report.emails_queued += 1;
                    let log = AgentActionLog::new(
                        decision.action.action_type(),
                        ActionResult::Success,
                        self.clock.now(),
                    )
                    .for_lead(&decision.lead)
                    .with_reason(&decision.reason)
                    .with_run(&report.run_id)
                    .with_emails_sent_before(config.emails_sent_today)
                    .with_metadata("queue_id", entry.id.0.clone())
                    .with_metadata("subject", entry.subject.clone());
                    self.audit(report, log).await;
                }
                Err(error) => self.handle_error(report, decision, error, &config).await,
            }
        }

        for closure in &batch.closures {
            match self.close_lead(closure).await {
                Ok(false) => self.skip_changed(report, closure),
                Ok(true) => {
                    report.leads_closed += 1;
                    self.record(report, closure, ActionResult::Success, config.emails_sent_today)
                        .await;
                }
                Err(error) => self.handle_error(report, closure, error, &config).await,
            }
        }

        report.finish(CycleStatus::Completed, None);
        Ok(())
    }

    async fn candidates(&self) -> Result<Vec<Lead>, CycleError> {
        let leads = self.stores.leads.list_candidates(self.settings.candidate_batch).await?;
        let outstanding: HashSet<_> = self.stores.queue.outstanding_lead_ids().await?;
        Ok(leads.into_iter().filter(|lead| !outstanding.contains(&lead.id)).collect())
    }

    /// Persists the lead transition and the pending row, then hands the row to the queue.
    /// Returns `None` when the lead changed since the decision was made.
    async fn queue_send(
        &self,
        report: &CycleReport,
        decision: &Decision,
    ) -> Result<Option<EmailQueueEntry>, CycleError> {
        let now = self.clock.now();
        let mut stale = false;
        let mut queued = None;
        let updated = self
            .stores
            .update_lead(&decision.lead.id, |lead| {
                stale = !still_as_decided(&decision.lead, lead);
                if stale {
                    return Ok(());
                }
                let id = lead.id.clone();
                let variant =
                    *lead.content_variant.get_or_insert_with(|| ContentVariant::assign(&id));
                let base_subject = variant.subject(lead.company.as_deref());
                let (kind, subject, event) = match decision.action {
                    DecisionAction::SendFollowup => (
                        EmailKind::FollowUp,
                        format!("Follow-up: {base_subject}"),
                        LeadEvent::FollowUpQueued,
                    ),
                    _ => (EmailKind::Initial, base_subject, LeadEvent::InitialEmailQueued),
                };
                lifecycle::apply(lead, event, now)?;
                queued = Some((kind, subject));
                Ok(())
            })
            .await?;
        if stale {
            return Ok(None);
        }
        let (Some(lead), Some((kind, subject))) = (updated, queued) else {
            return Err(lead_missing(decision));
        };

        let entry =
            self.engine.create_entry(lead.id.clone(), kind, lead.sequence_step, subject, now);
        self.stores.queue.save(entry.clone()).await?;

        let task_id = self.queue.enqueue(SendJob { queue_id: entry.id.clone() }, None).await?;
        let mut stamped = entry.clone();
        stamped.task_id = Some(task_id.clone());
        // A worker that already claimed the row stamped the same task id itself.
        let stored = self.stores.queue.compare_and_save(&entry, stamped.clone()).await?;

        tracing::info!(
            event_name = "agent.email.queued",
            correlation_id = %report.run_id,
            lead_id = %entry.lead_id,
            queue_id = %entry.id,
            task_id = %task_id.0,
            kind = kind.as_str(),
        );
        Ok(Some(if stored { stamped } else { entry }))
    }

    /// Returns `false` when the lead changed since the decision was made.
    async fn close_lead(&self, decision: &Decision) -> Result<bool, CycleError> {
        let now = self.clock.now();
        let event = LeadEvent::Closed { reason: decision.reason.clone() };
        let mut stale = false;
        let updated = self
            .stores
            .update_lead(&decision.lead.id, |lead| {
                stale = !still_as_decided(&decision.lead, lead);
                if stale {
                    return Ok(());
                }
                lifecycle::apply(lead, event.clone(), now).map(drop)
            })
            .await?;
        if updated.is_none() {
            return Err(lead_missing(decision));
        }
        Ok(!stale)
    }

    fn skip_changed(&self, report: &mut CycleReport, decision: &Decision) {
        report.leads_skipped += 1;
        tracing::info!(
            event_name = "agent.decision.superseded",
            correlation_id = %report.run_id,
            lead_id = %decision.lead.id,
            action = decision.action.as_str(),
        );
    }

    /// Audit writes never abort the cycle; a failed append is counted and logged.
    async fn audit(&self, report: &mut CycleReport, log: AgentActionLog) {
        if let Err(error) = self.stores.actions.append(log).await {
            report.errors += 1;
            tracing::warn!(
                event_name = "agent.audit.append_failed",
                correlation_id = %report.run_id,
                error = %error,
            );
        }
    }

    async fn handle_error(
        &self,
        report: &mut CycleReport,
        decision: &Decision,
        error: CycleError,
        config: &cadence_core::AgentConfig,
    ) {
        report.errors += 1;
        let message = error.to_string();
        tracing::warn!(
            event_name = "agent.decision.failed",
            correlation_id = %report.run_id,
            lead_id = %decision.lead.id,
            action = decision.action.as_str(),
            error = %message,
        );

        let log = AgentActionLog::new(ActionType::Error, ActionResult::Failure, self.clock.now())
            .for_lead(&decision.lead)
            .with_reason(&decision.reason)
            .with_error(&message)
            .with_run(&report.run_id)
            .with_emails_sent_before(config.emails_sent_today)
            .with_metadata("action", decision.action.as_str());
        self.audit(report, log).await;

        let now = self.clock.now();
        let event = LeadEvent::ExecutionFailed { message };
        let recorded = self
            .stores
            .update_lead(&decision.lead.id, |lead| {
                lifecycle::apply(lead, event.clone(), now).map(drop)
            })
            .await;
        if let Err(error) = recorded {
            tracing::warn!(
                event_name = "agent.lead.failure_not_recorded",
                correlation_id = %report.run_id,
                lead_id = %decision.lead.id,
                error = %error,
            );
        }
    }

    async fn record(
        &self,
        report: &mut CycleReport,
        decision: &Decision,
        result: ActionResult,
        emails_sent_before: u32,
    ) {
        let log = AgentActionLog::new(decision.action.action_type(), result, self.clock.now())
            .for_lead(&decision.lead)
            .with_reason(&decision.reason)
            .with_run(&report.run_id)
            .with_emails_sent_before(emails_sent_before);
        self.audit(report, log).await;
    }

    async fn close_cycle(
        &self,
        report: &CycleReport,
        completed_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.stores.agent.record_cycle(completed_at).await?;

        let result = match report.status {
            CycleStatus::Failed => ActionResult::Failure,
            CycleStatus::Completed | CycleStatus::Idle => ActionResult::Success,
            _ => ActionResult::Skipped,
        };
        let mut log = AgentActionLog::new(ActionType::Cycle, result, completed_at)
            .with_run(&report.run_id)
            .with_execution_time_ms(report.execution_time_ms)
            .with_metadata("status", report.status.as_str())
            .with_metadata("decisions_made", report.decisions_made.to_string())
            .with_metadata("emails_queued", report.emails_queued.to_string())
            .with_metadata("leads_closed", report.leads_closed.to_string())
            .with_metadata("leads_skipped", report.leads_skipped.to_string())
            .with_metadata("errors", report.errors.to_string());
        if let Some(reason) = &report.block_reason {
            log = log.with_reason(reason);
        }
        if let Some(error) = &report.error {
            log = log.with_error(error);
        }
        self.stores.actions.append(log).await
    }
}

/// A decision only stands while the lead is in the state it was made from.
fn still_as_decided(decided: &Lead, current: &Lead) -> bool {
    current.status == decided.status && current.agent_enabled && !current.agent_paused
}

fn lead_missing(decision: &Decision) -> CycleError {
    RepositoryError::NotFound { entity: "lead", id: decision.lead.id.0.clone() }.into()
}
