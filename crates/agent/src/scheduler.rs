//! Periodic jobs that drive the agent: cycles, inbox polling, health checks, log cleanup,
//! and re-dispatch of queue rows no task is working on.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::chrono::Duration as ChronoDuration;
use cadence_core::config::AgentLoopConfig;
use cadence_core::delivery::DeliveryEngine;
use cadence_core::domain::action_log::{ActionResult, ActionType, AgentActionLog};
use cadence_core::domain::email_queue::{EmailQueueEntry, QueueStatus};
use cadence_core::monitor::{self, HealthReport};
use cadence_core::safety;
use cadence_core::schedule::Clock;
use cadence_db::repositories::RepositoryError;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::queue::{SendJob, TaskQueue};
use crate::replies::{InboxReport, ReplyFetcher, ReplyProcessor};
use crate::runner::{AgentRunner, CycleReport};
use crate::stores::AgentStores;

const RECOVERY_BATCH: u32 = 500;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub inbox_poll: Duration,
    pub health_check: Duration,
    pub cleanup: Duration,
    pub log_retention_days: u32,
}

impl From<&AgentLoopConfig> for SchedulerSettings {
    fn from(config: &AgentLoopConfig) -> Self {
        Self {
            tick: Duration::from_secs(config.tick_secs.max(1)),
            inbox_poll: Duration::from_secs(config.inbox_poll_secs.max(1)),
            health_check: Duration::from_secs(config.health_check_secs.max(1)),
            cleanup: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            log_retention_days: config.log_retention_days,
        }
    }
}

pub struct AgentScheduler {
    stores: AgentStores,
    engine: DeliveryEngine,
    runner: Arc<AgentRunner>,
    replies: Arc<ReplyProcessor>,
    fetcher: Option<Arc<dyn ReplyFetcher>>,
    queue: Arc<dyn TaskQueue>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
}

impl AgentScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: AgentStores,
        engine: DeliveryEngine,
        runner: Arc<AgentRunner>,
        replies: Arc<ReplyProcessor>,
        fetcher: Option<Arc<dyn ReplyFetcher>>,
        queue: Arc<dyn TaskQueue>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self { stores, engine, runner, replies, fetcher, queue, clock, settings }
    }

    /// Runs a cycle when the agent is running. Paused agents still cycle and report
    /// `blocked`, so their activity stays visible to the health check.
    pub async fn scheduled_cycle(&self) -> Result<Option<CycleReport>, RepositoryError> {
        let Some(config) = self.stores.agent.load().await? else {
            return Ok(None);
        };
        if !config.is_running {
            return Ok(None);
        }

        let report = self.runner.run_cycle().await;
        let tick = ChronoDuration::from_std(self.settings.tick).unwrap_or(ChronoDuration::minutes(5));
        let now = self.clock.now();
        self.stores.agent.schedule_next_run(Some(now + tick), now).await?;
        Ok(Some(report))
    }

    pub async fn poll_inbox(&self) -> Option<InboxReport> {
        let fetcher = self.fetcher.as_ref()?;
        match self.replies.poll(fetcher.as_ref()).await {
            Ok(report) => Some(report),
            Err(error) => {
                tracing::warn!(event_name = "scheduler.inbox_poll_failed", error = %error);
                None
            }
        }
    }

    /// Deletes audit entries older than the retention window.
    pub async fn cleanup_logs(&self) -> Result<u64, RepositoryError> {
        let cutoff =
            self.clock.now() - ChronoDuration::days(i64::from(self.settings.log_retention_days));
        let removed = self.stores.actions.prune_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(
                event_name = "scheduler.logs_pruned",
                removed,
                retention_days = self.settings.log_retention_days,
            );
        }
        Ok(removed)
    }

    /// Evaluates agent health and stops the agent when the error rate crosses the
    /// configured threshold.
    pub async fn check_health(&self) -> Result<Option<HealthReport>, RepositoryError> {
        let now = self.clock.now();
        let Some(mut config) = self.stores.agent.load().await? else {
            return Ok(None);
        };
        let report = monitor::evaluate_health(&config, now);
        for alert in &report.alerts {
            tracing::warn!(
                event_name = "scheduler.health_alert",
                severity = alert.severity.as_str(),
                message = %alert.message,
            );
        }

        if report.emergency_stop_required {
            safety::emergency_stop(&mut config, now);
            self.stores.agent.save_control(&config).await?;
            let log = AgentActionLog::new(ActionType::EmergencyStop, ActionResult::Success, now)
                .with_reason(format!(
                    "Error rate {:.1}% above threshold {:.1}%",
                    report.error_rate_pct, config.error_rate_threshold
                ))
                .with_metadata("error_rate_pct", format!("{:.2}", report.error_rate_pct));
            self.stores.actions.append(log).await?;
            tracing::error!(
                event_name = "scheduler.emergency_stop",
                error_rate_pct = report.error_rate_pct,
                threshold_pct = config.error_rate_threshold,
            );
        }
        Ok(Some(report))
    }

    /// Re-dispatches queue rows without a live task. On `startup` every pending row and
    /// stale claim is recovered and retryable failures resume their remaining backoff;
    /// otherwise only rows idle past the claim timeout are picked up.
    pub async fn recover_queue(&self, startup: bool) -> Result<usize, RepositoryError> {
        let now = self.clock.now();
        let rows = self
            .stores
            .queue
            .list_by_status(
                &[QueueStatus::Pending, QueueStatus::Processing, QueueStatus::Failed],
                RECOVERY_BATCH,
            )
            .await?;

        let dispatch: Vec<(EmailQueueEntry, Option<Duration>)> = if startup {
            let retryable: Vec<EmailQueueEntry> = rows
                .iter()
                .filter(|entry| {
                    entry.status == QueueStatus::Failed && !entry.is_permanently_failed()
                })
                .cloned()
                .collect();
            let mut dispatch: Vec<_> = self
                .engine
                .recoverable(rows, now)
                .into_iter()
                .map(|entry| (entry, None))
                .collect();
            dispatch.extend(retryable.into_iter().map(|entry| {
                let delay = self.remaining_backoff(&entry);
                (entry, Some(delay))
            }));
            dispatch
        } else {
            self.engine.orphaned(rows, now).into_iter().map(|entry| (entry, None)).collect()
        };

        let mut dispatched = 0;
        for (entry, delay) in dispatch {
            match self.queue.enqueue(SendJob { queue_id: entry.id.clone() }, delay).await {
                Ok(_) => dispatched += 1,
                Err(error) => {
                    tracing::warn!(
                        event_name = "scheduler.recovery_enqueue_failed",
                        queue_id = %entry.id,
                        error = %error,
                    );
                    break;
                }
            }
        }

        if dispatched > 0 {
            tracing::info!(event_name = "scheduler.queue_recovered", dispatched, startup);
        }
        Ok(dispatched)
    }

    fn remaining_backoff(&self, entry: &EmailQueueEntry) -> Duration {
        let backoff = self.engine.backoff_delay(entry.retry_count);
        let elapsed = (self.clock.now() - entry.updated_at).to_std().unwrap_or_default();
        backoff.saturating_sub(elapsed)
    }

    /// Drives every job until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(error) = self.recover_queue(true).await {
            tracing::error!(event_name = "scheduler.startup_recovery_failed", error = %error);
        }

        let mut cycle = tokio::time::interval(self.settings.tick);
        let mut inbox = tokio::time::interval(self.settings.inbox_poll);
        let mut health = tokio::time::interval(self.settings.health_check);
        let mut cleanup = tokio::time::interval(self.settings.cleanup);
        for timer in [&mut cycle, &mut inbox, &mut health, &mut cleanup] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        tracing::info!(
            event_name = "scheduler.started",
            tick_secs = self.settings.tick.as_secs(),
            inbox_poll_secs = self.settings.inbox_poll.as_secs(),
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = cycle.tick() => {
                    if let Err(error) = self.scheduled_cycle().await {
                        tracing::error!(event_name = "scheduler.cycle_failed", error = %error);
                    }
                }
                _ = inbox.tick() => {
                    self.poll_inbox().await;
                }
                _ = health.tick() => {
                    if let Err(error) = self.check_health().await {
                        tracing::error!(event_name = "scheduler.health_check_failed", error = %error);
                    }
                    if let Err(error) = self.recover_queue(false).await {
                        tracing::error!(event_name = "scheduler.recovery_failed", error = %error);
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(error) = self.cleanup_logs().await {
                        tracing::error!(event_name = "scheduler.cleanup_failed", error = %error);
                    }
                }
            }
        }

        tracing::info!(event_name = "scheduler.stopped");
    }
}
