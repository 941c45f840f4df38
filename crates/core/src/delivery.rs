//! Queue-row state machine for email delivery.
//!
//! Rows move `pending -> processing -> {sent | failed}`. A failed row returns to
//! `processing` when its retry fires, until `retry_count` reaches `max_retries`; the row
//! then stays `failed` and is only revived by an operator retry. `retry_count` is the
//! number of attempts already made before the current one, so a row is attempted at most
//! `max_retries + 1` times.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::domain::email_queue::{EmailKind, EmailQueueEntry, EmailQueueId, QueueStatus, TaskId};
use crate::domain::lead::LeadId;

#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryEngineConfig {
    /// How long a row may sit in `processing` before another worker may reclaim it.
    pub claim_timeout_seconds: i64,
    pub default_max_retries: u32,
    pub retry_backoff_multiplier: u32,
    pub retry_base_delay_seconds: u64,
    pub retry_max_delay_seconds: u64,
    /// Upper bound of the random extra delay, as a fraction of the computed backoff.
    pub retry_jitter_ratio: f64,
}

impl Default for DeliveryEngineConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 600,
            default_max_retries: 3,
            retry_backoff_multiplier: 2,
            retry_base_delay_seconds: 300,
            retry_max_delay_seconds: 3600,
            retry_jitter_ratio: 0.1,
        }
    }
}

impl From<&WorkerConfig> for DeliveryEngineConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            claim_timeout_seconds: i64::try_from(config.claim_timeout_secs).unwrap_or(i64::MAX),
            default_max_retries: config.max_retries,
            retry_base_delay_seconds: config.retry_base_delay_secs,
            retry_max_delay_seconds: config.retry_max_delay_secs,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("invalid queue transition from {from} to {to}: {reason}")]
    InvalidTransition { from: QueueStatus, to: QueueStatus, reason: String },
    #[error("queue entry not found: {0}")]
    EntryNotFound(EmailQueueId),
    #[error("queue entry {0} is already being processed")]
    ClaimConflict(EmailQueueId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    Retry,
    FailTerminal,
}

/// Audit record of one row transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTransition {
    pub id: String,
    pub queue_id: EmailQueueId,
    pub from: QueueStatus,
    pub to: QueueStatus,
    pub reason: String,
    pub context_json: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionResult {
    pub entry: EmailQueueEntry,
    pub transition: QueueTransition,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureOutcome {
    pub entry: EmailQueueEntry,
    pub transition: QueueTransition,
    /// Delay before the next attempt, or `None` once retries are exhausted.
    pub retry_after: Option<StdDuration>,
}

#[derive(Clone, Debug, Default)]
pub struct DeliveryEngine {
    config: DeliveryEngineConfig,
}

impl DeliveryEngine {
    pub fn new() -> Self {
        Self::with_config(DeliveryEngineConfig::default())
    }

    pub fn with_config(config: DeliveryEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DeliveryEngineConfig {
        &self.config
    }

    pub fn create_entry(
        &self,
        lead_id: LeadId,
        kind: EmailKind,
        sequence_step: u32,
        subject: impl Into<String>,
        now: DateTime<Utc>,
    ) -> EmailQueueEntry {
        EmailQueueEntry {
            id: EmailQueueId(Uuid::new_v4().to_string()),
            lead_id,
            kind,
            sequence_step,
            subject: subject.into(),
            body: None,
            html_body: None,
            task_id: None,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries: self.config.default_max_retries,
            last_error: None,
            scheduled_at: now,
            sent_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves a row into `processing` for the attempt about to run.
    pub fn claim(
        &self,
        mut entry: EmailQueueEntry,
        task_id: Option<TaskId>,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DeliveryError> {
        let from = entry.status;
        let reason = match from {
            QueueStatus::Pending => "attempt_started",
            QueueStatus::Failed if entry.retry_count < entry.max_retries => {
                entry.retry_count += 1;
                "retry_started"
            }
            QueueStatus::Processing if self.is_stale(&entry, now) => "stale_claim_recovered",
            QueueStatus::Processing => return Err(DeliveryError::ClaimConflict(entry.id)),
            QueueStatus::Failed => {
                return Err(DeliveryError::InvalidTransition {
                    from,
                    to: QueueStatus::Processing,
                    reason: "retries exhausted".to_string(),
                });
            }
            QueueStatus::Sent => {
                return Err(DeliveryError::InvalidTransition {
                    from,
                    to: QueueStatus::Processing,
                    reason: "email already sent".to_string(),
                });
            }
        };

        entry.status = QueueStatus::Processing;
        if task_id.is_some() {
            entry.task_id = task_id;
        }
        entry.updated_at = now;

        let transition = self.transition(
            &entry,
            from,
            reason,
            serde_json::json!({
                "task_id": entry.task_id.as_ref().map(|id| id.0.clone()),
                "retry_count": entry.retry_count,
                "max_retries": entry.max_retries,
            }),
            now,
        );
        Ok(TransitionResult { entry, transition })
    }

    pub fn mark_sent(
        &self,
        mut entry: EmailQueueEntry,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DeliveryError> {
        self.validate_transition(&entry, QueueStatus::Sent)?;
        let from = entry.status;

        entry.status = QueueStatus::Sent;
        entry.sent_at = Some(now);
        entry.last_error = None;
        entry.updated_at = now;

        let transition = self.transition(
            &entry,
            from,
            "email_sent",
            serde_json::json!({ "retry_count": entry.retry_count }),
            now,
        );
        Ok(TransitionResult { entry, transition })
    }

    pub fn mark_failed(
        &self,
        mut entry: EmailQueueEntry,
        error: impl Into<String>,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, DeliveryError> {
        self.validate_transition(&entry, QueueStatus::Failed)?;
        let from = entry.status;
        let error = error.into();

        entry.status = QueueStatus::Failed;
        entry.failed_at = Some(now);
        entry.updated_at = now;

        let should_retry =
            matches!(policy, RetryPolicy::Retry) && entry.retry_count < entry.max_retries;

        if should_retry {
            let delay = self.jittered(self.backoff_delay(entry.retry_count));
            entry.last_error = Some(error.clone());
            let transition = self.transition(
                &entry,
                from,
                "attempt_failed_retryable",
                serde_json::json!({
                    "retry_count": entry.retry_count,
                    "max_retries": entry.max_retries,
                    "retry_in_seconds": delay.as_secs(),
                    "error": error,
                }),
                now,
            );
            return Ok(FailureOutcome { entry, transition, retry_after: Some(delay) });
        }

        let reason = match policy {
            RetryPolicy::Retry => {
                entry.last_error = Some(format!("Max retries exceeded: {error}"));
                "retries_exhausted"
            }
            RetryPolicy::FailTerminal => {
                entry.retry_count = entry.retry_count.max(entry.max_retries);
                entry.last_error = Some(error.clone());
                "failed_terminal"
            }
        };
        let transition = self.transition(
            &entry,
            from,
            reason,
            serde_json::json!({
                "retry_count": entry.retry_count,
                "max_retries": entry.max_retries,
                "error": error,
            }),
            now,
        );
        Ok(FailureOutcome { entry, transition, retry_after: None })
    }

    /// Operator retry: a failed row goes back to `pending` with a fresh retry budget.
    pub fn requeue(
        &self,
        mut entry: EmailQueueEntry,
        now: DateTime<Utc>,
    ) -> Result<TransitionResult, DeliveryError> {
        self.validate_transition(&entry, QueueStatus::Pending)?;
        let from = entry.status;
        let previous_error = entry.last_error.clone();

        entry.status = QueueStatus::Pending;
        entry.retry_count = 0;
        entry.task_id = None;
        entry.scheduled_at = now;
        entry.updated_at = now;

        let transition = self.transition(
            &entry,
            from,
            "manual_retry",
            serde_json::json!({ "previous_error": previous_error }),
            now,
        );
        Ok(TransitionResult { entry, transition })
    }

    /// `base * multiplier^retry_count`, capped at the configured maximum.
    pub fn backoff_delay(&self, retry_count: u32) -> StdDuration {
        let factor = u64::from(self.config.retry_backoff_multiplier)
            .checked_pow(retry_count)
            .unwrap_or(u64::MAX);
        let seconds = self
            .config
            .retry_base_delay_seconds
            .saturating_mul(factor)
            .min(self.config.retry_max_delay_seconds);
        StdDuration::from_secs(seconds)
    }

    fn jittered(&self, delay: StdDuration) -> StdDuration {
        if self.config.retry_jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.config.retry_jitter_ratio);
        delay + delay.mul_f64(extra)
    }

    /// Rows that need a new task after a restart: every pending row, plus processing rows
    /// whose claim has gone stale.
    pub fn recoverable(
        &self,
        entries: Vec<EmailQueueEntry>,
        now: DateTime<Utc>,
    ) -> Vec<EmailQueueEntry> {
        entries
            .into_iter()
            .filter(|entry| match entry.status {
                QueueStatus::Pending => true,
                QueueStatus::Processing => self.is_stale(entry, now),
                QueueStatus::Sent | QueueStatus::Failed => false,
            })
            .collect()
    }

    /// Rows a live process should dispatch again because no task picked them up in time:
    /// pending and stale processing rows untouched for the claim timeout, and retryable
    /// failures whose backoff elapsed that long ago.
    pub fn orphaned(&self, entries: Vec<EmailQueueEntry>, now: DateTime<Utc>) -> Vec<EmailQueueEntry> {
        entries
            .into_iter()
            .filter(|entry| match entry.status {
                QueueStatus::Pending | QueueStatus::Processing => self.is_stale(entry, now),
                QueueStatus::Failed if entry.is_permanently_failed() => false,
                QueueStatus::Failed => {
                    let backoff = self.backoff_delay(entry.retry_count);
                    let ceiling = backoff + backoff.mul_f64(self.config.retry_jitter_ratio.max(0.0));
                    let due = entry.updated_at
                        + Duration::seconds(i64::try_from(ceiling.as_secs()).unwrap_or(i64::MAX / 2));
                    self.is_stale_since(due, now)
                }
                QueueStatus::Sent => false,
            })
            .collect()
    }

    fn is_stale_since(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        since + Duration::seconds(self.config.claim_timeout_seconds) < now
    }

    fn is_stale(&self, entry: &EmailQueueEntry, now: DateTime<Utc>) -> bool {
        self.is_stale_since(entry.updated_at, now)
    }

    fn validate_transition(
        &self,
        entry: &EmailQueueEntry,
        to: QueueStatus,
    ) -> Result<(), DeliveryError> {
        let valid = match (entry.status, to) {
            (QueueStatus::Pending, QueueStatus::Processing) => true,
            (QueueStatus::Failed, QueueStatus::Processing) => true,
            (QueueStatus::Processing, QueueStatus::Sent) => true,
            (QueueStatus::Processing, QueueStatus::Failed) => true,
            (QueueStatus::Failed, QueueStatus::Pending) => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(DeliveryError::InvalidTransition {
                from: entry.status,
                to,
                reason: format!("cannot transition from {} to {}", entry.status, to),
            })
        }
    }

    fn transition(
        &self,
        entry: &EmailQueueEntry,
        from: QueueStatus,
        reason: &str,
        context: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueTransition {
        QueueTransition {
            id: Uuid::new_v4().to_string(),
            queue_id: entry.id.clone(),
            from,
            to: entry.status,
            reason: reason.to_string(),
            context_json: context.to_string(),
            occurred_at: now,
        }
    }
}
