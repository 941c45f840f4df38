//! Executes one queued send attempt.
//!
//! The row is claimed with a compare-and-save before anything leaves the process, so a
//! duplicate or late task never sends twice. Counters move only when the relay was actually
//! contacted; generation failures and rows that can no longer be sent consume no quota.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::delivery::{DeliveryEngine, DeliveryError, RetryPolicy};
use cadence_core::domain::email_log::EmailLogEntry;
use cadence_core::domain::email_queue::{EmailKind, EmailQueueEntry, TaskId};
use cadence_core::domain::lead::{Lead, LeadStatus};
use cadence_core::lifecycle::{self, LeadEvent};
use cadence_core::safety;
use cadence_core::schedule::Clock;
use cadence_db::repositories::RepositoryError;
use thiserror::Error;

use crate::llm::LlmClient;
use crate::mail::{MailError, MailTransport, OutboundEmail};
use crate::prompt::{PromptContext, PromptRenderer};
use crate::queue::{JobHandler, JobOutcome, SendJob};
use crate::stores::{AgentStores, LeadUpdateError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    LeadUpdate(#[from] LeadUpdateError),
}

/// What a single attempt did with its row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Sent,
    RetryScheduled { after_secs: u64 },
    Failed { error: String },
    /// Another task holds the row, or it no longer needs sending.
    Skipped { reason: String },
}

struct AttemptFailure {
    error: String,
    policy: RetryPolicy,
}

impl AttemptFailure {
    fn retry(error: impl Into<String>) -> Self {
        Self { error: error.into(), policy: RetryPolicy::Retry }
    }

    fn terminal(error: impl Into<String>) -> Self {
        Self { error: error.into(), policy: RetryPolicy::FailTerminal }
    }
}

pub struct SendExecutor {
    stores: AgentStores,
    engine: DeliveryEngine,
    llm: Arc<dyn LlmClient>,
    mail: Arc<dyn MailTransport>,
    prompts: Arc<PromptRenderer>,
    clock: Arc<dyn Clock>,
    sender_name: Option<String>,
}

impl SendExecutor {
    pub fn new(
        stores: AgentStores,
        engine: DeliveryEngine,
        llm: Arc<dyn LlmClient>,
        mail: Arc<dyn MailTransport>,
        prompts: Arc<PromptRenderer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { stores, engine, llm, mail, prompts, clock, sender_name: None }
    }

    pub fn with_sender_name(mut self, sender_name: Option<String>) -> Self {
        self.sender_name = sender_name;
        self
    }

    pub async fn execute(
        &self,
        job: &SendJob,
        task_id: &TaskId,
    ) -> Result<AttemptOutcome, ExecutorError> {
        let Some(stored) = self.stores.queue.find_by_id(&job.queue_id).await? else {
            return Ok(AttemptOutcome::Skipped { reason: "queue row not found".to_string() });
        };

        let claimed = match self.engine.claim(stored.clone(), Some(task_id.clone()), self.clock.now())
        {
            Ok(claimed) => claimed,
            Err(error @ (DeliveryError::ClaimConflict(_) | DeliveryError::InvalidTransition { .. })) => {
                return Ok(AttemptOutcome::Skipped { reason: error.to_string() });
            }
            Err(error) => return Err(error.into()),
        };
        if !self.stores.queue.compare_and_save(&stored, claimed.entry.clone()).await? {
            return Ok(AttemptOutcome::Skipped { reason: "claimed by another task".to_string() });
        }
        self.stores.queue.append_transition(claimed.transition).await?;
        let mut entry = claimed.entry;

        tracing::info!(
            event_name = "send.attempt_started",
            queue_id = %entry.id,
            lead_id = %entry.lead_id,
            task_id = %task_id.0,
            retry_count = entry.retry_count,
        );

        let Some(lead) = self.stores.leads.find_by_id(&entry.lead_id).await? else {
            return self.fail(entry, None, AttemptFailure::terminal("Lead not found")).await;
        };
        if let Some(reason) = delivery_block(&lead) {
            return self.fail(entry, Some(lead), AttemptFailure::terminal(reason)).await;
        }
        let address = safety::validate_lead_email(&lead.email);
        if !address.allowed {
            return self.fail(entry, Some(lead), AttemptFailure::terminal(address.reason)).await;
        }

        let body = match entry.body.clone() {
            Some(body) => body,
            None => match self.generate_body(&entry, &lead).await {
                Ok(body) => {
                    entry.body = Some(body.clone());
                    body
                }
                Err(failure) => return self.fail(entry, Some(lead), failure).await,
            },
        };

        let email = OutboundEmail {
            to: lead.email.clone(),
            to_name: lead.display_name(),
            subject: entry.subject.clone(),
            text_body: body,
            html_body: entry.html_body.clone(),
        };

        match self.mail.send(&email).await {
            Ok(()) => self.complete(entry, lead).await,
            Err(error) => {
                let failure = match &error {
                    MailError::Transport(_) => {
                        self.stores.agent.record_send_attempt(false, self.clock.now()).await?;
                        AttemptFailure::retry(error.to_string())
                    }
                    MailError::InvalidAddress { .. } | MailError::Build(_) | MailError::Disabled => {
                        AttemptFailure::terminal(error.to_string())
                    }
                };
                self.fail(entry, Some(lead), failure).await
            }
        }
    }

    async fn generate_body(
        &self,
        entry: &EmailQueueEntry,
        lead: &Lead,
    ) -> Result<String, AttemptFailure> {
        let mut context = PromptContext::for_lead(lead, self.sender_name.as_deref());
        context.follow_up_number = entry.sequence_step.saturating_sub(1);

        let prompt = match entry.kind {
            EmailKind::Initial => self.prompts.initial_email(&context),
            EmailKind::FollowUp => self.prompts.follow_up_email(&context),
        }
        .map_err(|error| AttemptFailure::terminal(error.to_string()))?;

        self.llm
            .generate(&prompt)
            .await
            .map_err(|error| AttemptFailure::retry(format!("Email generation failed: {error}")))
    }

    async fn complete(
        &self,
        entry: EmailQueueEntry,
        lead: Lead,
    ) -> Result<AttemptOutcome, ExecutorError> {
        let now = self.clock.now();
        let sent = self.engine.mark_sent(entry, now)?;
        self.stores.queue.save(sent.entry.clone()).await?;
        self.stores.queue.append_transition(sent.transition).await?;
        self.stores.agent.record_send_attempt(true, now).await?;
        self.stores
            .email_log
            .append(EmailLogEntry::sent(
                lead.id.clone(),
                Some(sent.entry.id.clone()),
                &lead.email,
                &sent.entry.subject,
                sent.entry.body.clone(),
                now,
            ))
            .await?;

        // Generation and the relay call can take a while; project onto the stored lead so
        // a reply or manual action recorded meanwhile survives.
        let event = LeadEvent::DeliveryConfirmed {
            kind: sent.entry.kind,
            sequence_step: sent.entry.sequence_step,
            sent_at: now,
        };
        self.stores
            .update_lead(&lead.id, |lead| lifecycle::apply(lead, event.clone(), now).map(drop))
            .await?;

        tracing::info!(
            event_name = "send.delivered",
            queue_id = %sent.entry.id,
            lead_id = %sent.entry.lead_id,
            kind = sent.entry.kind.as_str(),
        );
        Ok(AttemptOutcome::Sent)
    }

    async fn fail(
        &self,
        entry: EmailQueueEntry,
        lead: Option<Lead>,
        failure: AttemptFailure,
    ) -> Result<AttemptOutcome, ExecutorError> {
        let now = self.clock.now();
        let outcome = self.engine.mark_failed(entry, failure.error.clone(), failure.policy, now)?;
        self.stores.queue.save(outcome.entry.clone()).await?;
        self.stores.queue.append_transition(outcome.transition).await?;

        if let Some(lead) = &lead {
            self.stores
                .email_log
                .append(EmailLogEntry::failed(
                    lead.id.clone(),
                    Some(outcome.entry.id.clone()),
                    &lead.email,
                    &outcome.entry.subject,
                    &failure.error,
                    now,
                ))
                .await?;
        }

        if let Some(delay) = outcome.retry_after {
            tracing::warn!(
                event_name = "send.retry_scheduled",
                queue_id = %outcome.entry.id,
                retry_count = outcome.entry.retry_count,
                delay_secs = delay.as_secs(),
                error = %failure.error,
            );
            return Ok(AttemptOutcome::RetryScheduled { after_secs: delay.as_secs() });
        }

        let final_error = outcome.entry.last_error.clone().unwrap_or(failure.error);
        if let Some(lead) = lead {
            let event = LeadEvent::ExecutionFailed { message: final_error.clone() };
            self.stores
                .update_lead(&lead.id, |lead| lifecycle::apply(lead, event.clone(), now).map(drop))
                .await?;
        }
        tracing::error!(
            event_name = "send.failed",
            queue_id = %outcome.entry.id,
            lead_id = %outcome.entry.lead_id,
            error = %final_error,
        );
        Ok(AttemptOutcome::Failed { error: final_error })
    }
}

/// Hard stops for a row that was queued while the lead was still contactable.
fn delivery_block(lead: &Lead) -> Option<String> {
    if lead.status.blocks_contact() || lead.status == LeadStatus::Closed {
        return Some(format!("Lead status is '{}'", lead.status));
    }
    if lead.agent_paused {
        return Some("Lead is manually paused".to_string());
    }
    None
}

#[async_trait]
impl JobHandler for SendExecutor {
    async fn handle(&self, job: &SendJob, task_id: &TaskId) -> JobOutcome {
        match self.execute(job, task_id).await {
            Ok(AttemptOutcome::RetryScheduled { after_secs }) => {
                JobOutcome::RetryAfter(std::time::Duration::from_secs(after_secs))
            }
            Ok(AttemptOutcome::Skipped { reason }) => {
                tracing::debug!(event_name = "send.skipped", queue_id = %job.queue_id, %reason);
                JobOutcome::Done
            }
            Ok(_) => JobOutcome::Done,
            Err(error) => {
                tracing::error!(
                    event_name = "send.executor_error",
                    queue_id = %job.queue_id,
                    task_id = %task_id.0,
                    error = %error,
                );
                JobOutcome::Done
            }
        }
    }
}
