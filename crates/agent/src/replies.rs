//! Inbound reply processing.
//!
//! Messages come from a [`ReplyFetcher`]; each one is triaged, matched to a lead by sender
//! address, classified, stored, and applied to the lead's state. A message id that was
//! already stored is skipped, so re-fetching the same mailbox is harmless.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::domain::action_log::{ActionResult, ActionType, AgentActionLog};
use cadence_core::domain::lead::Lead;
use cadence_core::domain::reply::{EmailReply, InboundMessage, ReplyClass};
use cadence_core::lifecycle::{self, LeadEvent};
use cadence_core::replies::{self as rules, Triage, MATCHABLE_STATUSES};
use cadence_core::schedule::Clock;
use cadence_db::repositories::RepositoryError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::llm::LlmClient;
use crate::prompt::PromptRenderer;
use crate::stores::{AgentStores, LeadUpdateError};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("mailbox unavailable: {0}")]
    Unavailable(String),
    #[error("invalid message payload: {0}")]
    InvalidPayload(String),
}

#[async_trait]
pub trait ReplyFetcher: Send + Sync {
    /// Messages received since the last successful fetch.
    async fn fetch(&self) -> Result<Vec<InboundMessage>, FetchError>;
}

/// Hands out a fixed batch once. Used for operator-supplied messages.
#[derive(Default)]
pub struct StaticReplyFetcher {
    messages: Mutex<Vec<InboundMessage>>,
}

impl StaticReplyFetcher {
    pub fn new(messages: Vec<InboundMessage>) -> Self {
        Self { messages: Mutex::new(messages) }
    }

    /// Parses a JSON array of inbound messages.
    pub fn from_json(raw: &str) -> Result<Self, FetchError> {
        let messages: Vec<InboundMessage> = serde_json::from_str(raw)
            .map_err(|error| FetchError::InvalidPayload(error.to_string()))?;
        Ok(Self::new(messages))
    }
}

#[async_trait]
impl ReplyFetcher for StaticReplyFetcher {
    async fn fetch(&self) -> Result<Vec<InboundMessage>, FetchError> {
        Ok(std::mem::take(&mut *self.messages.lock().await))
    }
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    LeadUpdate(#[from] LeadUpdateError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOutcome {
    Duplicate,
    OutOfOffice,
    Bounce,
    Unmatched,
    Classified(ReplyClass),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxReport {
    pub fetched: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub out_of_office: usize,
    pub bounces: usize,
    pub unmatched: usize,
    pub errors: usize,
}

impl InboxReport {
    fn count(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::OutOfOffice => self.out_of_office += 1,
            MessageOutcome::Bounce => self.bounces += 1,
            MessageOutcome::Unmatched => {
                self.unmatched += 1;
                self.processed += 1;
            }
            MessageOutcome::Classified(_) => self.processed += 1,
        }
    }
}

pub struct ReplyProcessor {
    stores: AgentStores,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptRenderer>,
    clock: Arc<dyn Clock>,
}

impl ReplyProcessor {
    pub fn new(
        stores: AgentStores,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptRenderer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { stores, llm, prompts, clock }
    }

    /// Drains the fetcher and processes every message. One bad message does not stop the
    /// batch.
    pub async fn poll(&self, fetcher: &dyn ReplyFetcher) -> Result<InboxReport, ReplyError> {
        let messages = fetcher.fetch().await?;
        let mut report = InboxReport { fetched: messages.len(), ..InboxReport::default() };

        for message in &messages {
            match self.process(message).await {
                Ok(outcome) => report.count(outcome),
                Err(error) => {
                    report.errors += 1;
                    tracing::warn!(
                        event_name = "replies.message_failed",
                        from = %message.from_email,
                        message_id = message.message_id.as_deref().unwrap_or("-"),
                        error = %error,
                    );
                }
            }
        }

        if report.fetched > 0 {
            tracing::info!(
                event_name = "replies.poll_finished",
                fetched = report.fetched,
                processed = report.processed,
                bounces = report.bounces,
                errors = report.errors,
            );
        }
        Ok(report)
    }

    pub async fn process(&self, message: &InboundMessage) -> Result<MessageOutcome, ReplyError> {
        if let Some(message_id) = message.message_id.as_deref() {
            if self.stores.replies.exists_message_id(message_id).await? {
                return Ok(MessageOutcome::Duplicate);
            }
        }

        match rules::triage(message) {
            Triage::OutOfOffice => {
                tracing::debug!(event_name = "replies.out_of_office", from = %message.from_email);
                Ok(MessageOutcome::OutOfOffice)
            }
            Triage::Bounce { recipients } => {
                self.apply_bounce(&recipients).await?;
                Ok(MessageOutcome::Bounce)
            }
            Triage::Reply => self.apply_reply(message).await,
        }
    }

    async fn apply_bounce(&self, recipients: &[String]) -> Result<(), ReplyError> {
        let now = self.clock.now();
        for address in recipients {
            let Some(lead) = self.stores.leads.find_by_email(address, &MATCHABLE_STATUSES).await?
            else {
                continue;
            };
            let updated = self
                .stores
                .update_lead(&lead.id, |lead| {
                    lifecycle::apply(lead, LeadEvent::Bounced, now).map(drop)
                })
                .await?;
            if let Some(lead) = updated {
                tracing::info!(
                    event_name = "replies.bounce_recorded",
                    lead_id = %lead.id,
                    bounce_count = lead.bounce_count,
                    status = lead.status.as_str(),
                );
            }
        }
        Ok(())
    }

    async fn apply_reply(&self, message: &InboundMessage) -> Result<MessageOutcome, ReplyError> {
        let now = self.clock.now();
        let sender = rules::normalize_sender(&message.from_email);
        let lead = self.stores.leads.find_by_email(&sender, &MATCHABLE_STATUSES).await?;

        let Some(lead) = lead else {
            tracing::info!(event_name = "replies.unmatched", from = %sender);
            let mut reply = EmailReply::from_inbound(None, message, ReplyClass::Unclear, now);
            reply.from_email = sender;
            self.stores.replies.save(reply).await?;
            return Ok(MessageOutcome::Unmatched);
        };

        let class = self.classify(&message.body).await;
        let mut reply = EmailReply::from_inbound(Some(lead.id.clone()), message, class, now);
        reply.from_email = sender;
        self.stores.replies.save(reply).await?;

        // Classification waits on the model; apply the outcome to the stored lead, not the
        // copy read before it.
        let event = rules::lead_event_for(class);
        let lead = self
            .stores
            .update_lead(&lead.id, |lead| lifecycle::apply(lead, event.clone(), now).map(drop))
            .await?
            .unwrap_or(lead);
        self.stores.agent.record_reply(now).await?;

        let log = AgentActionLog::new(ActionType::ReplyProcessed, ActionResult::Success, now)
            .for_lead(&lead)
            .with_reason(format!("Reply classified as {}", class.as_str()))
            .with_metadata("classification", class.as_str())
            .with_metadata("subject", message.subject.clone());
        self.stores.actions.append(log).await?;

        tracing::info!(
            event_name = "replies.classified",
            lead_id = %lead.id,
            classification = class.as_str(),
            status = lead.status.as_str(),
        );
        Ok(MessageOutcome::Classified(class))
    }

    /// Model output mapped onto a class. Short bodies and model failures are `unclear`.
    async fn classify(&self, body: &str) -> ReplyClass {
        if !rules::is_classifiable(body) {
            return ReplyClass::Unclear;
        }
        let prompt = match self.prompts.classify_reply(body) {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::warn!(event_name = "replies.prompt_failed", error = %error);
                return ReplyClass::Unclear;
            }
        };
        match self.llm.generate(&prompt).await {
            Ok(raw) => rules::normalize_classification(&raw),
            Err(error) => {
                tracing::warn!(
                    event_name = "replies.classification_failed",
                    provider = self.llm.name(),
                    error = %error,
                );
                ReplyClass::Unclear
            }
        }
    }
}

/// Lead a reply would attach to, for operator tooling.
pub async fn match_sender(stores: &AgentStores, from: &str) -> Result<Option<Lead>, ReplyError> {
    let sender = rules::normalize_sender(from);
    Ok(stores.leads.find_by_email(&sender, &MATCHABLE_STATUSES).await?)
}
