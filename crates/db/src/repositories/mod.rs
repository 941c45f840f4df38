use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use cadence_core::chrono::{DateTime, Utc};
use thiserror::Error;

use cadence_core::delivery::QueueTransition;
use cadence_core::domain::action_log::{ActionLogQuery, ActionStatistics, AgentActionLog};
use cadence_core::domain::agent_config::{AgentConfig, WindowReset};
use cadence_core::domain::email_log::EmailLogEntry;
use cadence_core::domain::email_queue::{EmailQueueEntry, EmailQueueId, QueueStatus, QueueSummary};
use cadence_core::domain::lead::{Lead, LeadId, LeadStatus};
use cadence_core::domain::reply::EmailReply;

pub mod action_log;
pub mod agent_config;
pub mod email_log;
pub mod email_queue;
pub mod lead;
pub mod memory;
pub mod reply;
mod rows;

pub use action_log::SqlActionLogRepository;
pub use agent_config::SqlAgentConfigRepository;
pub use email_log::SqlEmailLogRepository;
pub use email_queue::SqlEmailQueueRepository;
pub use lead::SqlLeadRepository;
pub use memory::{
    InMemoryActionLogRepository, InMemoryAgentConfigRepository, InMemoryEmailLogRepository,
    InMemoryEmailQueueRepository, InMemoryLeadRepository, InMemoryReplyRepository,
};
pub use reply::SqlReplyRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

#[async_trait]
pub trait LeadRepository: Send + Sync {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError>;

    /// Case-insensitive exact address match among leads in one of `statuses`.
    async fn find_by_email(
        &self,
        email: &str,
        statuses: &[LeadStatus],
    ) -> Result<Option<Lead>, RepositoryError>;

    /// Agent-enabled, unpaused leads in an outreach state, highest priority first and then
    /// earliest scheduled check.
    async fn list_candidates(&self, limit: u32) -> Result<Vec<Lead>, RepositoryError>;

    async fn list(
        &self,
        status: Option<LeadStatus>,
        limit: u32,
    ) -> Result<Vec<Lead>, RepositoryError>;

    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>, RepositoryError>;

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError>;

    /// Writes `lead` only if the stored row still matches `previous`. Returns whether the
    /// write happened.
    async fn compare_and_save(&self, previous: &Lead, lead: Lead) -> Result<bool, RepositoryError>;
}

/// Access to the singleton agent record.
///
/// Counter columns are only ever changed through the dedicated methods so that
/// concurrent workers never overwrite each other's increments.
#[async_trait]
pub trait AgentConfigRepository: Send + Sync {
    async fn load(&self) -> Result<Option<AgentConfig>, RepositoryError>;

    /// Creates the default record when none exists and returns the stored one.
    async fn ensure(&self, now: DateTime<Utc>) -> Result<AgentConfig, RepositoryError>;

    /// Persists run flags, settings and run timestamps. Counters are left untouched.
    async fn save_control(&self, config: &AgentConfig) -> Result<(), RepositoryError>;

    /// Persists lazily detected window rollovers unless another writer got there first.
    async fn apply_window_reset(&self, reset: &WindowReset) -> Result<(), RepositoryError>;

    async fn record_send_attempt(
        &self,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn record_reply(&self, now: DateTime<Utc>) -> Result<(), RepositoryError>;

    /// Stamps `last_agent_run_at` without touching operator-controlled flags.
    async fn record_cycle(&self, ran_at: DateTime<Utc>) -> Result<(), RepositoryError>;

    async fn schedule_next_run(
        &self,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn reset_counters(&self, now: DateTime<Utc>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait EmailQueueRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &EmailQueueId,
    ) -> Result<Option<EmailQueueEntry>, RepositoryError>;

    async fn save(&self, entry: EmailQueueEntry) -> Result<(), RepositoryError>;

    /// Writes `entry` only if the stored row still has `previous`'s status and
    /// `updated_at`. Returns whether the write happened.
    async fn compare_and_save(
        &self,
        previous: &EmailQueueEntry,
        entry: EmailQueueEntry,
    ) -> Result<bool, RepositoryError>;

    async fn append_transition(&self, transition: QueueTransition) -> Result<(), RepositoryError>;

    async fn list_transitions(
        &self,
        queue_id: &EmailQueueId,
    ) -> Result<Vec<QueueTransition>, RepositoryError>;

    async fn list_by_status(
        &self,
        statuses: &[QueueStatus],
        limit: u32,
    ) -> Result<Vec<EmailQueueEntry>, RepositoryError>;

    async fn list_for_lead(&self, lead_id: &LeadId)
        -> Result<Vec<EmailQueueEntry>, RepositoryError>;

    /// Leads with a row that is pending, processing or failed with retries left.
    async fn outstanding_lead_ids(&self) -> Result<HashSet<LeadId>, RepositoryError>;

    /// Rows that will still send without operator action.
    async fn count_outstanding(&self) -> Result<u32, RepositoryError>;

    async fn summary(&self) -> Result<QueueSummary, RepositoryError>;
}

#[async_trait]
pub trait ActionLogRepository: Send + Sync {
    async fn append(&self, entry: AgentActionLog) -> Result<(), RepositoryError>;

    /// Newest first, filtered and paged by `query`.
    async fn list(&self, query: &ActionLogQuery) -> Result<Vec<AgentActionLog>, RepositoryError>;

    async fn count(&self, query: &ActionLogQuery) -> Result<u64, RepositoryError>;

    async fn statistics(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<ActionStatistics, RepositoryError>;

    /// Deletes entries older than `cutoff` and returns how many were removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait EmailLogRepository: Send + Sync {
    async fn append(&self, entry: EmailLogEntry) -> Result<(), RepositoryError>;

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
        limit: u32,
    ) -> Result<Vec<EmailLogEntry>, RepositoryError>;
}

#[async_trait]
pub trait ReplyRepository: Send + Sync {
    async fn save(&self, reply: EmailReply) -> Result<(), RepositoryError>;

    async fn exists_message_id(&self, message_id: &str) -> Result<bool, RepositoryError>;

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<EmailReply>, RepositoryError>;

    async fn list_recent(&self, limit: u32) -> Result<Vec<EmailReply>, RepositoryError>;
}
