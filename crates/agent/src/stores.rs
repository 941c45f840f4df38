use std::sync::Arc;

use cadence_core::domain::agent_config::AgentConfig;
use cadence_core::domain::lead::{Lead, LeadId};
use cadence_core::lifecycle::LeadTransitionError;
use cadence_db::repositories::{
    ActionLogRepository, AgentConfigRepository, EmailLogRepository, EmailQueueRepository,
    InMemoryActionLogRepository, InMemoryAgentConfigRepository, InMemoryEmailLogRepository,
    InMemoryEmailQueueRepository, InMemoryLeadRepository, InMemoryReplyRepository,
    LeadRepository, ReplyRepository, RepositoryError, SqlActionLogRepository,
    SqlAgentConfigRepository, SqlEmailLogRepository, SqlEmailQueueRepository, SqlLeadRepository,
    SqlReplyRepository,
};
use cadence_db::DbPool;
use thiserror::Error;

/// Rounds of re-read and compare-and-save before a lead update gives up.
const LEAD_UPDATE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum LeadUpdateError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Transition(#[from] LeadTransitionError),
    #[error("lead {0} kept changing underneath the update")]
    Contended(LeadId),
}

/// Every repository the agent touches, shared between the runner, workers and control surface.
#[derive(Clone)]
pub struct AgentStores {
    pub leads: Arc<dyn LeadRepository>,
    pub agent: Arc<dyn AgentConfigRepository>,
    pub queue: Arc<dyn EmailQueueRepository>,
    pub actions: Arc<dyn ActionLogRepository>,
    pub email_log: Arc<dyn EmailLogRepository>,
    pub replies: Arc<dyn ReplyRepository>,
}

impl AgentStores {
    pub fn sql(pool: DbPool) -> Self {
        Self {
            leads: Arc::new(SqlLeadRepository::new(pool.clone())),
            agent: Arc::new(SqlAgentConfigRepository::new(pool.clone())),
            queue: Arc::new(SqlEmailQueueRepository::new(pool.clone())),
            actions: Arc::new(SqlActionLogRepository::new(pool.clone())),
            email_log: Arc::new(SqlEmailLogRepository::new(pool.clone())),
            replies: Arc::new(SqlReplyRepository::new(pool)),
        }
    }

    /// Process-local stores. `config` seeds the agent record; `None` leaves it absent.
    pub fn in_memory(config: Option<AgentConfig>) -> Self {
        let agent = match config {
            Some(config) => InMemoryAgentConfigRepository::with_config(config),
            None => InMemoryAgentConfigRepository::default(),
        };
        Self {
            leads: Arc::new(InMemoryLeadRepository::default()),
            agent: Arc::new(agent),
            queue: Arc::new(InMemoryEmailQueueRepository::default()),
            actions: Arc::new(InMemoryActionLogRepository::default()),
            email_log: Arc::new(InMemoryEmailLogRepository::default()),
            replies: Arc::new(InMemoryReplyRepository::default()),
        }
    }

    /// Applies `change` to the freshest stored copy of a lead and writes it back only if no
    /// other writer got there first, re-reading on conflict. Returns `None` when the lead
    /// does not exist.
    pub async fn update_lead<F>(
        &self,
        id: &LeadId,
        mut change: F,
    ) -> Result<Option<Lead>, LeadUpdateError>
    where
        F: FnMut(&mut Lead) -> Result<(), LeadTransitionError> + Send,
    {
        for _ in 0..LEAD_UPDATE_ATTEMPTS {
            let Some(current) = self.leads.find_by_id(id).await? else {
                return Ok(None);
            };
            let mut updated = current.clone();
            change(&mut updated)?;
            if self.leads.compare_and_save(&current, updated.clone()).await? {
                return Ok(Some(updated));
            }
            tracing::debug!(event_name = "lead.update_retried", lead_id = %id);
        }
        Err(LeadUpdateError::Contended(id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::domain::lead::{Lead, LeadId, LeadStatus};
    use cadence_core::lifecycle::{self, LeadEvent};

    use super::{AgentStores, LeadUpdateError};
    use crate::testing;

    #[tokio::test]
    async fn update_lead_applies_the_change_to_the_stored_copy() {
        let stores = AgentStores::in_memory(None);
        let now = testing::now();
        let mut lead = Lead::new(LeadId("L-1".to_string()), "ada@acme.io", now);
        lifecycle::apply(&mut lead, LeadEvent::InitialEmailQueued, now).expect("queued");
        stores.leads.save(lead.clone()).await.expect("save");

        let mut interested = lead.clone();
        lifecycle::apply(&mut interested, LeadEvent::MarkedInterested, now).expect("reply");
        stores.leads.save(interested).await.expect("save");

        let updated = stores
            .update_lead(&lead.id, |lead| {
                lifecycle::apply(lead, LeadEvent::ExecutionFailed { message: "x".into() }, now)
                    .map(drop)
            })
            .await
            .expect("update")
            .expect("lead");
        assert_eq!(updated.status, LeadStatus::Interested);
        assert!(!updated.agent_enabled);
        assert_eq!(updated.error_count, 1);

        let missing = stores
            .update_lead(&LeadId("ghost".to_string()), |_| Ok(()))
            .await
            .expect("update");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn illegal_change_leaves_the_lead_untouched() {
        let stores = AgentStores::in_memory(None);
        let lead = Lead::new(LeadId("L-1".to_string()), "ada@acme.io", testing::now());
        stores.leads.save(lead.clone()).await.expect("save");

        let error = stores
            .update_lead(&lead.id, |lead| {
                lifecycle::apply(lead, LeadEvent::FollowUpQueued, testing::now()).map(drop)
            })
            .await
            .expect_err("new leads cannot take a follow-up");
        assert!(matches!(error, LeadUpdateError::Transition(_)));

        let stored = stores.leads.find_by_id(&lead.id).await.expect("find").expect("lead");
        assert_eq!(stored, lead);
    }
}
