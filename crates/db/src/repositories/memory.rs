use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use cadence_core::chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use cadence_core::delivery::QueueTransition;
use cadence_core::domain::action_log::{ActionLogQuery, ActionStatistics, AgentActionLog};
use cadence_core::domain::agent_config::{AgentConfig, WindowReset};
use cadence_core::domain::email_log::EmailLogEntry;
use cadence_core::domain::email_queue::{EmailQueueEntry, EmailQueueId, QueueStatus, QueueSummary};
use cadence_core::domain::lead::{Lead, LeadId, LeadStatus};
use cadence_core::domain::reply::EmailReply;
use cadence_core::rate_limit;

use super::{
    ActionLogRepository, AgentConfigRepository, EmailLogRepository, EmailQueueRepository,
    LeadRepository, ReplyRepository, RepositoryError,
};

#[derive(Default)]
pub struct InMemoryLeadRepository {
    leads: RwLock<HashMap<String, Lead>>,
}

#[async_trait::async_trait]
impl LeadRepository for InMemoryLeadRepository {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        Ok(leads.get(&id.0).cloned())
    }

    async fn find_by_email(
        &self,
        email: &str,
        statuses: &[LeadStatus],
    ) -> Result<Option<Lead>, RepositoryError> {
        let needle = email.trim().to_ascii_lowercase();
        let leads = self.leads.read().await;
        Ok(leads
            .values()
            .find(|lead| lead.email.to_ascii_lowercase() == needle && statuses.contains(&lead.status))
            .cloned())
    }

    async fn list_candidates(&self, limit: u32) -> Result<Vec<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        let mut candidates: Vec<Lead> = leads
            .values()
            .filter(|lead| {
                lead.agent_enabled && !lead.agent_paused && lead.status.is_outreach_active()
            })
            .cloned()
            .collect();

        // Unscheduled leads sort first, matching SQLite's NULL ordering.
        candidates.sort_by(|left, right| {
            right
                .priority_score
                .partial_cmp(&left.priority_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| left.next_agent_check_at.cmp(&right.next_agent_check_at))
        });
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn list(
        &self,
        status: Option<LeadStatus>,
        limit: u32,
    ) -> Result<Vec<Lead>, RepositoryError> {
        let leads = self.leads.read().await;
        let mut matching: Vec<Lead> = leads
            .values()
            .filter(|lead| status.map_or(true, |status| lead.status == status))
            .cloned()
            .collect();
        matching.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let leads = self.leads.read().await;
        let mut counts = BTreeMap::new();
        for lead in leads.values() {
            *counts.entry(lead.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        let mut leads = self.leads.write().await;
        leads.insert(lead.id.0.clone(), lead);
        Ok(())
    }

    async fn compare_and_save(&self, previous: &Lead, lead: Lead) -> Result<bool, RepositoryError> {
        let mut leads = self.leads.write().await;
        let unchanged = leads.get(&lead.id.0).is_some_and(|stored| stored == previous);
        if unchanged {
            leads.insert(lead.id.0.clone(), lead);
        }
        Ok(unchanged)
    }
}

/// Mirrors the SQL store: counters only move through the dedicated methods.
#[derive(Default)]
pub struct InMemoryAgentConfigRepository {
    config: RwLock<Option<AgentConfig>>,
}

impl InMemoryAgentConfigRepository {
    pub fn with_config(config: AgentConfig) -> Self {
        Self { config: RwLock::new(Some(config)) }
    }
}

#[async_trait::async_trait]
impl AgentConfigRepository for InMemoryAgentConfigRepository {
    async fn load(&self) -> Result<Option<AgentConfig>, RepositoryError> {
        Ok(self.config.read().await.clone())
    }

    async fn ensure(&self, now: DateTime<Utc>) -> Result<AgentConfig, RepositoryError> {
        let mut config = self.config.write().await;
        Ok(config.get_or_insert_with(|| AgentConfig::with_defaults(now)).clone())
    }

    async fn save_control(&self, incoming: &AgentConfig) -> Result<(), RepositoryError> {
        let mut config = self.config.write().await;
        let stored = config
            .as_mut()
            .ok_or(RepositoryError::NotFound { entity: "agent_config", id: "1".to_string() })?;

        let mut next = incoming.clone();
        next.emails_sent_today = stored.emails_sent_today;
        next.emails_sent_this_hour = stored.emails_sent_this_hour;
        next.last_reset_date = stored.last_reset_date;
        next.last_hour_reset = stored.last_hour_reset;
        next.total_emails_sent = stored.total_emails_sent;
        next.total_errors = stored.total_errors;
        next.total_replies_received = stored.total_replies_received;
        *stored = next;
        Ok(())
    }

    async fn apply_window_reset(&self, reset: &WindowReset) -> Result<(), RepositoryError> {
        let mut config = self.config.write().await;
        let Some(stored) = config.as_mut() else {
            return Ok(());
        };

        if let Some(today) = reset.daily {
            if stored.last_reset_date != Some(today) {
                stored.emails_sent_today = 0;
                stored.last_reset_date = Some(today);
            }
        }
        if let Some(anchor) = reset.hourly {
            let elapsed = stored
                .last_hour_reset
                .map_or(true, |previous| previous <= anchor - Duration::hours(1));
            if elapsed {
                stored.emails_sent_this_hour = 0;
                stored.last_hour_reset = Some(anchor);
            }
        }
        Ok(())
    }

    async fn record_send_attempt(
        &self,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut config = self.config.write().await;
        if let Some(stored) = config.as_mut() {
            rate_limit::record_attempt(stored, success, now);
        }
        Ok(())
    }

    async fn record_reply(&self, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut config = self.config.write().await;
        if let Some(stored) = config.as_mut() {
            stored.total_replies_received = stored.total_replies_received.saturating_add(1);
            stored.updated_at = now;
        }
        Ok(())
    }

    async fn record_cycle(&self, ran_at: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut config = self.config.write().await;
        if let Some(stored) = config.as_mut() {
            stored.last_agent_run_at = Some(ran_at);
            stored.updated_at = ran_at;
        }
        Ok(())
    }

    async fn schedule_next_run(
        &self,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut config = self.config.write().await;
        if let Some(stored) = config.as_mut() {
            stored.next_agent_run_at = next_run_at;
            stored.updated_at = now;
        }
        Ok(())
    }

    async fn reset_counters(&self, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        let mut config = self.config.write().await;
        if let Some(stored) = config.as_mut() {
            rate_limit::reset_counters(stored, now);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryEmailQueueRepository {
    entries: RwLock<HashMap<String, EmailQueueEntry>>,
    transitions: RwLock<Vec<QueueTransition>>,
}

#[async_trait::async_trait]
impl EmailQueueRepository for InMemoryEmailQueueRepository {
    async fn find_by_id(
        &self,
        id: &EmailQueueId,
    ) -> Result<Option<EmailQueueEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&id.0).cloned())
    }

    async fn save(&self, entry: EmailQueueEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.insert(entry.id.0.clone(), entry);
        Ok(())
    }

    async fn compare_and_save(
        &self,
        previous: &EmailQueueEntry,
        entry: EmailQueueEntry,
    ) -> Result<bool, RepositoryError> {
        let mut entries = self.entries.write().await;
        let unchanged = entries.get(&entry.id.0).is_some_and(|stored| {
            stored.status == previous.status && stored.updated_at == previous.updated_at
        });
        if unchanged {
            entries.insert(entry.id.0.clone(), entry);
        }
        Ok(unchanged)
    }

    async fn append_transition(&self, transition: QueueTransition) -> Result<(), RepositoryError> {
        self.transitions.write().await.push(transition);
        Ok(())
    }

    async fn list_transitions(
        &self,
        queue_id: &EmailQueueId,
    ) -> Result<Vec<QueueTransition>, RepositoryError> {
        let transitions = self.transitions.read().await;
        Ok(transitions.iter().filter(|transition| &transition.queue_id == queue_id).cloned().collect())
    }

    async fn list_by_status(
        &self,
        statuses: &[QueueStatus],
        limit: u32,
    ) -> Result<Vec<EmailQueueEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<EmailQueueEntry> =
            entries.values().filter(|entry| statuses.contains(&entry.status)).cloned().collect();
        matching.sort_by(|left, right| {
            left.scheduled_at
                .cmp(&right.scheduled_at)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<EmailQueueEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<EmailQueueEntry> =
            entries.values().filter(|entry| &entry.lead_id == lead_id).cloned().collect();
        matching.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        Ok(matching)
    }

    async fn outstanding_lead_ids(&self) -> Result<HashSet<LeadId>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries
            .values()
            .filter(|entry| entry.is_outstanding())
            .map(|entry| entry.lead_id.clone())
            .collect())
    }

    async fn count_outstanding(&self) -> Result<u32, RepositoryError> {
        let entries = self.entries.read().await;
        let count = entries.values().filter(|entry| entry.is_outstanding()).count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn summary(&self) -> Result<QueueSummary, RepositoryError> {
        let entries = self.entries.read().await;
        let mut summary = QueueSummary::default();
        for entry in entries.values() {
            match entry.status {
                QueueStatus::Pending => {
                    summary.pending += 1;
                    summary.oldest_pending_at = Some(
                        summary
                            .oldest_pending_at
                            .map_or(entry.scheduled_at, |oldest| oldest.min(entry.scheduled_at)),
                    );
                }
                QueueStatus::Processing => summary.processing += 1,
                QueueStatus::Sent => summary.sent += 1,
                QueueStatus::Failed => {
                    summary.failed += 1;
                    if entry.is_permanently_failed() {
                        summary.permanently_failed += 1;
                    } else {
                        summary.retryable += 1;
                    }
                }
            }
        }
        Ok(summary)
    }
}

#[derive(Default)]
pub struct InMemoryActionLogRepository {
    entries: RwLock<Vec<AgentActionLog>>,
}

fn matches_query(entry: &AgentActionLog, query: &ActionLogQuery) -> bool {
    query.action_type.map_or(true, |action_type| entry.action_type == action_type)
        && query.lead_id.as_ref().map_or(true, |lead_id| entry.lead_id.as_ref() == Some(lead_id))
        && query.run_id.as_ref().map_or(true, |run_id| entry.agent_run_id.as_ref() == Some(run_id))
}

#[async_trait::async_trait]
impl ActionLogRepository for InMemoryActionLogRepository {
    async fn append(&self, entry: AgentActionLog) -> Result<(), RepositoryError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn list(&self, query: &ActionLogQuery) -> Result<Vec<AgentActionLog>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<(usize, &AgentActionLog)> =
            entries.iter().enumerate().filter(|(_, entry)| matches_query(entry, query)).collect();
        matching.sort_by(|(left_seq, left), (right_seq, right)| {
            right.occurred_at.cmp(&left.occurred_at).then_with(|| right_seq.cmp(left_seq))
        });

        Ok(matching
            .into_iter()
            .skip(query.offset as usize)
            .take(query.limit as usize)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn count(&self, query: &ActionLogQuery) -> Result<u64, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|entry| matches_query(entry, query)).count() as u64)
    }

    async fn statistics(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<ActionStatistics, RepositoryError> {
        let entries = self.entries.read().await;
        let mut by_type = BTreeMap::new();
        let mut by_result = BTreeMap::new();
        for entry in entries.iter().filter(|entry| since.map_or(true, |since| entry.occurred_at >= since)) {
            *by_type.entry(entry.action_type.as_str().to_string()).or_insert(0) += 1;
            *by_result.entry(entry.action_result.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(ActionStatistics::from_counts(by_type, by_result))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.occurred_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}

#[derive(Default)]
pub struct InMemoryEmailLogRepository {
    entries: RwLock<Vec<EmailLogEntry>>,
}

#[async_trait::async_trait]
impl EmailLogRepository for InMemoryEmailLogRepository {
    async fn append(&self, entry: EmailLogEntry) -> Result<(), RepositoryError> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
        limit: u32,
    ) -> Result<Vec<EmailLogEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|entry| &entry.lead_id == lead_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryReplyRepository {
    replies: RwLock<Vec<EmailReply>>,
}

#[async_trait::async_trait]
impl ReplyRepository for InMemoryReplyRepository {
    async fn save(&self, reply: EmailReply) -> Result<(), RepositoryError> {
        let mut replies = self.replies.write().await;
        match replies.iter_mut().find(|stored| stored.id == reply.id) {
            Some(stored) => *stored = reply,
            None => replies.push(reply),
        }
        Ok(())
    }

    async fn exists_message_id(&self, message_id: &str) -> Result<bool, RepositoryError> {
        let replies = self.replies.read().await;
        Ok(replies.iter().any(|reply| reply.message_id.as_deref() == Some(message_id)))
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<EmailReply>, RepositoryError> {
        let replies = self.replies.read().await;
        let mut matching: Vec<EmailReply> =
            replies.iter().filter(|reply| reply.lead_id.as_ref() == Some(lead_id)).cloned().collect();
        matching.sort_by(|left, right| left.received_at.cmp(&right.received_at));
        Ok(matching)
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<EmailReply>, RepositoryError> {
        let replies = self.replies.read().await;
        let mut recent = replies.clone();
        recent.sort_by(|left, right| right.received_at.cmp(&left.received_at));
        recent.truncate(limit as usize);
        Ok(recent)
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::chrono::{DateTime, Duration, TimeZone, Utc};
    use cadence_core::delivery::DeliveryEngine;
    use cadence_core::domain::action_log::{
        ActionLogQuery, ActionResult, ActionType, AgentActionLog,
    };
    use cadence_core::domain::agent_config::AgentConfig;
    use cadence_core::domain::email_queue::{EmailKind, QueueStatus};
    use cadence_core::domain::lead::{Lead, LeadId, LeadStatus};
    use cadence_core::rate_limit;

    use crate::repositories::{
        ActionLogRepository, AgentConfigRepository, EmailQueueRepository,
        InMemoryActionLogRepository, InMemoryAgentConfigRepository, InMemoryEmailQueueRepository,
        InMemoryLeadRepository, LeadRepository,
    };

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).single().expect("valid instant")
            + Duration::minutes(minutes)
    }

    #[tokio::test]
    async fn lead_candidates_follow_priority_then_schedule() {
        let repo = InMemoryLeadRepository::default();

        let mut low = Lead::new(LeadId("low".to_string()), "low@acme.io", at(0));
        low.priority_score = 3.0;
        let mut late = Lead::new(LeadId("late".to_string()), "late@acme.io", at(0));
        late.priority_score = 8.0;
        late.next_agent_check_at = Some(at(60));
        let mut early = Lead::new(LeadId("early".to_string()), "early@acme.io", at(0));
        early.priority_score = 8.0;
        early.next_agent_check_at = Some(at(5));
        let mut closed = Lead::new(LeadId("closed".to_string()), "closed@acme.io", at(0));
        closed.status = LeadStatus::Closed;
        closed.priority_score = 10.0;

        for lead in [low, late, early, closed] {
            repo.save(lead).await.expect("save");
        }

        let ids: Vec<String> = repo
            .list_candidates(10)
            .await
            .expect("candidates")
            .into_iter()
            .map(|lead| lead.id.0)
            .collect();
        assert_eq!(ids, vec!["early", "late", "low"]);

        let found = repo
            .find_by_email("EARLY@acme.io", &[LeadStatus::New])
            .await
            .expect("lookup")
            .expect("lead");
        assert_eq!(found.id.0, "early");
        assert!(repo
            .find_by_email("closed@acme.io", &[LeadStatus::New])
            .await
            .expect("lookup")
            .is_none());
    }

    #[tokio::test]
    async fn lead_compare_and_save_rejects_a_stale_copy() {
        let repo = InMemoryLeadRepository::default();
        let original = Lead::new(LeadId("L-1".to_string()), "ada@acme.io", at(0));
        repo.save(original.clone()).await.expect("save");

        let mut replied = original.clone();
        replied.status = LeadStatus::Interested;
        replied.agent_enabled = false;
        assert!(repo.compare_and_save(&original, replied.clone()).await.expect("write"));

        let mut stale = original.clone();
        stale.status = LeadStatus::Contacted;
        assert!(!repo.compare_and_save(&original, stale).await.expect("write"));

        let stored = repo.find_by_id(&original.id).await.expect("find").expect("lead");
        assert_eq!(stored, replied);

        let ghost = Lead::new(LeadId("ghost".to_string()), "ghost@acme.io", at(0));
        assert!(!repo.compare_and_save(&ghost, ghost.clone()).await.expect("write"));
    }

    #[tokio::test]
    async fn agent_config_control_save_keeps_counters() {
        let repo = InMemoryAgentConfigRepository::default();
        assert!(repo.load().await.expect("load").is_none());

        let config = repo.ensure(at(0)).await.expect("ensure");
        repo.record_send_attempt(true, at(1)).await.expect("attempt");
        repo.record_send_attempt(false, at(2)).await.expect("attempt");

        let mut stale = config.clone();
        stale.is_running = true;
        stale.daily_email_limit = 80;
        repo.save_control(&stale).await.expect("save control");

        let stored = repo.load().await.expect("load").expect("config");
        assert!(stored.is_running);
        assert_eq!(stored.daily_email_limit, 80);
        assert_eq!(stored.emails_sent_today, 2);
        assert_eq!(stored.total_emails_sent, 2);
        assert_eq!(stored.total_errors, 1);
    }

    #[tokio::test]
    async fn window_reset_is_idempotent() {
        let mut seeded = AgentConfig::with_defaults(at(0));
        rate_limit::record_attempt(&mut seeded, true, at(0));
        let repo = InMemoryAgentConfigRepository::with_config(seeded.clone());

        let mut view = seeded;
        let reset = rate_limit::roll_windows(&mut view, at(90));
        assert!(reset.hourly.is_some());
        assert!(reset.daily.is_none());

        repo.apply_window_reset(&reset).await.expect("reset");
        repo.record_send_attempt(true, at(91)).await.expect("attempt");
        repo.apply_window_reset(&reset).await.expect("reset again");

        let stored = repo.load().await.expect("load").expect("config");
        assert_eq!(stored.emails_sent_this_hour, 1);
        assert_eq!(stored.emails_sent_today, 2);
    }

    #[tokio::test]
    async fn queue_compare_and_save_and_summary() {
        let repo = InMemoryEmailQueueRepository::default();
        let engine = DeliveryEngine::new();
        let entry = engine.create_entry(LeadId("L-1".to_string()), EmailKind::Initial, 1, "Hi", at(0));
        repo.save(entry.clone()).await.expect("save");

        let first = engine.claim(entry.clone(), None, at(1)).expect("claim");
        let second = engine.claim(entry.clone(), None, at(2)).expect("claim");
        assert!(repo.compare_and_save(&entry, first.entry).await.expect("write"));
        assert!(!repo.compare_and_save(&entry, second.entry).await.expect("write"));
        repo.append_transition(first.transition).await.expect("append");

        assert_eq!(repo.list_transitions(&entry.id).await.expect("transitions").len(), 1);
        let summary = repo.summary().await.expect("summary");
        assert_eq!(summary.processing, 1);
        assert!(repo.outstanding_lead_ids().await.expect("outstanding").contains(&entry.lead_id));
        assert_eq!(repo.count_outstanding().await.expect("count"), 1);
        assert!(repo.list_by_status(&[QueueStatus::Pending], 10).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn action_log_lists_newest_first_and_prunes() {
        let repo = InMemoryActionLogRepository::default();
        repo.append(AgentActionLog::new(ActionType::Cycle, ActionResult::Success, at(-200_000)))
            .await
            .expect("append");
        repo.append(AgentActionLog::new(ActionType::Skip, ActionResult::Skipped, at(0)))
            .await
            .expect("append");

        let listed = repo.list(&ActionLogQuery::default()).await.expect("list");
        assert_eq!(listed[0].action_type, ActionType::Skip);

        assert_eq!(repo.prune_before(at(-1)).await.expect("prune"), 1);
        assert_eq!(repo.count(&ActionLogQuery::default()).await.expect("count"), 1);
    }
}
