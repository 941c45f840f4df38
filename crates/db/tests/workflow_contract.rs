//! End-to-end persistence contract for one outreach email: queued, claimed by two
//! competing workers, delivered, and reflected on the lead and the agent counters.

use std::sync::Arc;

use cadence_core::chrono::{DateTime, Duration, TimeZone, Utc};
use cadence_core::delivery::{DeliveryEngine, RetryPolicy};
use cadence_core::domain::email_log::EmailLogEntry;
use cadence_core::domain::email_queue::{EmailKind, QueueStatus};
use cadence_core::domain::lead::{Lead, LeadId, LeadStatus};
use cadence_core::lifecycle::{self, LeadEvent};
use cadence_db::repositories::{
    AgentConfigRepository, EmailLogRepository, EmailQueueRepository, LeadRepository,
    SqlAgentConfigRepository, SqlEmailLogRepository, SqlEmailQueueRepository, SqlLeadRepository,
};
use cadence_db::{connect_with_settings, migrations, DbPool};

type ContractResult<T = ()> = Result<T, String>;

fn at(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).single().expect("valid instant")
        + Duration::minutes(minutes)
}

fn ensure(condition: bool, message: impl Into<String>) -> ContractResult {
    if condition {
        Ok(())
    } else {
        Err(message.into())
    }
}

async fn file_pool(dir: &tempfile::TempDir) -> ContractResult<DbPool> {
    let path = dir.path().join("cadence.db");
    let url = format!("sqlite://{}", path.display());
    let pool = connect_with_settings(&url, 4, 30).await.map_err(|error| error.to_string())?;
    migrations::run_pending(&pool).await.map_err(|error| error.to_string())?;
    Ok(pool)
}

#[tokio::test]
async fn delivered_email_updates_queue_lead_counters_and_log() -> ContractResult {
    let dir = tempfile::tempdir().map_err(|error| error.to_string())?;
    let pool = file_pool(&dir).await?;

    let leads = SqlLeadRepository::new(pool.clone());
    let queue = Arc::new(SqlEmailQueueRepository::new(pool.clone()));
    let agent = SqlAgentConfigRepository::new(pool.clone());
    let email_log = SqlEmailLogRepository::new(pool.clone());
    let engine = DeliveryEngine::new();

    let mut lead = Lead::new(LeadId("lead-1".to_string()), "ada@acme.io", at(0));
    lead.first_name = Some("Ada".to_string());
    lead.company = Some("Acme".to_string());
    leads.save(lead.clone()).await.map_err(|error| error.to_string())?;

    let pending = engine.create_entry(lead.id.clone(), EmailKind::Initial, 1, "Hello Acme", at(0));
    queue.save(pending.clone()).await.map_err(|error| error.to_string())?;

    let candidates = leads.list_candidates(10).await.map_err(|error| error.to_string())?;
    ensure(candidates.is_empty(), "lead with a pending row must not be a candidate")?;

    // Two workers race for the same pending row; exactly one claim lands.
    let first = engine.claim(pending.clone(), None, at(1)).map_err(|error| error.to_string())?;
    let second = engine.claim(pending.clone(), None, at(1)).map_err(|error| error.to_string())?;
    let (left, right) = tokio::join!(
        queue.compare_and_save(&pending, first.entry.clone()),
        queue.compare_and_save(&pending, second.entry.clone()),
    );
    let wins = [left.map_err(|e| e.to_string())?, right.map_err(|e| e.to_string())?]
        .into_iter()
        .filter(|won| *won)
        .count();
    ensure(wins == 1, format!("expected exactly one winning claim, got {wins}"))?;
    queue.append_transition(first.transition).await.map_err(|error| error.to_string())?;

    let claimed = queue
        .find_by_id(&pending.id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or("claimed row missing")?;
    ensure(claimed.status == QueueStatus::Processing, "row should be processing")?;

    let sent = engine.mark_sent(claimed, at(2)).map_err(|error| error.to_string())?;
    queue.save(sent.entry.clone()).await.map_err(|error| error.to_string())?;
    queue.append_transition(sent.transition).await.map_err(|error| error.to_string())?;
    agent.record_send_attempt(true, at(2)).await.map_err(|error| error.to_string())?;
    email_log
        .append(EmailLogEntry::sent(
            lead.id.clone(),
            Some(pending.id.clone()),
            &lead.email,
            "Hello Acme",
            Some("Hi Ada".to_string()),
            at(2),
        ))
        .await
        .map_err(|error| error.to_string())?;

    lifecycle::apply(
        &mut lead,
        LeadEvent::DeliveryConfirmed { kind: EmailKind::Initial, sequence_step: 1, sent_at: at(2) },
        at(2),
    )
    .map_err(|error| error.to_string())?;
    leads.save(lead.clone()).await.map_err(|error| error.to_string())?;

    let stored_lead = leads
        .find_by_id(&lead.id)
        .await
        .map_err(|error| error.to_string())?
        .ok_or("lead missing")?;
    ensure(stored_lead.status == LeadStatus::Contacted, "lead should be contacted")?;
    ensure(stored_lead.sequence_step == 1, "sequence step should be 1")?;
    ensure(stored_lead.last_email_sent_at == Some(at(2)), "last_email_sent_at should be set")?;

    let config = agent.load().await.map_err(|error| error.to_string())?.ok_or("config missing")?;
    ensure(config.emails_sent_today == 1, "daily counter should be 1")?;
    ensure(config.emails_sent_this_hour == 1, "hourly counter should be 1")?;
    ensure(config.total_emails_sent == 1, "lifetime counter should be 1")?;

    let transitions =
        queue.list_transitions(&pending.id).await.map_err(|error| error.to_string())?;
    let path: Vec<(QueueStatus, QueueStatus)> =
        transitions.iter().map(|transition| (transition.from, transition.to)).collect();
    ensure(
        path == vec![
            (QueueStatus::Pending, QueueStatus::Processing),
            (QueueStatus::Processing, QueueStatus::Sent),
        ],
        format!("unexpected transition path {path:?}"),
    )?;

    let log = email_log.list_for_lead(&lead.id, 10).await.map_err(|error| error.to_string())?;
    ensure(log.len() == 1, "one email log row expected")?;

    let summary = queue.summary().await.map_err(|error| error.to_string())?;
    ensure(summary.sent == 1 && summary.pending == 0, format!("unexpected summary {summary:?}"))?;

    pool.close().await;
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_leave_a_permanently_failed_row() -> ContractResult {
    let dir = tempfile::tempdir().map_err(|error| error.to_string())?;
    let pool = file_pool(&dir).await?;

    let leads = SqlLeadRepository::new(pool.clone());
    let queue = SqlEmailQueueRepository::new(pool.clone());
    let agent = SqlAgentConfigRepository::new(pool.clone());
    let engine = DeliveryEngine::new();

    let lead = Lead::new(LeadId("lead-2".to_string()), "grace@acme.io", at(0));
    leads.save(lead.clone()).await.map_err(|error| error.to_string())?;

    let mut entry = engine.create_entry(lead.id.clone(), EmailKind::Initial, 1, "Hello", at(0));
    queue.save(entry.clone()).await.map_err(|error| error.to_string())?;

    let mut attempts = 0;
    let mut minute = 1;
    loop {
        let previous = entry.clone();
        let claimed = match engine.claim(entry.clone(), None, at(minute)) {
            Ok(claimed) => claimed,
            Err(_) => break,
        };
        let won = queue
            .compare_and_save(&previous, claimed.entry.clone())
            .await
            .map_err(|error| error.to_string())?;
        ensure(won, "uncontended claim must succeed")?;
        attempts += 1;

        let failed = engine
            .mark_failed(claimed.entry, "smtp unavailable", RetryPolicy::Retry, at(minute + 1))
            .map_err(|error| error.to_string())?;
        queue.save(failed.entry.clone()).await.map_err(|error| error.to_string())?;
        agent.record_send_attempt(false, at(minute + 1)).await.map_err(|error| error.to_string())?;
        entry = failed.entry;
        minute += 2;
        if failed.retry_after.is_none() {
            break;
        }
    }

    ensure(attempts == 4, format!("expected max_retries + 1 attempts, got {attempts}"))?;
    ensure(entry.is_permanently_failed(), "row should be permanently failed")?;
    ensure(
        entry.last_error.as_deref().is_some_and(|error| error.starts_with("Max retries exceeded")),
        format!("unexpected last_error {:?}", entry.last_error),
    )?;

    let summary = queue.summary().await.map_err(|error| error.to_string())?;
    ensure(summary.permanently_failed == 1, "summary should count the exhausted row")?;

    let config = agent.load().await.map_err(|error| error.to_string())?.ok_or("config missing")?;
    ensure(config.total_errors == 4, format!("expected 4 errors, got {}", config.total_errors))?;

    pool.close().await;
    Ok(())
}
