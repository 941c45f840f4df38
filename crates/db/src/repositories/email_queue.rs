use std::collections::HashSet;

use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::delivery::QueueTransition;
use cadence_core::domain::email_queue::{
    EmailKind, EmailQueueEntry, EmailQueueId, QueueStatus, QueueSummary, TaskId,
};
use cadence_core::domain::lead::LeadId;

use super::rows::{
    optional_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, parse_u64,
    placeholders, timestamp, OUTSTANDING_QUEUE_ROW,
};
use super::{EmailQueueRepository, RepositoryError};
use crate::DbPool;

const QUEUE_COLUMNS: &str = "id,
    lead_id,
    kind,
    sequence_step,
    subject,
    body,
    html_body,
    task_id,
    status,
    retry_count,
    max_retries,
    last_error,
    scheduled_at,
    sent_at,
    failed_at,
    created_at,
    updated_at";

pub struct SqlEmailQueueRepository {
    pool: DbPool,
}

impl SqlEmailQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EmailQueueRepository for SqlEmailQueueRepository {
    async fn find_by_id(
        &self,
        id: &EmailQueueId,
    ) -> Result<Option<EmailQueueEntry>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {QUEUE_COLUMNS} FROM email_queue WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(entry_from_row).transpose()
    }

    async fn save(&self, entry: EmailQueueEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO email_queue (
                id,
                lead_id,
                kind,
                sequence_step,
                subject,
                body,
                html_body,
                task_id,
                status,
                retry_count,
                max_retries,
                last_error,
                scheduled_at,
                sent_at,
                failed_at,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                subject = excluded.subject,
                body = excluded.body,
                html_body = excluded.html_body,
                task_id = excluded.task_id,
                status = excluded.status,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                last_error = excluded.last_error,
                scheduled_at = excluded.scheduled_at,
                sent_at = excluded.sent_at,
                failed_at = excluded.failed_at,
                updated_at = excluded.updated_at",
        )
        .bind(&entry.id.0)
        .bind(&entry.lead_id.0)
        .bind(entry.kind.as_str())
        .bind(i64::from(entry.sequence_step))
        .bind(&entry.subject)
        .bind(entry.body.as_deref())
        .bind(entry.html_body.as_deref())
        .bind(entry.task_id.as_ref().map(|id| id.0.as_str()))
        .bind(entry.status.as_str())
        .bind(i64::from(entry.retry_count))
        .bind(i64::from(entry.max_retries))
        .bind(entry.last_error.as_deref())
        .bind(timestamp(entry.scheduled_at))
        .bind(optional_timestamp(entry.sent_at))
        .bind(optional_timestamp(entry.failed_at))
        .bind(timestamp(entry.created_at))
        .bind(timestamp(entry.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn compare_and_save(
        &self,
        previous: &EmailQueueEntry,
        entry: EmailQueueEntry,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE email_queue SET
                subject = ?,
                body = ?,
                html_body = ?,
                task_id = ?,
                status = ?,
                retry_count = ?,
                max_retries = ?,
                last_error = ?,
                scheduled_at = ?,
                sent_at = ?,
                failed_at = ?,
                updated_at = ?
             WHERE id = ? AND status = ? AND updated_at = ?",
        )
        .bind(&entry.subject)
        .bind(entry.body.as_deref())
        .bind(entry.html_body.as_deref())
        .bind(entry.task_id.as_ref().map(|id| id.0.as_str()))
        .bind(entry.status.as_str())
        .bind(i64::from(entry.retry_count))
        .bind(i64::from(entry.max_retries))
        .bind(entry.last_error.as_deref())
        .bind(timestamp(entry.scheduled_at))
        .bind(optional_timestamp(entry.sent_at))
        .bind(optional_timestamp(entry.failed_at))
        .bind(timestamp(entry.updated_at))
        .bind(&entry.id.0)
        .bind(previous.status.as_str())
        .bind(timestamp(previous.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_transition(&self, transition: QueueTransition) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO email_queue_transition (
                id,
                queue_id,
                from_status,
                to_status,
                reason,
                context_json,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&transition.id)
        .bind(&transition.queue_id.0)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(&transition.reason)
        .bind(&transition.context_json)
        .bind(timestamp(transition.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_transitions(
        &self,
        queue_id: &EmailQueueId,
    ) -> Result<Vec<QueueTransition>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, queue_id, from_status, to_status, reason, context_json, occurred_at
             FROM email_queue_transition
             WHERE queue_id = ?
             ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(&queue_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(transition_from_row).collect()
    }

    async fn list_by_status(
        &self,
        statuses: &[QueueStatus],
        limit: u32,
    ) -> Result<Vec<EmailQueueEntry>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {QUEUE_COLUMNS}
             FROM email_queue
             WHERE status IN ({})
             ORDER BY scheduled_at ASC, created_at ASC
             LIMIT ?",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query.bind(i64::from(limit)).fetch_all(&self.pool).await?;
        rows.into_iter().map(entry_from_row).collect()
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
    ) -> Result<Vec<EmailQueueEntry>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM email_queue WHERE lead_id = ? ORDER BY created_at ASC"
        ))
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    async fn outstanding_lead_ids(&self) -> Result<HashSet<LeadId>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT lead_id FROM email_queue WHERE {OUTSTANDING_QUEUE_ROW}"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(LeadId(row.try_get::<String, _>("lead_id")?)))
            .collect()
    }

    async fn count_outstanding(&self) -> Result<u32, RepositoryError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM email_queue WHERE {OUTSTANDING_QUEUE_ROW}"
        ))
        .fetch_one(&self.pool)
        .await?;

        parse_u32("outstanding", count)
    }

    async fn summary(&self) -> Result<QueueSummary, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'sent' THEN 1 ELSE 0 END), 0) AS sent,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'failed' AND retry_count < max_retries
                    THEN 1 ELSE 0 END), 0) AS retryable,
                COALESCE(SUM(CASE WHEN status = 'failed' AND retry_count >= max_retries
                    THEN 1 ELSE 0 END), 0) AS permanently_failed,
                MIN(CASE WHEN status = 'pending' THEN scheduled_at END) AS oldest_pending_at
             FROM email_queue",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueSummary {
            pending: parse_u64("pending", row.try_get("pending")?)?,
            processing: parse_u64("processing", row.try_get("processing")?)?,
            sent: parse_u64("sent", row.try_get("sent")?)?,
            failed: parse_u64("failed", row.try_get("failed")?)?,
            retryable: parse_u64("retryable", row.try_get("retryable")?)?,
            permanently_failed: parse_u64(
                "permanently_failed",
                row.try_get("permanently_failed")?,
            )?,
            oldest_pending_at: parse_optional_timestamp(
                "oldest_pending_at",
                row.try_get("oldest_pending_at")?,
            )?,
        })
    }
}

fn entry_from_row(row: SqliteRow) -> Result<EmailQueueEntry, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = QueueStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown queue status `{status_raw}`")))?;

    let kind_raw = row.try_get::<String, _>("kind")?;
    let kind = EmailKind::parse(&kind_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown email kind `{kind_raw}`")))?;

    Ok(EmailQueueEntry {
        id: EmailQueueId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        kind,
        sequence_step: parse_u32("sequence_step", row.try_get("sequence_step")?)?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        html_body: row.try_get("html_body")?,
        task_id: row.try_get::<Option<String>, _>("task_id")?.map(TaskId),
        status,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        max_retries: parse_u32("max_retries", row.try_get("max_retries")?)?,
        last_error: row.try_get("last_error")?,
        scheduled_at: parse_timestamp("scheduled_at", row.try_get("scheduled_at")?)?,
        sent_at: parse_optional_timestamp("sent_at", row.try_get("sent_at")?)?,
        failed_at: parse_optional_timestamp("failed_at", row.try_get("failed_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn transition_from_row(row: SqliteRow) -> Result<QueueTransition, RepositoryError> {
    let from_raw = row.try_get::<String, _>("from_status")?;
    let from = QueueStatus::parse(&from_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown from_status `{from_raw}`")))?;
    let to_raw = row.try_get::<String, _>("to_status")?;
    let to = QueueStatus::parse(&to_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown to_status `{to_raw}`")))?;

    Ok(QueueTransition {
        id: row.try_get("id")?,
        queue_id: EmailQueueId(row.try_get("queue_id")?),
        from,
        to,
        reason: row.try_get("reason")?,
        context_json: row.try_get("context_json")?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use cadence_core::chrono::{DateTime, Duration, TimeZone, Utc};
    use cadence_core::delivery::{DeliveryEngine, RetryPolicy};
    use cadence_core::domain::email_queue::{EmailKind, QueueStatus, TaskId};
    use cadence_core::domain::lead::{Lead, LeadId};

    use super::SqlEmailQueueRepository;
    use crate::repositories::{EmailQueueRepository, LeadRepository, SqlLeadRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).single().expect("valid instant")
            + Duration::minutes(minutes)
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn insert_lead(pool: &DbPool, id: &str) -> LeadId {
        let lead = Lead::new(LeadId(id.to_string()), format!("{id}@acme.io"), at(0));
        SqlLeadRepository::new(pool.clone()).save(lead.clone()).await.expect("insert lead");
        lead.id
    }

    #[tokio::test]
    async fn queue_row_and_transitions_round_trip() {
        let pool = setup_pool().await;
        let lead_id = insert_lead(&pool, "ada").await;
        let repo = SqlEmailQueueRepository::new(pool.clone());
        let engine = DeliveryEngine::new();

        let entry = engine.create_entry(lead_id.clone(), EmailKind::Initial, 1, "Hello", at(0));
        repo.save(entry.clone()).await.expect("save pending");
        assert_eq!(repo.find_by_id(&entry.id).await.expect("find"), Some(entry.clone()));

        let claimed = engine
            .claim(entry.clone(), Some(TaskId("task-1".to_string())), at(1))
            .expect("claim");
        assert!(repo.compare_and_save(&entry, claimed.entry.clone()).await.expect("claim write"));
        repo.append_transition(claimed.transition.clone()).await.expect("append");

        let failed = engine
            .mark_failed(claimed.entry.clone(), "smtp timeout", RetryPolicy::Retry, at(2))
            .expect("fail");
        repo.save(failed.entry.clone()).await.expect("save failed");
        repo.append_transition(failed.transition.clone()).await.expect("append");

        let stored = repo.find_by_id(&entry.id).await.expect("find").expect("row");
        assert_eq!(stored.status, QueueStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("smtp timeout"));
        assert_eq!(stored.task_id, Some(TaskId("task-1".to_string())));

        let transitions = repo.list_transitions(&entry.id).await.expect("transitions");
        assert_eq!(transitions, vec![claimed.transition, failed.transition]);

        pool.close().await;
    }

    #[tokio::test]
    async fn compare_and_save_rejects_a_second_claim() {
        let pool = setup_pool().await;
        let lead_id = insert_lead(&pool, "grace").await;
        let repo = SqlEmailQueueRepository::new(pool.clone());
        let engine = DeliveryEngine::new();

        let entry = engine.create_entry(lead_id, EmailKind::Initial, 1, "Hello", at(0));
        repo.save(entry.clone()).await.expect("save pending");

        let first = engine.claim(entry.clone(), None, at(1)).expect("claim");
        let second = engine.claim(entry.clone(), None, at(2)).expect("claim");
        assert!(repo.compare_and_save(&entry, first.entry).await.expect("first write"));
        assert!(!repo.compare_and_save(&entry, second.entry).await.expect("second write"));

        pool.close().await;
    }

    #[tokio::test]
    async fn summary_and_outstanding_reflect_row_states() {
        let pool = setup_pool().await;
        let ada = insert_lead(&pool, "ada").await;
        let grace = insert_lead(&pool, "grace").await;
        let repo = SqlEmailQueueRepository::new(pool.clone());
        let engine = DeliveryEngine::new();

        let pending = engine.create_entry(ada.clone(), EmailKind::Initial, 1, "Hi", at(5));
        repo.save(pending.clone()).await.expect("save");

        let mut sent = engine.create_entry(grace.clone(), EmailKind::Initial, 1, "Hi", at(0));
        sent.status = QueueStatus::Sent;
        sent.sent_at = Some(at(1));
        repo.save(sent).await.expect("save");

        let linus = insert_lead(&pool, "linus").await;
        let mut exhausted = engine.create_entry(linus.clone(), EmailKind::FollowUp, 2, "Hi", at(0));
        exhausted.status = QueueStatus::Failed;
        exhausted.retry_count = 3;
        repo.save(exhausted).await.expect("save");

        let mut retryable = engine.create_entry(grace.clone(), EmailKind::FollowUp, 2, "Hi", at(0));
        retryable.status = QueueStatus::Failed;
        retryable.retry_count = 1;
        repo.save(retryable).await.expect("save");

        let summary = repo.summary().await.expect("summary");
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.processing, 0);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.retryable, 1);
        assert_eq!(summary.permanently_failed, 1);
        assert_eq!(summary.oldest_pending_at, Some(at(5)));

        let outstanding = repo.outstanding_lead_ids().await.expect("outstanding");
        assert!(outstanding.contains(&ada));
        assert!(outstanding.contains(&grace), "a failed row with retries left is still live");
        assert!(!outstanding.contains(&linus));
        assert_eq!(repo.count_outstanding().await.expect("count"), 2);

        let failed = repo.list_by_status(&[QueueStatus::Failed], 10).await.expect("list");
        assert_eq!(failed.len(), 2);
        assert_eq!(repo.list_for_lead(&grace).await.expect("for lead").len(), 2);

        pool.close().await;
    }

    #[tokio::test]
    async fn empty_queue_summary_is_all_zero() {
        let pool = setup_pool().await;
        let repo = SqlEmailQueueRepository::new(pool.clone());
        let summary = repo.summary().await.expect("summary");
        assert_eq!(summary, Default::default());
        pool.close().await;
    }
}
