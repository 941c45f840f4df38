use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::domain::email_log::{EmailLogEntry, EmailLogId, EmailLogStatus};
use cadence_core::domain::email_queue::EmailQueueId;
use cadence_core::domain::lead::LeadId;

use super::rows::{parse_timestamp, timestamp};
use super::{EmailLogRepository, RepositoryError};
use crate::DbPool;

pub struct SqlEmailLogRepository {
    pool: DbPool,
}

impl SqlEmailLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl EmailLogRepository for SqlEmailLogRepository {
    async fn append(&self, entry: EmailLogEntry) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO email_log (
                id,
                lead_id,
                queue_id,
                recipient,
                subject,
                body,
                status,
                error_message,
                attempted_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(&entry.lead_id.0)
        .bind(entry.queue_id.as_ref().map(|id| id.0.as_str()))
        .bind(&entry.recipient)
        .bind(&entry.subject)
        .bind(entry.body.as_deref())
        .bind(entry.status.as_str())
        .bind(entry.error_message.as_deref())
        .bind(timestamp(entry.attempted_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_lead(
        &self,
        lead_id: &LeadId,
        limit: u32,
    ) -> Result<Vec<EmailLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, lead_id, queue_id, recipient, subject, body, status, error_message,
                    attempted_at
             FROM email_log
             WHERE lead_id = ?
             ORDER BY attempted_at DESC, rowid DESC
             LIMIT ?",
        )
        .bind(&lead_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(email_log_from_row).collect()
    }
}

fn email_log_from_row(row: SqliteRow) -> Result<EmailLogEntry, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = EmailLogStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown email log status `{status_raw}`")))?;

    Ok(EmailLogEntry {
        id: EmailLogId(row.try_get("id")?),
        lead_id: LeadId(row.try_get("lead_id")?),
        queue_id: row.try_get::<Option<String>, _>("queue_id")?.map(EmailQueueId),
        recipient: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        status,
        error_message: row.try_get("error_message")?,
        attempted_at: parse_timestamp("attempted_at", row.try_get("attempted_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use cadence_core::chrono::{Duration, TimeZone, Utc};
    use cadence_core::domain::email_log::{EmailLogEntry, EmailLogStatus};
    use cadence_core::domain::lead::{Lead, LeadId};

    use super::SqlEmailLogRepository;
    use crate::repositories::{EmailLogRepository, LeadRepository, SqlLeadRepository};
    use crate::{connect_with_settings, migrations};

    #[tokio::test]
    async fn attempts_are_listed_newest_first_per_lead() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        let now = Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).single().expect("valid instant");
        let lead = Lead::new(LeadId("L-1".to_string()), "ada@acme.io", now);
        SqlLeadRepository::new(pool.clone()).save(lead.clone()).await.expect("save lead");

        let repo = SqlEmailLogRepository::new(pool.clone());
        let failed = EmailLogEntry::failed(
            lead.id.clone(),
            None,
            &lead.email,
            "Quick introduction",
            "smtp timeout",
            now,
        );
        let sent = EmailLogEntry::sent(
            lead.id.clone(),
            None,
            &lead.email,
            "Quick introduction",
            Some("Hi Ada".to_string()),
            now + Duration::minutes(5),
        );
        repo.append(failed.clone()).await.expect("append");
        repo.append(sent.clone()).await.expect("append");

        let entries = repo.list_for_lead(&lead.id, 10).await.expect("list");
        assert_eq!(entries, vec![sent, failed]);
        assert_eq!(entries[1].status, EmailLogStatus::Failed);

        let limited = repo.list_for_lead(&lead.id, 1).await.expect("list");
        assert_eq!(limited.len(), 1);

        pool.close().await;
    }
}
