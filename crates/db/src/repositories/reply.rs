use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::domain::lead::LeadId;
use cadence_core::domain::reply::{EmailReply, EmailReplyId, ReplyClass};

use super::rows::{parse_timestamp, timestamp};
use super::{ReplyRepository, RepositoryError};
use crate::DbPool;

const REPLY_COLUMNS: &str = "id,
    lead_id,
    from_email,
    to_email,
    subject,
    body,
    message_id,
    in_reply_to,
    classification,
    received_at,
    processed_at";

pub struct SqlReplyRepository {
    pool: DbPool,
}

impl SqlReplyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReplyRepository for SqlReplyRepository {
    async fn save(&self, reply: EmailReply) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO email_reply (
                id,
                lead_id,
                from_email,
                to_email,
                subject,
                body,
                message_id,
                in_reply_to,
                classification,
                received_at,
                processed_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                lead_id = excluded.lead_id,
                classification = excluded.classification,
                processed_at = excluded.processed_at",
        )
        .bind(&reply.id.0)
        .bind(reply.lead_id.as_ref().map(|id| id.0.as_str()))
        .bind(&reply.from_email)
        .bind(reply.to_email.as_deref())
        .bind(&reply.subject)
        .bind(&reply.body)
        .bind(reply.message_id.as_deref())
        .bind(reply.in_reply_to.as_deref())
        .bind(reply.classification.as_str())
        .bind(timestamp(reply.received_at))
        .bind(timestamp(reply.processed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn exists_message_id(&self, message_id: &str) -> Result<bool, RepositoryError> {
        let row = sqlx::query("SELECT 1 AS found FROM email_reply WHERE message_id = ? LIMIT 1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn list_for_lead(&self, lead_id: &LeadId) -> Result<Vec<EmailReply>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REPLY_COLUMNS} FROM email_reply WHERE lead_id = ? ORDER BY received_at ASC"
        ))
        .bind(&lead_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(reply_from_row).collect()
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<EmailReply>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {REPLY_COLUMNS} FROM email_reply ORDER BY received_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(reply_from_row).collect()
    }
}

fn reply_from_row(row: SqliteRow) -> Result<EmailReply, RepositoryError> {
    let class_raw = row.try_get::<String, _>("classification")?;
    let classification = ReplyClass::parse(&class_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown classification `{class_raw}`")))?;

    Ok(EmailReply {
        id: EmailReplyId(row.try_get("id")?),
        lead_id: row.try_get::<Option<String>, _>("lead_id")?.map(LeadId),
        from_email: row.try_get("from_email")?,
        to_email: row.try_get("to_email")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        message_id: row.try_get("message_id")?,
        in_reply_to: row.try_get("in_reply_to")?,
        classification,
        received_at: parse_timestamp("received_at", row.try_get("received_at")?)?,
        processed_at: parse_timestamp("processed_at", row.try_get("processed_at")?)?,
    })
}
