use std::collections::BTreeMap;

use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::domain::lead::{ContentVariant, Lead, LeadId, LeadStatus};

use super::rows::{
    optional_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, placeholders,
    timestamp, OUTSTANDING_QUEUE_ROW,
};
use super::{LeadRepository, RepositoryError};
use crate::DbPool;

const LEAD_COLUMNS: &str = "id,
    email,
    first_name,
    last_name,
    company,
    industry,
    status,
    sequence_step,
    follow_up_count,
    max_follow_ups,
    days_between_followups,
    next_agent_check_at,
    last_email_sent_at,
    last_agent_action_at,
    priority_score,
    engagement_score,
    bounce_count,
    error_count,
    last_error_message,
    agent_enabled,
    agent_paused,
    replied,
    reply_received_at,
    agent_notes,
    content_variant,
    created_at,
    updated_at";

pub struct SqlLeadRepository {
    pool: DbPool,
}

impl SqlLeadRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LeadRepository for SqlLeadRepository {
    async fn find_by_id(&self, id: &LeadId) -> Result<Option<Lead>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(lead_from_row).transpose()
    }

    async fn find_by_email(
        &self,
        email: &str,
        statuses: &[LeadStatus],
    ) -> Result<Option<Lead>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {LEAD_COLUMNS}
             FROM lead
             WHERE lower(email) = ? AND status IN ({})
             ORDER BY updated_at DESC
             LIMIT 1",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query(&sql).bind(email.trim().to_ascii_lowercase());
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let row = query.fetch_optional(&self.pool).await?;
        row.map(lead_from_row).transpose()
    }

    async fn list_candidates(&self, limit: u32) -> Result<Vec<Lead>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS}
             FROM lead
             WHERE agent_enabled = 1
               AND agent_paused = 0
               AND status IN ('new', 'contacted', 'follow_up')
               AND NOT EXISTS (
                   SELECT 1 FROM email_queue
                   WHERE email_queue.lead_id = lead.id
                     AND {OUTSTANDING_QUEUE_ROW}
               )
             ORDER BY priority_score DESC, next_agent_check_at ASC
             LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(lead_from_row).collect()
    }

    async fn list(
        &self,
        status: Option<LeadStatus>,
        limit: u32,
    ) -> Result<Vec<Lead>, RepositoryError> {
        let rows = if let Some(status) = status {
            sqlx::query(&format!(
                "SELECT {LEAD_COLUMNS} FROM lead WHERE status = ? ORDER BY created_at ASC LIMIT ?"
            ))
            .bind(status.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!("SELECT {LEAD_COLUMNS} FROM lead ORDER BY created_at ASC LIMIT ?"))
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
        };

        rows.into_iter().map(lead_from_row).collect()
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>, RepositoryError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM lead GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let count = row.try_get::<i64, _>("count")?;
            counts.insert(row.try_get::<String, _>("status")?, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn save(&self, lead: Lead) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO lead (
                id,
                email,
                first_name,
                last_name,
                company,
                industry,
                status,
                sequence_step,
                follow_up_count,
                max_follow_ups,
                days_between_followups,
                next_agent_check_at,
                last_email_sent_at,
                last_agent_action_at,
                priority_score,
                engagement_score,
                bounce_count,
                error_count,
                last_error_message,
                agent_enabled,
                agent_paused,
                replied,
                reply_received_at,
                agent_notes,
                content_variant,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                company = excluded.company,
                industry = excluded.industry,
                status = excluded.status,
                sequence_step = excluded.sequence_step,
                follow_up_count = excluded.follow_up_count,
                max_follow_ups = excluded.max_follow_ups,
                days_between_followups = excluded.days_between_followups,
                next_agent_check_at = excluded.next_agent_check_at,
                last_email_sent_at = excluded.last_email_sent_at,
                last_agent_action_at = excluded.last_agent_action_at,
                priority_score = excluded.priority_score,
                engagement_score = excluded.engagement_score,
                bounce_count = excluded.bounce_count,
                error_count = excluded.error_count,
                last_error_message = excluded.last_error_message,
                agent_enabled = excluded.agent_enabled,
                agent_paused = excluded.agent_paused,
                replied = excluded.replied,
                reply_received_at = excluded.reply_received_at,
                agent_notes = excluded.agent_notes,
                content_variant = excluded.content_variant,
                updated_at = excluded.updated_at",
        )
        .bind(&lead.id.0)
        .bind(&lead.email)
        .bind(lead.first_name.as_deref())
        .bind(lead.last_name.as_deref())
        .bind(lead.company.as_deref())
        .bind(lead.industry.as_deref())
        .bind(lead.status.as_str())
        .bind(i64::from(lead.sequence_step))
        .bind(i64::from(lead.follow_up_count))
        .bind(i64::from(lead.max_follow_ups))
        .bind(i64::from(lead.days_between_followups))
        .bind(optional_timestamp(lead.next_agent_check_at))
        .bind(optional_timestamp(lead.last_email_sent_at))
        .bind(optional_timestamp(lead.last_agent_action_at))
        .bind(lead.priority_score)
        .bind(lead.engagement_score)
        .bind(i64::from(lead.bounce_count))
        .bind(i64::from(lead.error_count))
        .bind(lead.last_error_message.as_deref())
        .bind(lead.agent_enabled)
        .bind(lead.agent_paused)
        .bind(lead.replied)
        .bind(optional_timestamp(lead.reply_received_at))
        .bind(lead.agent_notes.as_deref())
        .bind(lead.content_variant.as_ref().map(ContentVariant::as_str))
        .bind(timestamp(lead.created_at))
        .bind(timestamp(lead.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn compare_and_save(&self, previous: &Lead, lead: Lead) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE lead SET
                email = ?,
                first_name = ?,
                last_name = ?,
                company = ?,
                industry = ?,
                status = ?,
                sequence_step = ?,
                follow_up_count = ?,
                max_follow_ups = ?,
                days_between_followups = ?,
                next_agent_check_at = ?,
                last_email_sent_at = ?,
                last_agent_action_at = ?,
                priority_score = ?,
                engagement_score = ?,
                bounce_count = ?,
                error_count = ?,
                last_error_message = ?,
                agent_enabled = ?,
                agent_paused = ?,
                replied = ?,
                reply_received_at = ?,
                agent_notes = ?,
                content_variant = ?,
                updated_at = ?
             WHERE id = ?
               AND status = ?
               AND updated_at = ?
               AND sequence_step = ?
               AND follow_up_count = ?
               AND bounce_count = ?
               AND error_count = ?
               AND agent_enabled = ?
               AND agent_paused = ?
               AND replied = ?
               AND content_variant IS ?",
        )
        .bind(&lead.email)
        .bind(lead.first_name.as_deref())
        .bind(lead.last_name.as_deref())
        .bind(lead.company.as_deref())
        .bind(lead.industry.as_deref())
        .bind(lead.status.as_str())
        .bind(i64::from(lead.sequence_step))
        .bind(i64::from(lead.follow_up_count))
        .bind(i64::from(lead.max_follow_ups))
        .bind(i64::from(lead.days_between_followups))
        .bind(optional_timestamp(lead.next_agent_check_at))
        .bind(optional_timestamp(lead.last_email_sent_at))
        .bind(optional_timestamp(lead.last_agent_action_at))
        .bind(lead.priority_score)
        .bind(lead.engagement_score)
        .bind(i64::from(lead.bounce_count))
        .bind(i64::from(lead.error_count))
        .bind(lead.last_error_message.as_deref())
        .bind(lead.agent_enabled)
        .bind(lead.agent_paused)
        .bind(lead.replied)
        .bind(optional_timestamp(lead.reply_received_at))
        .bind(lead.agent_notes.as_deref())
        .bind(lead.content_variant.as_ref().map(ContentVariant::as_str))
        .bind(timestamp(lead.updated_at))
        .bind(&lead.id.0)
        .bind(previous.status.as_str())
        .bind(timestamp(previous.updated_at))
        .bind(i64::from(previous.sequence_step))
        .bind(i64::from(previous.follow_up_count))
        .bind(i64::from(previous.bounce_count))
        .bind(i64::from(previous.error_count))
        .bind(previous.agent_enabled)
        .bind(previous.agent_paused)
        .bind(previous.replied)
        .bind(previous.content_variant.as_ref().map(ContentVariant::as_str))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn lead_from_row(row: SqliteRow) -> Result<Lead, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = LeadStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown lead status `{status_raw}`")))?;

    let content_variant = row
        .try_get::<Option<String>, _>("content_variant")?
        .map(|value| {
            ContentVariant::parse(&value).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown content variant `{value}`"))
            })
        })
        .transpose()?;

    Ok(Lead {
        id: LeadId(row.try_get("id")?),
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        company: row.try_get("company")?,
        industry: row.try_get("industry")?,
        status,
        sequence_step: parse_u32("sequence_step", row.try_get("sequence_step")?)?,
        follow_up_count: parse_u32("follow_up_count", row.try_get("follow_up_count")?)?,
        max_follow_ups: parse_u32("max_follow_ups", row.try_get("max_follow_ups")?)?,
        days_between_followups: parse_u32(
            "days_between_followups",
            row.try_get("days_between_followups")?,
        )?,
        next_agent_check_at: parse_optional_timestamp(
            "next_agent_check_at",
            row.try_get("next_agent_check_at")?,
        )?,
        last_email_sent_at: parse_optional_timestamp(
            "last_email_sent_at",
            row.try_get("last_email_sent_at")?,
        )?,
        last_agent_action_at: parse_optional_timestamp(
            "last_agent_action_at",
            row.try_get("last_agent_action_at")?,
        )?,
        priority_score: row.try_get("priority_score")?,
        engagement_score: row.try_get("engagement_score")?,
        bounce_count: parse_u32("bounce_count", row.try_get("bounce_count")?)?,
        error_count: parse_u32("error_count", row.try_get("error_count")?)?,
        last_error_message: row.try_get("last_error_message")?,
        agent_enabled: row.try_get("agent_enabled")?,
        agent_paused: row.try_get("agent_paused")?,
        replied: row.try_get("replied")?,
        reply_received_at: parse_optional_timestamp(
            "reply_received_at",
            row.try_get("reply_received_at")?,
        )?,
        agent_notes: row.try_get("agent_notes")?,
        content_variant,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
