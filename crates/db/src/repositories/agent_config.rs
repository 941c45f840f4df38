use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::chrono::{DateTime, Duration, Utc};
use cadence_core::domain::agent_config::{
    decode_weekdays, encode_weekdays, AgentConfig, WindowReset,
};

use super::rows::{
    optional_timestamp, parse_optional_date, parse_optional_timestamp, parse_timestamp,
    parse_u32, parse_u64, timestamp,
};
use super::{AgentConfigRepository, RepositoryError};
use crate::DbPool;

const SINGLETON_ID: i64 = 1;

pub struct SqlAgentConfigRepository {
    pool: DbPool,
}

impl SqlAgentConfigRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AgentConfigRepository for SqlAgentConfigRepository {
    async fn load(&self) -> Result<Option<AgentConfig>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                is_running,
                is_paused,
                daily_email_limit,
                hourly_email_limit,
                emails_sent_today,
                emails_sent_this_hour,
                last_reset_date,
                last_hour_reset,
                business_hours_start,
                business_hours_end,
                timezone,
                active_weekdays,
                respect_business_hours,
                respect_unsubscribes,
                pause_on_high_error_rate,
                error_rate_threshold,
                agent_check_interval_minutes,
                inbox_check_interval_minutes,
                total_emails_sent,
                total_errors,
                total_replies_received,
                agent_started_at,
                agent_stopped_at,
                last_agent_run_at,
                next_agent_run_at,
                updated_at
             FROM agent_config
             WHERE id = ?",
        )
        .bind(SINGLETON_ID)
        .fetch_optional(&self.pool)
        .await?;

        row.map(config_from_row).transpose()
    }

    async fn ensure(&self, now: DateTime<Utc>) -> Result<AgentConfig, RepositoryError> {
        sqlx::query("INSERT OR IGNORE INTO agent_config (id, updated_at) VALUES (?, ?)")
            .bind(SINGLETON_ID)
            .bind(timestamp(now))
            .execute(&self.pool)
            .await?;

        self.load().await?.ok_or(RepositoryError::NotFound {
            entity: "agent_config",
            id: SINGLETON_ID.to_string(),
        })
    }

    async fn save_control(&self, config: &AgentConfig) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE agent_config SET
                is_running = ?,
                is_paused = ?,
                daily_email_limit = ?,
                hourly_email_limit = ?,
                business_hours_start = ?,
                business_hours_end = ?,
                timezone = ?,
                active_weekdays = ?,
                respect_business_hours = ?,
                respect_unsubscribes = ?,
                pause_on_high_error_rate = ?,
                error_rate_threshold = ?,
                agent_check_interval_minutes = ?,
                inbox_check_interval_minutes = ?,
                agent_started_at = ?,
                agent_stopped_at = ?,
                last_agent_run_at = ?,
                next_agent_run_at = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(config.is_running)
        .bind(config.is_paused)
        .bind(i64::from(config.daily_email_limit))
        .bind(i64::from(config.hourly_email_limit))
        .bind(&config.business_hours_start)
        .bind(&config.business_hours_end)
        .bind(&config.timezone)
        .bind(encode_weekdays(&config.active_weekdays))
        .bind(config.respect_business_hours)
        .bind(config.respect_unsubscribes)
        .bind(config.pause_on_high_error_rate)
        .bind(config.error_rate_threshold)
        .bind(i64::from(config.agent_check_interval_minutes))
        .bind(i64::from(config.inbox_check_interval_minutes))
        .bind(optional_timestamp(config.agent_started_at))
        .bind(optional_timestamp(config.agent_stopped_at))
        .bind(optional_timestamp(config.last_agent_run_at))
        .bind(optional_timestamp(config.next_agent_run_at))
        .bind(timestamp(config.updated_at))
        .bind(SINGLETON_ID)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "agent_config",
                id: SINGLETON_ID.to_string(),
            });
        }
        Ok(())
    }

    async fn apply_window_reset(&self, reset: &WindowReset) -> Result<(), RepositoryError> {
        if let Some(today) = reset.daily {
            let today = today.format("%Y-%m-%d").to_string();
            sqlx::query(
                "UPDATE agent_config
                 SET emails_sent_today = 0, last_reset_date = ?
                 WHERE id = ? AND (last_reset_date IS NULL OR last_reset_date <> ?)",
            )
            .bind(&today)
            .bind(SINGLETON_ID)
            .bind(&today)
            .execute(&self.pool)
            .await?;
        }

        if let Some(anchor) = reset.hourly {
            sqlx::query(
                "UPDATE agent_config
                 SET emails_sent_this_hour = 0, last_hour_reset = ?
                 WHERE id = ? AND (last_hour_reset IS NULL OR last_hour_reset <= ?)",
            )
            .bind(timestamp(anchor))
            .bind(SINGLETON_ID)
            .bind(timestamp(anchor - Duration::hours(1)))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn record_send_attempt(
        &self,
        success: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let today = now.date_naive().format("%Y-%m-%d").to_string();
        let hour_cutoff = timestamp(now - Duration::hours(1));
        let now_text = timestamp(now);

        // One statement so concurrent workers never lose an increment; expired windows
        // restart at this attempt.
        sqlx::query(
            "UPDATE agent_config SET
                emails_sent_today = CASE
                    WHEN last_reset_date = ? THEN emails_sent_today + 1 ELSE 1 END,
                last_reset_date = ?,
                emails_sent_this_hour = CASE
                    WHEN last_hour_reset IS NOT NULL AND last_hour_reset > ?
                    THEN emails_sent_this_hour + 1 ELSE 1 END,
                last_hour_reset = CASE
                    WHEN last_hour_reset IS NOT NULL AND last_hour_reset > ?
                    THEN last_hour_reset ELSE ? END,
                total_emails_sent = total_emails_sent + 1,
                total_errors = total_errors + ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(&today)
        .bind(&today)
        .bind(&hour_cutoff)
        .bind(&hour_cutoff)
        .bind(&now_text)
        .bind(if success { 0_i64 } else { 1_i64 })
        .bind(&now_text)
        .bind(SINGLETON_ID)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_reply(&self, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE agent_config
             SET total_replies_received = total_replies_received + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(timestamp(now))
        .bind(SINGLETON_ID)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_cycle(&self, ran_at: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE agent_config SET last_agent_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(timestamp(ran_at))
            .bind(timestamp(ran_at))
            .bind(SINGLETON_ID)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn schedule_next_run(
        &self,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE agent_config SET next_agent_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(optional_timestamp(next_run_at))
            .bind(timestamp(now))
            .bind(SINGLETON_ID)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn reset_counters(&self, now: DateTime<Utc>) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE agent_config SET
                emails_sent_today = 0,
                emails_sent_this_hour = 0,
                last_reset_date = ?,
                last_hour_reset = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(now.date_naive().format("%Y-%m-%d").to_string())
        .bind(timestamp(now))
        .bind(timestamp(now))
        .bind(SINGLETON_ID)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn config_from_row(row: SqliteRow) -> Result<AgentConfig, RepositoryError> {
    let weekdays_raw = row.try_get::<String, _>("active_weekdays")?;
    let active_weekdays = decode_weekdays(&weekdays_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("invalid active_weekdays `{weekdays_raw}`"))
    })?;

    Ok(AgentConfig {
        is_running: row.try_get("is_running")?,
        is_paused: row.try_get("is_paused")?,
        daily_email_limit: parse_u32("daily_email_limit", row.try_get("daily_email_limit")?)?,
        hourly_email_limit: parse_u32("hourly_email_limit", row.try_get("hourly_email_limit")?)?,
        emails_sent_today: parse_u32("emails_sent_today", row.try_get("emails_sent_today")?)?,
        emails_sent_this_hour: parse_u32(
            "emails_sent_this_hour",
            row.try_get("emails_sent_this_hour")?,
        )?,
        last_reset_date: parse_optional_date("last_reset_date", row.try_get("last_reset_date")?)?,
        last_hour_reset: parse_optional_timestamp(
            "last_hour_reset",
            row.try_get("last_hour_reset")?,
        )?,
        business_hours_start: row.try_get("business_hours_start")?,
        business_hours_end: row.try_get("business_hours_end")?,
        timezone: row.try_get("timezone")?,
        active_weekdays,
        respect_business_hours: row.try_get("respect_business_hours")?,
        respect_unsubscribes: row.try_get("respect_unsubscribes")?,
        pause_on_high_error_rate: row.try_get("pause_on_high_error_rate")?,
        error_rate_threshold: row.try_get("error_rate_threshold")?,
        agent_check_interval_minutes: parse_u32(
            "agent_check_interval_minutes",
            row.try_get("agent_check_interval_minutes")?,
        )?,
        inbox_check_interval_minutes: parse_u32(
            "inbox_check_interval_minutes",
            row.try_get("inbox_check_interval_minutes")?,
        )?,
        total_emails_sent: parse_u64("total_emails_sent", row.try_get("total_emails_sent")?)?,
        total_errors: parse_u64("total_errors", row.try_get("total_errors")?)?,
        total_replies_received: parse_u64(
            "total_replies_received",
            row.try_get("total_replies_received")?,
        )?,
        agent_started_at: parse_optional_timestamp(
            "agent_started_at",
            row.try_get("agent_started_at")?,
        )?,
        agent_stopped_at: parse_optional_timestamp(
            "agent_stopped_at",
            row.try_get("agent_stopped_at")?,
        )?,
        last_agent_run_at: parse_optional_timestamp(
            "last_agent_run_at",
            row.try_get("last_agent_run_at")?,
        )?,
        next_agent_run_at: parse_optional_timestamp(
            "next_agent_run_at",
            row.try_get("next_agent_run_at")?,
        )?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
