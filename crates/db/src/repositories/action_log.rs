use std::collections::BTreeMap;

use cadence_core::chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use cadence_core::domain::action_log::{
    ActionLogId, ActionLogQuery, ActionResult, ActionStatistics, ActionType, AgentActionLog,
};
use cadence_core::domain::lead::LeadId;

use super::rows::{parse_timestamp, parse_u32, parse_u64, timestamp, to_i64};
use super::{ActionLogRepository, RepositoryError};
use crate::DbPool;

const ACTION_LOG_COLUMNS: &str = "id,
    action_type,
    action_result,
    lead_id,
    lead_email,
    decision_reason,
    metadata_json,
    error_message,
    execution_time_ms,
    agent_run_id,
    emails_sent_before,
    occurred_at";

pub struct SqlActionLogRepository {
    pool: DbPool,
}

impl SqlActionLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// WHERE clause plus its bind values, in order.
fn filter_clause(query: &ActionLogQuery) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(action_type) = query.action_type {
        clauses.push("action_type = ?");
        binds.push(action_type.as_str().to_string());
    }
    if let Some(lead_id) = &query.lead_id {
        clauses.push("lead_id = ?");
        binds.push(lead_id.0.clone());
    }
    if let Some(run_id) = &query.run_id {
        clauses.push("agent_run_id = ?");
        binds.push(run_id.clone());
    }

    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), binds)
    }
}

#[async_trait::async_trait]
impl ActionLogRepository for SqlActionLogRepository {
    async fn append(&self, entry: AgentActionLog) -> Result<(), RepositoryError> {
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(|error| RepositoryError::Decode(format!("metadata encode: {error}")))?;

        sqlx::query(
            "INSERT INTO agent_action_log (
                id,
                action_type,
                action_result,
                lead_id,
                lead_email,
                decision_reason,
                metadata_json,
                error_message,
                execution_time_ms,
                agent_run_id,
                emails_sent_before,
                occurred_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id.0)
        .bind(entry.action_type.as_str())
        .bind(entry.action_result.as_str())
        .bind(entry.lead_id.as_ref().map(|id| id.0.as_str()))
        .bind(entry.lead_email.as_deref())
        .bind(entry.decision_reason.as_deref())
        .bind(metadata_json)
        .bind(entry.error_message.as_deref())
        .bind(entry.execution_time_ms.map(to_i64))
        .bind(entry.agent_run_id.as_deref())
        .bind(entry.emails_sent_before.map(i64::from))
        .bind(timestamp(entry.occurred_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list(&self, query: &ActionLogQuery) -> Result<Vec<AgentActionLog>, RepositoryError> {
        let (filter, binds) = filter_clause(query);
        let sql = format!(
            "SELECT {ACTION_LOG_COLUMNS}
             FROM agent_action_log
             {filter}
             ORDER BY occurred_at DESC, rowid DESC
             LIMIT ? OFFSET ?"
        );

        let mut statement = sqlx::query(&sql);
        for value in &binds {
            statement = statement.bind(value);
        }
        let rows = statement
            .bind(i64::from(query.limit))
            .bind(i64::from(query.offset))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(action_log_from_row).collect()
    }

    async fn count(&self, query: &ActionLogQuery) -> Result<u64, RepositoryError> {
        let (filter, binds) = filter_clause(query);
        let sql = format!("SELECT COUNT(*) AS total FROM agent_action_log {filter}");

        let mut statement = sqlx::query(&sql);
        for value in &binds {
            statement = statement.bind(value);
        }
        let row = statement.fetch_one(&self.pool).await?;
        parse_u64("total", row.try_get("total")?)
    }

    async fn statistics(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<ActionStatistics, RepositoryError> {
        let since = since.map(timestamp);

        let type_rows = sqlx::query(
            "SELECT action_type AS bucket, COUNT(*) AS total
             FROM agent_action_log
             WHERE ? IS NULL OR occurred_at >= ?
             GROUP BY action_type",
        )
        .bind(since.as_deref())
        .bind(since.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let result_rows = sqlx::query(
            "SELECT action_result AS bucket, COUNT(*) AS total
             FROM agent_action_log
             WHERE ? IS NULL OR occurred_at >= ?
             GROUP BY action_result",
        )
        .bind(since.as_deref())
        .bind(since.as_deref())
        .fetch_all(&self.pool)
        .await?;

        Ok(ActionStatistics::from_counts(bucket_counts(type_rows)?, bucket_counts(result_rows)?))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM agent_action_log WHERE occurred_at < ?")
            .bind(timestamp(cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn bucket_counts(rows: Vec<SqliteRow>) -> Result<BTreeMap<String, u64>, RepositoryError> {
    rows.into_iter()
        .map(|row| {
            let bucket = row.try_get::<String, _>("bucket")?;
            let total = parse_u64("total", row.try_get("total")?)?;
            Ok((bucket, total))
        })
        .collect()
}

fn action_log_from_row(row: SqliteRow) -> Result<AgentActionLog, RepositoryError> {
    let type_raw = row.try_get::<String, _>("action_type")?;
    let action_type = ActionType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action type `{type_raw}`")))?;

    let result_raw = row.try_get::<String, _>("action_result")?;
    let action_result = ActionResult::parse(&result_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown action result `{result_raw}`")))?;

    let metadata_json = row.try_get::<String, _>("metadata_json")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid metadata_json: {error}")))?;

    Ok(AgentActionLog {
        id: ActionLogId(row.try_get("id")?),
        action_type,
        action_result,
        lead_id: row.try_get::<Option<String>, _>("lead_id")?.map(LeadId),
        lead_email: row.try_get("lead_email")?,
        decision_reason: row.try_get("decision_reason")?,
        metadata,
        error_message: row.try_get("error_message")?,
        execution_time_ms: row
            .try_get::<Option<i64>, _>("execution_time_ms")?
            .map(|value| parse_u64("execution_time_ms", value))
            .transpose()?,
        agent_run_id: row.try_get("agent_run_id")?,
        emails_sent_before: row
            .try_get::<Option<i64>, _>("emails_sent_before")?
            .map(|value| parse_u32("emails_sent_before", value))
            .transpose()?,
        occurred_at: parse_timestamp("occurred_at", row.try_get("occurred_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use cadence_core::chrono::{DateTime, Duration, TimeZone, Utc};
    use cadence_core::domain::action_log::{
        ActionLogQuery, ActionResult, ActionType, AgentActionLog,
    };
    use cadence_core::domain::lead::{Lead, LeadId};

    use super::SqlActionLogRepository;
    use crate::repositories::ActionLogRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    fn at(days: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).single().expect("valid instant")
            + Duration::days(days)
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    #[tokio::test]
    async fn entries_round_trip_newest_first_with_filters() {
        let pool = setup_pool().await;
        let repo = SqlActionLogRepository::new(pool.clone());
        let lead = Lead::new(LeadId("L-1".to_string()), "ada@acme.io", at(0));

        let first = AgentActionLog::new(ActionType::SendInitialEmail, ActionResult::Success, at(0))
            .for_lead(&lead)
            .with_run("run-a")
            .with_emails_sent_before(4)
            .with_execution_time_ms(12)
            .with_metadata("priority", "7.5");
        let second = AgentActionLog::new(ActionType::Skip, ActionResult::Skipped, at(1))
            .with_reason("Lead is manually paused")
            .with_run("run-b");
        let third = AgentActionLog::new(ActionType::Cycle, ActionResult::Success, at(2));

        for entry in [first.clone(), second.clone(), third.clone()] {
            repo.append(entry).await.expect("append");
        }

        let all = repo.list(&ActionLogQuery::default()).await.expect("list");
        assert_eq!(all, vec![third, second.clone(), first.clone()]);

        let by_run = ActionLogQuery { run_id: Some("run-a".to_string()), ..Default::default() };
        assert_eq!(repo.list(&by_run).await.expect("list"), vec![first.clone()]);

        let by_type = ActionLogQuery { action_type: Some(ActionType::Skip), ..Default::default() };
        assert_eq!(repo.count(&by_type).await.expect("count"), 1);

        let by_lead = ActionLogQuery { lead_id: Some(lead.id.clone()), ..Default::default() };
        assert_eq!(repo.list(&by_lead).await.expect("list"), vec![first]);

        let paged = ActionLogQuery { limit: 1, offset: 1, ..Default::default() };
        assert_eq!(repo.list(&paged).await.expect("list"), vec![second]);
        assert_eq!(repo.count(&ActionLogQuery::default()).await.expect("count"), 3);

        pool.close().await;
    }

    #[tokio::test]
    async fn statistics_group_by_type_and_result_within_window() {
        let pool = setup_pool().await;
        let repo = SqlActionLogRepository::new(pool.clone());

        repo.append(AgentActionLog::new(ActionType::Skip, ActionResult::Skipped, at(-10)))
            .await
            .expect("append");
        repo.append(AgentActionLog::new(ActionType::SendInitialEmail, ActionResult::Success, at(0)))
            .await
            .expect("append");
        repo.append(AgentActionLog::new(ActionType::Error, ActionResult::Failure, at(0)))
            .await
            .expect("append");

        let all_time = repo.statistics(None).await.expect("stats");
        assert_eq!(all_time.total_actions, 3);

        let recent = repo.statistics(Some(at(-1))).await.expect("stats");
        assert_eq!(recent.total_actions, 2);
        assert_eq!(recent.by_type.get("send_initial_email"), Some(&1));
        assert_eq!(recent.by_result.get("failure"), Some(&1));
        assert!((recent.success_rate_pct - 50.0).abs() < f64::EPSILON);

        pool.close().await;
    }

    #[tokio::test]
    async fn prune_removes_only_entries_older_than_cutoff() {
        let pool = setup_pool().await;
        let repo = SqlActionLogRepository::new(pool.clone());

        repo.append(AgentActionLog::new(ActionType::Cycle, ActionResult::Success, at(-100)))
            .await
            .expect("append");
        repo.append(AgentActionLog::new(ActionType::Cycle, ActionResult::Success, at(-5)))
            .await
            .expect("append");

        let removed = repo.prune_before(at(-90)).await.expect("prune");
        assert_eq!(removed, 1);
        assert_eq!(repo.count(&ActionLogQuery::default()).await.expect("count"), 1);

        pool.close().await;
    }
}
