use sqlx::Executor;

use crate::connection::DbPool;
use crate::repositories::RepositoryError;

/// Expected state of each demo lead after loading.
const DEMO_LEADS: &[DemoLeadContract] = &[
    DemoLeadContract {
        lead_id: "lead-demo-new",
        email: "ada@analytical.example",
        status: "new",
        sequence_step: 0,
        agent_paused: false,
        expected_path: "initial email",
    },
    DemoLeadContract {
        lead_id: "lead-demo-followup",
        email: "grace@cobol.example",
        status: "contacted",
        sequence_step: 1,
        agent_paused: false,
        expected_path: "first follow-up once the wait has elapsed",
    },
    DemoLeadContract {
        lead_id: "lead-demo-exhausted",
        email: "alan@bletchley.example",
        status: "follow_up",
        sequence_step: 4,
        agent_paused: false,
        expected_path: "closed after the follow-up budget is spent",
    },
    DemoLeadContract {
        lead_id: "lead-demo-paused",
        email: "edsger@structured.example",
        status: "new",
        sequence_step: 0,
        agent_paused: true,
        expected_path: "skipped while manually paused",
    },
    DemoLeadContract {
        lead_id: "lead-demo-replied",
        email: "barbara@clu.example",
        status: "interested",
        sequence_step: 1,
        agent_paused: false,
        expected_path: "never contacted again after replying",
    },
];

/// Deterministic leads for local runs and smoke checks.
pub struct DemoLeadDataset;

impl DemoLeadDataset {
    pub const SQL: &str = include_str!("../../../config/fixtures/demo_leads.sql");

    pub async fn load(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let mut tx = pool.begin().await?;
        tx.execute(sqlx::query(Self::SQL)).await?;
        tx.commit().await?;

        let leads_seeded = DEMO_LEADS
            .iter()
            .map(|lead| LeadSeedInfo {
                lead_id: lead.lead_id,
                email: lead.email,
                expected_path: lead.expected_path,
            })
            .collect();

        Ok(SeedResult { leads_seeded })
    }

    /// Checks that every demo lead is present in its seeded state.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        for lead in DEMO_LEADS {
            let present: i64 = sqlx::query_scalar(
                "SELECT EXISTS(
                    SELECT 1 FROM lead
                    WHERE id = ?1 AND email = ?2 AND status = ?3
                      AND sequence_step = ?4 AND agent_paused = ?5
                 )",
            )
            .bind(lead.lead_id)
            .bind(lead.email)
            .bind(lead.status)
            .bind(lead.sequence_step)
            .bind(lead.agent_paused)
            .fetch_one(pool)
            .await?;
            checks.push((lead.lead_id, present == 1));
        }

        let all_present = checks.iter().all(|(_, ok)| *ok);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the demo leads; queue, log and reply rows go with them.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        for lead in DEMO_LEADS {
            sqlx::query("DELETE FROM agent_action_log WHERE lead_id = ?")
                .bind(lead.lead_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM lead WHERE id = ?").bind(lead.lead_id).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct DemoLeadContract {
    lead_id: &'static str,
    email: &'static str,
    status: &'static str,
    sequence_step: i64,
    agent_paused: bool,
    expected_path: &'static str,
}

#[derive(Debug)]
pub struct SeedResult {
    pub leads_seeded: Vec<LeadSeedInfo>,
}

#[derive(Debug)]
pub struct LeadSeedInfo {
    pub lead_id: &'static str,
    pub email: &'static str,
    pub expected_path: &'static str,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::{LeadRepository, SqlLeadRepository};
    use crate::{connect_with_settings, migrations};

    #[test]
    fn sql_fixture_is_valid() {
        assert!(!DemoLeadDataset::SQL.is_empty());
        for lead in DEMO_LEADS {
            assert!(DemoLeadDataset::SQL.contains(lead.lead_id), "{} missing", lead.lead_id);
        }
    }

    #[tokio::test]
    async fn load_verify_and_clean_round_trip() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        let seeded = DemoLeadDataset::load(&pool).await.expect("load");
        assert_eq!(seeded.leads_seeded.len(), DEMO_LEADS.len());

        let verification = DemoLeadDataset::verify(&pool).await.expect("verify");
        assert!(verification.all_present, "{:?}", verification.checks);

        let candidates =
            SqlLeadRepository::new(pool.clone()).list_candidates(10).await.expect("candidates");
        let ids: Vec<&str> = candidates.iter().map(|lead| lead.id.0.as_str()).collect();
        assert_eq!(ids, vec!["lead-demo-new", "lead-demo-followup", "lead-demo-exhausted"]);

        DemoLeadDataset::clean(&pool).await.expect("clean");
        let after_clean = DemoLeadDataset::verify(&pool).await.expect("verify");
        assert!(!after_clean.all_present);
        assert!(after_clean.checks.iter().all(|(_, ok)| !ok));

        pool.close().await;
    }

    #[tokio::test]
    async fn loading_twice_is_rejected_by_unique_ids() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        DemoLeadDataset::load(&pool).await.expect("first load");
        assert!(DemoLeadDataset::load(&pool).await.is_err());

        pool.close().await;
    }
}
