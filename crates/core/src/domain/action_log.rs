use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::lead::{Lead, LeadId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionLogId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SendInitialEmail,
    SendFollowupEmail,
    Skip,
    Wait,
    Close,
    Error,
    Cycle,
    ReplyProcessed,
    Control,
    EmergencyStop,
}

impl ActionType {
    pub const ALL: [ActionType; 10] = [
        Self::SendInitialEmail,
        Self::SendFollowupEmail,
        Self::Skip,
        Self::Wait,
        Self::Close,
        Self::Error,
        Self::Cycle,
        Self::ReplyProcessed,
        Self::Control,
        Self::EmergencyStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendInitialEmail => "send_initial_email",
            Self::SendFollowupEmail => "send_followup_email",
            Self::Skip => "skip",
            Self::Wait => "wait",
            Self::Close => "close",
            Self::Error => "error",
            Self::Cycle => "cycle",
            Self::ReplyProcessed => "reply_processed",
            Self::Control => "control",
            Self::EmergencyStop => "emergency_stop",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "send_initial_email" => Some(Self::SendInitialEmail),
            "send_followup_email" => Some(Self::SendFollowupEmail),
            "skip" => Some(Self::Skip),
            "wait" => Some(Self::Wait),
            "close" => Some(Self::Close),
            "error" => Some(Self::Error),
            "cycle" => Some(Self::Cycle),
            "reply_processed" => Some(Self::ReplyProcessed),
            "control" => Some(Self::Control),
            "emergency_stop" => Some(Self::EmergencyStop),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Failure,
    Skipped,
}

impl ActionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Write-once audit record for one agent decision or control action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentActionLog {
    pub id: ActionLogId,
    pub action_type: ActionType,
    pub action_result: ActionResult,
    pub lead_id: Option<LeadId>,
    pub lead_email: Option<String>,
    pub decision_reason: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub agent_run_id: Option<String>,
    pub emails_sent_before: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

impl AgentActionLog {
    pub fn new(action_type: ActionType, action_result: ActionResult, occurred_at: DateTime<Utc>) -> Self {
        Self {
            id: ActionLogId(Uuid::new_v4().to_string()),
            action_type,
            action_result,
            lead_id: None,
            lead_email: None,
            decision_reason: None,
            metadata: BTreeMap::new(),
            error_message: None,
            execution_time_ms: None,
            agent_run_id: None,
            emails_sent_before: None,
            occurred_at,
        }
    }

    pub fn for_lead(mut self, lead: &Lead) -> Self {
        self.lead_id = Some(lead.id.clone());
        self.lead_email = Some(lead.email.clone());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.decision_reason = Some(reason.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.agent_run_id = Some(run_id.into());
        self
    }

    pub fn with_emails_sent_before(mut self, count: u32) -> Self {
        self.emails_sent_before = Some(count);
        self
    }

    pub fn with_execution_time_ms(mut self, elapsed_ms: u64) -> Self {
        self.execution_time_ms = Some(elapsed_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Filter and page parameters for reading the audit trail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionLogQuery {
    pub action_type: Option<ActionType>,
    pub lead_id: Option<LeadId>,
    pub run_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ActionLogQuery {
    fn default() -> Self {
        Self { action_type: None, lead_id: None, run_id: None, limit: 50, offset: 0 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionStatistics {
    pub total_actions: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_result: BTreeMap<String, u64>,
    pub success_rate_pct: f64,
}

impl ActionStatistics {
    pub fn from_counts(
        by_type: BTreeMap<String, u64>,
        by_result: BTreeMap<String, u64>,
    ) -> Self {
        let total_actions: u64 = by_type.values().sum();
        let successes = by_result.get(ActionResult::Success.as_str()).copied().unwrap_or(0);
        let success_rate_pct = if total_actions == 0 {
            0.0
        } else {
            successes as f64 / total_actions as f64 * 100.0
        };
        Self { total_actions, by_type, by_result, success_rate_pct }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::{ActionResult, ActionStatistics, ActionType, AgentActionLog};
    use crate::domain::lead::{Lead, LeadId};

    #[test]
    fn action_type_round_trips_from_storage_encoding() {
        for action in ActionType::ALL {
            assert_eq!(ActionType::parse(action.as_str()), Some(action));
        }
    }

    #[test]
    fn builder_records_lead_and_run_context() {
        let now = Utc::now();
        let lead = Lead::new(LeadId("L-9".to_string()), "grace@navy.mil", now);
        let entry = AgentActionLog::new(ActionType::Skip, ActionResult::Skipped, now)
            .for_lead(&lead)
            .with_reason("Lead is manually paused")
            .with_run("ab12cd34")
            .with_metadata("priority", "0");

        assert_eq!(entry.lead_email.as_deref(), Some("grace@navy.mil"));
        assert_eq!(entry.agent_run_id.as_deref(), Some("ab12cd34"));
        assert!(entry.metadata.contains_key("priority"));
    }

    #[test]
    fn statistics_compute_success_rate_over_all_actions() {
        let by_type = BTreeMap::from([("skip".to_string(), 2), ("send_initial_email".to_string(), 2)]);
        let by_result = BTreeMap::from([("success".to_string(), 1), ("skipped".to_string(), 3)]);
        let stats = ActionStatistics::from_counts(by_type, by_result);
        assert_eq!(stats.total_actions, 4);
        assert!((stats.success_rate_pct - 25.0).abs() < f64::EPSILON);
    }
}
