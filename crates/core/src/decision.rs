//! Per-lead decisions and capacity-bounded batch selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::action_log::ActionType;
use crate::domain::lead::{Lead, LeadStatus};
use crate::safety::{self, ContactBlock};
use crate::schedule;

/// Upper bound on leads considered per cycle.
pub const CANDIDATE_BATCH: u32 = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    SendInitial,
    SendFollowup,
    Skip,
    Wait,
    Close,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        self.action_type().as_str()
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Self::SendInitial => ActionType::SendInitialEmail,
            Self::SendFollowup => ActionType::SendFollowupEmail,
            Self::Skip => ActionType::Skip,
            Self::Wait => ActionType::Wait,
            Self::Close => ActionType::Close,
        }
    }

    pub fn is_send(&self) -> bool {
        matches!(self, Self::SendInitial | Self::SendFollowup)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub lead: Lead,
    pub action: DecisionAction,
    pub reason: String,
    pub priority: f64,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    fn new(
        lead: &Lead,
        action: DecisionAction,
        reason: impl Into<String>,
        priority: f64,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self { lead: lead.clone(), action, reason: reason.into(), priority, decided_at }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionBatch {
    pub evaluated: usize,
    pub actionable_total: usize,
    /// Send decisions, highest priority first, truncated to capacity.
    pub sends: Vec<Decision>,
    pub closures: Vec<Decision>,
    pub deferred: Vec<Decision>,
}

pub fn evaluate_lead(lead: &Lead, now: DateTime<Utc>) -> Decision {
    match safety::screen_lead(lead, now) {
        None => {}
        // An exhausted sequence still gets a close decision once it comes due.
        Some(ContactBlock::MaxFollowUps(_))
            if matches!(lead.status, LeadStatus::Contacted | LeadStatus::FollowUp) => {}
        Some(block) => {
            return Decision::new(lead, DecisionAction::Skip, block.reason(), 0.0, now);
        }
    }

    match lead.status {
        LeadStatus::New if lead.sequence_step == 0 => Decision::new(
            lead,
            DecisionAction::SendInitial,
            "New lead ready for initial contact",
            calc_priority(lead),
            now,
        ),
        LeadStatus::Contacted | LeadStatus::FollowUp => {
            if !schedule::is_ready_for_action(lead.next_agent_check_at, now) {
                Decision::new(lead, DecisionAction::Wait, "Not yet time for next contact", 0.0, now)
            } else if lead.follow_up_count < lead.max_follow_ups {
                Decision::new(
                    lead,
                    DecisionAction::SendFollowup,
                    format!("Follow-up #{} due", lead.follow_up_count + 1),
                    calc_priority(lead),
                    now,
                )
            } else {
                Decision::new(
                    lead,
                    DecisionAction::Close,
                    "Max follow-ups reached, no response",
                    1.0,
                    now,
                )
            }
        }
        status => Decision::new(
            lead,
            DecisionAction::Skip,
            format!("Lead in non-actionable state: {status}"),
            0.0,
            now,
        ),
    }
}

/// Urgency in `[1, 10]`. Non-finite stored scores fall back to the default.
pub fn calc_priority(lead: &Lead) -> f64 {
    let base =
        if lead.priority_score.is_finite() { lead.priority_score } else { Lead::DEFAULT_PRIORITY };
    let mut score = base;
    if lead.status == LeadStatus::New {
        score += 2.0;
    }
    score += f64::from(lead.sequence_step) * 0.5;
    score -= f64::from(lead.error_count);

    if score.is_nan() {
        return 1.0;
    }
    score.clamp(1.0, 10.0)
}

pub fn make_decisions(leads: &[Lead], max_actions: usize, now: DateTime<Utc>) -> DecisionBatch {
    let mut batch = DecisionBatch { evaluated: leads.len(), ..DecisionBatch::default() };

    for lead in leads {
        let decision = evaluate_lead(lead, now);
        match decision.action {
            DecisionAction::SendInitial | DecisionAction::SendFollowup => batch.sends.push(decision),
            DecisionAction::Close => batch.closures.push(decision),
            DecisionAction::Skip | DecisionAction::Wait => batch.deferred.push(decision),
        }
    }

    batch.actionable_total = batch.sends.len();
    batch.sends.sort_by(|left, right| right.priority.total_cmp(&left.priority));
    batch.sends.truncate(max_actions);
    batch
}

pub fn explain_decision(decision: &Decision) -> String {
    let lead = &decision.lead;
    let last_contact =
        lead.last_email_sent_at.map(|at| at.to_rfc3339()).unwrap_or_else(|| "Never".to_string());
    let next_check = lead
        .next_agent_check_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "Not scheduled".to_string());

    [
        format!("Decision for Lead #{} ({}):", lead.id, lead.email),
        format!("  Action: {}", decision.action.as_str()),
        format!("  Reason: {}", decision.reason),
        format!("  Priority: {:.1}/10", decision.priority),
        format!("  Status: {}", lead.status),
        format!("  Sequence Step: {}", lead.sequence_step),
        format!("  Follow-ups: {}/{}", lead.follow_up_count, lead.max_follow_ups),
        format!("  Last Contact: {last_contact}"),
        format!("  Next Check: {next_check}"),
    ]
    .join("\n")
}
