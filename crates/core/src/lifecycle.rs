//! Lead lifecycle transitions.
//!
//! [`apply`] is the only writer of status, sequencing, scheduling and failure counters on
//! a [`Lead`]. `sequence_step` and `follow_up_count` never decrease.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::email_queue::EmailKind;
use crate::domain::lead::{Lead, LeadStatus};
use crate::safety::{MAX_LEAD_BOUNCES, MAX_LEAD_ERRORS};
use crate::schedule;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadEvent {
    InitialEmailQueued,
    FollowUpQueued,
    ReplyReceived,
    MarkedInterested,
    MarkedNotInterested,
    Unsubscribed,
    Bounced,
    ExecutionFailed { message: String },
    Paused,
    Resumed,
    Closed { reason: String },
    /// Projection of a confirmed delivery from the queue executor.
    DeliveryConfirmed { kind: EmailKind, sequence_step: u32, sent_at: DateTime<Utc> },
}

impl LeadEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InitialEmailQueued => "initial_email_queued",
            Self::FollowUpQueued => "follow_up_queued",
            Self::ReplyReceived => "reply_received",
            Self::MarkedInterested => "marked_interested",
            Self::MarkedNotInterested => "marked_not_interested",
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Closed { .. } => "closed",
            Self::DeliveryConfirmed { .. } => "delivery_confirmed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadTransition {
    pub from: LeadStatus,
    pub to: LeadStatus,
    pub event: LeadEvent,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LeadTransitionError {
    #[error("invalid lead transition from {state} using event {}", .event.name())]
    InvalidTransition { state: LeadStatus, event: LeadEvent },
}

pub fn can_apply(state: LeadStatus, event: &LeadEvent) -> bool {
    use LeadStatus::{Closed, Contacted, FollowUp, Interested, New, NotInterested, Replied};

    match event {
        LeadEvent::InitialEmailQueued => state == New,
        LeadEvent::FollowUpQueued => matches!(state, Contacted | FollowUp),
        LeadEvent::ReplyReceived | LeadEvent::MarkedInterested | LeadEvent::MarkedNotInterested => {
            matches!(state, Contacted | FollowUp | Replied | Interested | NotInterested)
        }
        LeadEvent::Closed { .. } => state != Closed,
        LeadEvent::Unsubscribed
        | LeadEvent::Bounced
        | LeadEvent::ExecutionFailed { .. }
        | LeadEvent::Paused
        | LeadEvent::Resumed
        | LeadEvent::DeliveryConfirmed { .. } => true,
    }
}

pub fn apply(
    lead: &mut Lead,
    event: LeadEvent,
    now: DateTime<Utc>,
) -> Result<LeadTransition, LeadTransitionError> {
    let from = lead.status;
    if !can_apply(from, &event) {
        return Err(LeadTransitionError::InvalidTransition { state: from, event });
    }

    match &event {
        LeadEvent::InitialEmailQueued => {
            lead.status = LeadStatus::Contacted;
            lead.sequence_step = lead.sequence_step.max(1);
            record_outbound(lead, now);
        }
        LeadEvent::FollowUpQueued => {
            lead.status = LeadStatus::FollowUp;
            lead.sequence_step = lead.sequence_step.saturating_add(1);
            record_outbound(lead, now);
        }
        LeadEvent::ReplyReceived => record_reply(lead, LeadStatus::Replied, now),
        LeadEvent::MarkedInterested => {
            record_reply(lead, LeadStatus::Interested, now);
            lead.priority_score = 10.0;
        }
        LeadEvent::MarkedNotInterested => record_reply(lead, LeadStatus::NotInterested, now),
        LeadEvent::Unsubscribed => {
            lead.status = LeadStatus::Unsubscribed;
            lead.agent_enabled = false;
            lead.agent_paused = true;
            lead.next_agent_check_at = None;
        }
        LeadEvent::Bounced => {
            lead.bounce_count = lead.bounce_count.saturating_add(1);
            if lead.bounce_count >= MAX_LEAD_BOUNCES {
                lead.status = LeadStatus::Bounced;
                lead.agent_enabled = false;
                lead.next_agent_check_at = None;
            } else {
                lead.next_agent_check_at = Some(now + Duration::days(1));
            }
        }
        LeadEvent::ExecutionFailed { message } => {
            lead.error_count = lead.error_count.saturating_add(1);
            lead.last_error_message = Some(message.clone());
            lead.last_agent_action_at = Some(now);
            if lead.error_count >= MAX_LEAD_ERRORS {
                lead.agent_enabled = false;
                lead.next_agent_check_at = None;
            } else {
                lead.next_agent_check_at = Some(now + Duration::hours(1));
            }
        }
        LeadEvent::Paused => {
            lead.agent_paused = true;
            lead.append_note(format!("Paused manually at {}", now.to_rfc3339()));
        }
        LeadEvent::Resumed => {
            lead.agent_paused = false;
            lead.next_agent_check_at = Some(now);
            lead.append_note(format!("Resumed manually at {}", now.to_rfc3339()));
        }
        LeadEvent::Closed { reason } => {
            lead.status = LeadStatus::Closed;
            lead.agent_enabled = false;
            lead.next_agent_check_at = None;
            lead.append_note(format!("Closed: {reason}"));
        }
        LeadEvent::DeliveryConfirmed { kind, sequence_step, sent_at } => {
            lead.status = match (lead.status, kind) {
                (LeadStatus::New, EmailKind::Initial) => LeadStatus::Contacted,
                (LeadStatus::New | LeadStatus::Contacted, EmailKind::FollowUp) => {
                    LeadStatus::FollowUp
                }
                (status, _) => status,
            };
            lead.sequence_step = lead.sequence_step.max(*sequence_step);
            lead.last_email_sent_at = Some(*sent_at);
        }
    }

    lead.updated_at = now;
    Ok(LeadTransition { from, to: lead.status, event })
}

fn record_outbound(lead: &mut Lead, now: DateTime<Utc>) {
    lead.follow_up_count = lead.follow_up_count.saturating_add(1);
    lead.last_email_sent_at = Some(now);
    lead.last_agent_action_at = Some(now);
    lead.next_agent_check_at = Some(schedule::next_followup_time(now, lead.days_between_followups));
}

fn record_reply(lead: &mut Lead, status: LeadStatus, now: DateTime<Utc>) {
    lead.status = status;
    lead.replied = true;
    lead.reply_received_at = Some(now);
    lead.agent_enabled = false;
    lead.next_agent_check_at = None;
}
