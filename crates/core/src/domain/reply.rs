use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::lead::LeadId;

/// A message pulled from the inbox, before it is matched to a lead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub from_email: String,
    pub to_email: Option<String>,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyClass {
    Interested,
    NotInterested,
    Unsubscribe,
    Unclear,
}

impl ReplyClass {
    pub const ALL: [ReplyClass; 4] =
        [Self::Interested, Self::NotInterested, Self::Unsubscribe, Self::Unclear];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interested => "interested",
            Self::NotInterested => "not_interested",
            Self::Unsubscribe => "unsubscribe",
            Self::Unclear => "unclear",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interested" => Some(Self::Interested),
            "not_interested" => Some(Self::NotInterested),
            "unsubscribe" => Some(Self::Unsubscribe),
            "unclear" => Some(Self::Unclear),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailReplyId(pub String);

/// A stored reply after it has been matched and classified.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailReply {
    pub id: EmailReplyId,
    /// `None` when no lead matched the sender; the reply is kept for review.
    pub lead_id: Option<LeadId>,
    pub from_email: String,
    pub to_email: Option<String>,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub classification: ReplyClass,
    pub received_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
}

impl EmailReply {
    pub fn from_inbound(
        lead_id: Option<LeadId>,
        message: &InboundMessage,
        classification: ReplyClass,
        processed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EmailReplyId(Uuid::new_v4().to_string()),
            lead_id,
            from_email: message.from_email.trim().to_ascii_lowercase(),
            to_email: message.to_email.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            message_id: message.message_id.clone(),
            in_reply_to: message.in_reply_to.clone(),
            classification,
            received_at: message.received_at,
            processed_at,
        }
    }
}
