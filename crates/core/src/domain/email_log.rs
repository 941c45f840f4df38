use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::email_queue::EmailQueueId;
use crate::domain::lead::LeadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailLogId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailLogStatus {
    Sent,
    Failed,
}

impl EmailLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row per delivery attempt outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLogEntry {
    pub id: EmailLogId,
    pub lead_id: LeadId,
    pub queue_id: Option<EmailQueueId>,
    pub recipient: String,
    pub subject: String,
    pub body: Option<String>,
    pub status: EmailLogStatus,
    pub error_message: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl EmailLogEntry {
    pub fn sent(
        lead_id: LeadId,
        queue_id: Option<EmailQueueId>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: Option<String>,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EmailLogId(Uuid::new_v4().to_string()),
            lead_id,
            queue_id,
            recipient: recipient.into(),
            subject: subject.into(),
            body,
            status: EmailLogStatus::Sent,
            error_message: None,
            attempted_at,
        }
    }

    pub fn failed(
        lead_id: LeadId,
        queue_id: Option<EmailQueueId>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        error: impl Into<String>,
        attempted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EmailLogId(Uuid::new_v4().to_string()),
            lead_id,
            queue_id,
            recipient: recipient.into(),
            subject: subject.into(),
            body: None,
            status: EmailLogStatus::Failed,
            error_message: Some(error.into()),
            attempted_at,
        }
    }
}
