use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::lead::LeadId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailQueueId(pub String);

impl fmt::Display for EmailQueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier handed back by the task queue when work is submitted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 4] = [Self::Pending, Self::Processing, Self::Sent, Self::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailKind {
    Initial,
    FollowUp,
}

impl EmailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::FollowUp => "follow_up",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "initial" => Some(Self::Initial),
            "follow_up" => Some(Self::FollowUp),
            _ => None,
        }
    }
}

/// One logical send attempt, including all of its retries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailQueueEntry {
    pub id: EmailQueueId,
    pub lead_id: LeadId,
    pub kind: EmailKind,
    /// The lead's sequence step once this email is delivered.
    pub sequence_step: u32,
    pub subject: String,
    pub body: Option<String>,
    pub html_body: Option<String>,
    pub task_id: Option<TaskId>,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailQueueEntry {
    /// Failed rows that automatic retries gave up on.
    pub fn is_permanently_failed(&self) -> bool {
        self.status == QueueStatus::Failed && self.retry_count >= self.max_retries
    }

    /// Rows that will still reach the relay without operator action.
    pub fn is_outstanding(&self) -> bool {
        match self.status {
            QueueStatus::Pending | QueueStatus::Processing => true,
            QueueStatus::Failed => !self.is_permanently_failed(),
            QueueStatus::Sent => false,
        }
    }
}

/// Aggregate view of the queue for the control surface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub retryable: u64,
    pub permanently_failed: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{EmailKind, EmailQueueEntry, EmailQueueId, QueueStatus};
    use crate::domain::lead::LeadId;

    fn entry(status: QueueStatus, retry_count: u32) -> EmailQueueEntry {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).single().expect("valid timestamp");
        EmailQueueEntry {
            id: EmailQueueId("Q-1".to_string()),
            lead_id: LeadId("L-1".to_string()),
            kind: EmailKind::Initial,
            sequence_step: 1,
            subject: "Hello".to_string(),
            body: None,
            html_body: None,
            task_id: None,
            status,
            retry_count,
            max_retries: 3,
            last_error: None,
            scheduled_at: at,
            sent_at: None,
            failed_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn queue_status_round_trips_from_storage_encoding() {
        for status in QueueStatus::ALL {
            assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(QueueStatus::parse("done"), None);
    }

    #[test]
    fn failed_rows_with_retries_left_stay_outstanding() {
        assert!(entry(QueueStatus::Pending, 0).is_outstanding());
        assert!(entry(QueueStatus::Processing, 0).is_outstanding());
        assert!(entry(QueueStatus::Failed, 1).is_outstanding());
        assert!(!entry(QueueStatus::Failed, 3).is_outstanding());
        assert!(entry(QueueStatus::Failed, 3).is_permanently_failed());
        assert!(!entry(QueueStatus::Sent, 0).is_outstanding());
    }

    #[test]
    fn email_kind_round_trips() {
        for kind in [EmailKind::Initial, EmailKind::FollowUp] {
            assert_eq!(EmailKind::parse(kind.as_str()), Some(kind));
        }
    }
}
