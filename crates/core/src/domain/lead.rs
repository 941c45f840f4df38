use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadId(pub String);

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    FollowUp,
    Replied,
    Interested,
    NotInterested,
    Unsubscribed,
    Bounced,
    Paused,
    Closed,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 10] = [
        Self::New,
        Self::Contacted,
        Self::FollowUp,
        Self::Replied,
        Self::Interested,
        Self::NotInterested,
        Self::Unsubscribed,
        Self::Bounced,
        Self::Paused,
        Self::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Contacted => "contacted",
            Self::FollowUp => "follow_up",
            Self::Replied => "replied",
            Self::Interested => "interested",
            Self::NotInterested => "not_interested",
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
            Self::Paused => "paused",
            Self::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "contacted" => Some(Self::Contacted),
            "follow_up" => Some(Self::FollowUp),
            "replied" => Some(Self::Replied),
            "interested" => Some(Self::Interested),
            "not_interested" => Some(Self::NotInterested),
            "unsubscribed" => Some(Self::Unsubscribed),
            "bounced" => Some(Self::Bounced),
            "paused" => Some(Self::Paused),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// States from which the agent may initiate outbound contact.
    pub fn is_outreach_active(&self) -> bool {
        matches!(self, Self::New | Self::Contacted | Self::FollowUp)
    }

    /// States that permanently block contact regardless of counters.
    pub fn blocks_contact(&self) -> bool {
        matches!(
            self,
            Self::Unsubscribed | Self::Bounced | Self::Replied | Self::Interested | Self::NotInterested
        )
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject-line variant a lead receives. Assigned once, on first contact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentVariant {
    Direct,
    Benefit,
    Question,
}

impl ContentVariant {
    pub const ALL: [ContentVariant; 3] = [Self::Direct, Self::Benefit, Self::Question];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Benefit => "benefit",
            Self::Question => "question",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Some(Self::Direct),
            "benefit" => Some(Self::Benefit),
            "question" => Some(Self::Question),
            _ => None,
        }
    }

    /// Deterministic assignment: the same lead id always maps to the same variant.
    pub fn assign(lead_id: &LeadId) -> Self {
        // FNV-1a, stable across platforms and releases.
        let hash = lead_id.0.bytes().fold(0xcbf2_9ce4_8422_2325_u64, |hash, byte| {
            (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
        });
        let index = (hash % Self::ALL.len() as u64) as usize;
        Self::ALL[index]
    }

    pub fn subject(&self, company: Option<&str>) -> String {
        let company = company.map(str::trim).filter(|value| !value.is_empty());
        let company = company.unwrap_or("your team");
        match self {
            Self::Direct => format!("Quick introduction for {company}"),
            Self::Benefit => format!("Saving {company} hours every week"),
            Self::Question => format!("Is {company} still handling this manually?"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub industry: Option<String>,
    pub status: LeadStatus,
    pub sequence_step: u32,
    pub follow_up_count: u32,
    pub max_follow_ups: u32,
    pub days_between_followups: u32,
    pub next_agent_check_at: Option<DateTime<Utc>>,
    pub last_email_sent_at: Option<DateTime<Utc>>,
    pub last_agent_action_at: Option<DateTime<Utc>>,
    pub priority_score: f64,
    pub engagement_score: f64,
    pub bounce_count: u32,
    pub error_count: u32,
    pub last_error_message: Option<String>,
    pub agent_enabled: bool,
    pub agent_paused: bool,
    pub replied: bool,
    pub reply_received_at: Option<DateTime<Utc>>,
    pub agent_notes: Option<String>,
    pub content_variant: Option<ContentVariant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub const DEFAULT_MAX_FOLLOW_UPS: u32 = 3;
    pub const DEFAULT_DAYS_BETWEEN_FOLLOWUPS: u32 = 3;
    pub const DEFAULT_PRIORITY: f64 = 5.0;

    /// A freshly imported lead with the standard outreach defaults.
    pub fn new(id: LeadId, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            email: email.into(),
            first_name: None,
            last_name: None,
            company: None,
            industry: None,
            status: LeadStatus::New,
            sequence_step: 0,
            follow_up_count: 0,
            max_follow_ups: Self::DEFAULT_MAX_FOLLOW_UPS,
            days_between_followups: Self::DEFAULT_DAYS_BETWEEN_FOLLOWUPS,
            next_agent_check_at: None,
            last_email_sent_at: None,
            last_agent_action_at: None,
            priority_score: Self::DEFAULT_PRIORITY,
            engagement_score: 0.0,
            bounce_count: 0,
            error_count: 0,
            last_error_message: None,
            agent_enabled: true,
            agent_paused: false,
            replied: false,
            reply_received_at: None,
            agent_notes: None,
            content_variant: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// "First Last" with placeholder names dropped, or `None` when nothing usable remains.
    pub fn display_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| is_real_name(part))
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }

    pub fn greeting_name(&self) -> Option<&str> {
        self.first_name.as_deref().map(str::trim).filter(|name| is_real_name(name))
    }

    pub fn append_note(&mut self, note: impl AsRef<str>) {
        let note = note.as_ref();
        self.agent_notes = Some(match self.agent_notes.take() {
            Some(existing) if !existing.is_empty() => format!("{existing}\n{note}"),
            _ => note.to_string(),
        });
    }
}

fn is_real_name(value: &str) -> bool {
    !value.is_empty() && !value.eq_ignore_ascii_case("unknown") && !value.eq_ignore_ascii_case("none")
}
