//! Gates for whether a lead may be contacted and whether the agent may send at all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent_config::AgentConfig;
use crate::domain::lead::{Lead, LeadStatus};
use crate::rate_limit::{self, Verdict};
use crate::schedule;

pub const MAX_LEAD_ERRORS: u32 = 3;
pub const MAX_LEAD_BOUNCES: u32 = 2;

const BLOCKED_DOMAINS: [&str; 3] = ["example.com", "test.com", "localhost"];

/// Why a lead may not be contacted right now.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactBlock {
    AgentDisabled,
    ManuallyPaused,
    Status(LeadStatus),
    MaxFollowUps(u32),
    TooManyErrors(u32),
    RepeatedBounces,
    NotYetDue,
}

impl ContactBlock {
    pub fn reason(&self) -> String {
        match self {
            Self::AgentDisabled => "Lead has agent disabled".to_string(),
            Self::ManuallyPaused => "Lead is manually paused".to_string(),
            Self::Status(status) => format!("Lead status is '{status}'"),
            Self::MaxFollowUps(max) => format!("Max follow-ups reached ({max})"),
            Self::TooManyErrors(count) => format!("Too many errors ({count})"),
            Self::RepeatedBounces => "Lead email bounced multiple times".to_string(),
            Self::NotYetDue => "Not yet time to contact".to_string(),
        }
    }
}

/// Ordered lead eligibility checks; the first failing check is returned.
pub fn screen_lead(lead: &Lead, now: DateTime<Utc>) -> Option<ContactBlock> {
    if !lead.agent_enabled {
        return Some(ContactBlock::AgentDisabled);
    }
    if lead.agent_paused {
        return Some(ContactBlock::ManuallyPaused);
    }
    if lead.status.blocks_contact() {
        return Some(ContactBlock::Status(lead.status));
    }
    if lead.follow_up_count >= lead.max_follow_ups {
        return Some(ContactBlock::MaxFollowUps(lead.max_follow_ups));
    }
    if lead.error_count >= MAX_LEAD_ERRORS {
        return Some(ContactBlock::TooManyErrors(lead.error_count));
    }
    if lead.bounce_count >= MAX_LEAD_BOUNCES {
        return Some(ContactBlock::RepeatedBounces);
    }
    if lead.next_agent_check_at.is_some()
        && !schedule::is_ready_for_action(lead.next_agent_check_at, now)
    {
        return Some(ContactBlock::NotYetDue);
    }
    None
}

pub fn can_contact_lead(lead: &Lead, now: DateTime<Utc>) -> Verdict {
    match screen_lead(lead, now) {
        Some(block) => Verdict::deny(block.reason()),
        None => Verdict::allow("Lead is eligible"),
    }
}

/// Global go-ahead. May reset lazily expired quota windows on `config`.
pub fn can_send_now(config: Option<&mut AgentConfig>, now: DateTime<Utc>) -> Verdict {
    let Some(config) = config else {
        return Verdict::deny("Agent config not found");
    };
    if !config.is_running {
        return Verdict::deny("Agent is not running");
    }
    if config.is_paused {
        return Verdict::deny("Agent is paused");
    }
    if config.respect_business_hours
        && !schedule::is_business_hours(
            now,
            &config.timezone,
            &config.business_hours_start,
            &config.business_hours_end,
            &config.active_weekdays,
        )
    {
        return Verdict::deny("Outside business hours");
    }

    let limits = rate_limit::can_send(config, now);
    if !limits.allowed {
        return limits;
    }
    Verdict::allow("Safe to send")
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRateCheck {
    pub safe: bool,
    pub error_rate_pct: f64,
}

/// Unsafe only when auto-pause is enabled and the rate strictly exceeds the threshold.
pub fn check_error_rate(config: &AgentConfig) -> ErrorRateCheck {
    let error_rate_pct = config.error_rate_pct();
    let safe = !(config.pause_on_high_error_rate && error_rate_pct > config.error_rate_threshold);
    ErrorRateCheck { safe, error_rate_pct }
}

pub fn emergency_stop(config: &mut AgentConfig, now: DateTime<Utc>) {
    config.is_running = false;
    config.is_paused = true;
    config.agent_stopped_at = Some(now);
    config.next_agent_run_at = None;
    config.updated_at = now;
}

pub fn validate_lead_email(email: &str) -> Verdict {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return Verdict::deny("Invalid email format");
    };
    if local.is_empty() || domain.is_empty() {
        return Verdict::deny("Invalid email format");
    }

    let domain = domain.to_ascii_lowercase();
    if BLOCKED_DOMAINS.contains(&domain.as_str()) {
        return Verdict::deny(format!("Blocked domain: {domain}"));
    }
    Verdict::allow("Email valid")
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{can_contact_lead, can_send_now, check_error_rate, emergency_stop, validate_lead_email};
    use crate::domain::agent_config::AgentConfig;
    use crate::domain::lead::{Lead, LeadId, LeadStatus};

    fn lead() -> Lead {
        Lead::new(LeadId("L-1".to_string()), "ada@acme.io", Utc::now())
    }

    fn running_config(now: chrono::DateTime<Utc>) -> AgentConfig {
        let mut config = AgentConfig::with_defaults(now);
        config.is_running = true;
        config
    }

    #[test]
    fn fresh_lead_is_eligible() {
        let verdict = can_contact_lead(&lead(), Utc::now());
        assert!(verdict.allowed);
        assert_eq!(verdict.reason, "Lead is eligible");
    }

    #[test]
    fn first_failing_check_wins() {
        let mut lead = lead();
        lead.agent_paused = true;
        lead.status = LeadStatus::Unsubscribed;
        lead.error_count = 5;
        assert_eq!(can_contact_lead(&lead, Utc::now()).reason, "Lead is manually paused");

        lead.agent_paused = false;
        assert_eq!(can_contact_lead(&lead, Utc::now()).reason, "Lead status is 'unsubscribed'");

        lead.agent_enabled = false;
        assert_eq!(can_contact_lead(&lead, Utc::now()).reason, "Lead has agent disabled");
    }

    #[test]
    fn counters_and_schedule_are_checked_in_order() {
        let now = Utc::now();
        let mut lead = lead();
        lead.status = LeadStatus::Contacted;
        lead.follow_up_count = 3;
        lead.error_count = 3;
        assert_eq!(can_contact_lead(&lead, now).reason, "Max follow-ups reached (3)");

        lead.follow_up_count = 1;
        assert_eq!(can_contact_lead(&lead, now).reason, "Too many errors (3)");

        lead.error_count = 0;
        lead.bounce_count = 2;
        assert_eq!(can_contact_lead(&lead, now).reason, "Lead email bounced multiple times");

        lead.bounce_count = 1;
        lead.next_agent_check_at = Some(now + Duration::hours(2));
        assert_eq!(can_contact_lead(&lead, now).reason, "Not yet time to contact");

        lead.next_agent_check_at = Some(now - Duration::seconds(1));
        assert!(can_contact_lead(&lead, now).allowed);
    }

    #[test]
    fn send_gate_reports_missing_stopped_and_paused() {
        let now = Utc::now();
        assert_eq!(can_send_now(None, now).reason, "Agent config not found");

        let mut config = AgentConfig::with_defaults(now);
        assert_eq!(can_send_now(Some(&mut config), now).reason, "Agent is not running");

        config.is_running = true;
        config.is_paused = true;
        assert_eq!(can_send_now(Some(&mut config), now).reason, "Agent is paused");

        config.is_paused = false;
        assert_eq!(can_send_now(Some(&mut config), now).reason, "Safe to send");
    }

    #[test]
    fn send_gate_honours_business_hours_only_when_enabled() {
        // Sunday.
        let now = Utc.with_ymd_and_hms(2026, 3, 8, 12, 0, 0).single().expect("valid instant");
        let mut config = running_config(now);
        assert!(can_send_now(Some(&mut config), now).allowed);

        config.respect_business_hours = true;
        assert_eq!(can_send_now(Some(&mut config), now).reason, "Outside business hours");
    }

    #[test]
    fn send_gate_delegates_to_rate_limiter() {
        let now = Utc::now();
        let mut config = running_config(now);
        config.last_reset_date = Some(now.date_naive());
        config.emails_sent_today = 50;
        assert_eq!(can_send_now(Some(&mut config), now).reason, "Daily limit reached (50)");
    }

    #[test]
    fn error_rate_check_respects_toggle_and_threshold() {
        let mut config = AgentConfig::with_defaults(Utc::now());
        assert!(check_error_rate(&config).safe);

        config.total_emails_sent = 20;
        config.total_errors = 2;
        assert!(check_error_rate(&config).safe, "10% is not above a 10% threshold");

        config.total_errors = 3;
        let check = check_error_rate(&config);
        assert!(!check.safe);
        assert!((check.error_rate_pct - 15.0).abs() < 1e-9);

        config.pause_on_high_error_rate = false;
        assert!(check_error_rate(&config).safe);
    }

    #[test]
    fn emergency_stop_halts_and_pauses() {
        let now = Utc::now();
        let mut config = running_config(now);
        emergency_stop(&mut config, now);
        assert!(!config.is_running);
        assert!(config.is_paused);
        assert_eq!(config.agent_stopped_at, Some(now));
    }

    #[test]
    fn email_validation_blocks_placeholder_domains() {
        assert!(validate_lead_email("ada@acme.io").allowed);
        assert_eq!(validate_lead_email("ada.acme.io").reason, "Invalid email format");
        assert_eq!(validate_lead_email("@acme.io").reason, "Invalid email format");
        assert_eq!(validate_lead_email("x@Example.COM").reason, "Blocked domain: example.com");
    }
}
