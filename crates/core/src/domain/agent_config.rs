use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// The single process-wide agent control record.
///
/// Counter columns (`emails_sent_today`, `emails_sent_this_hour`, `total_*`) are only
/// ever moved by the rate limiter's increment path; everything else is operator state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub is_running: bool,
    pub is_paused: bool,
    pub daily_email_limit: u32,
    pub hourly_email_limit: u32,
    pub emails_sent_today: u32,
    pub emails_sent_this_hour: u32,
    pub last_reset_date: Option<NaiveDate>,
    pub last_hour_reset: Option<DateTime<Utc>>,
    pub business_hours_start: String,
    pub business_hours_end: String,
    pub timezone: String,
    /// ISO weekday numbers, 1 = Monday through 7 = Sunday.
    pub active_weekdays: Vec<u8>,
    pub respect_business_hours: bool,
    pub respect_unsubscribes: bool,
    pub pause_on_high_error_rate: bool,
    pub error_rate_threshold: f64,
    pub agent_check_interval_minutes: u32,
    pub inbox_check_interval_minutes: u32,
    pub total_emails_sent: u64,
    pub total_errors: u64,
    pub total_replies_received: u64,
    pub agent_started_at: Option<DateTime<Utc>>,
    pub agent_stopped_at: Option<DateTime<Utc>>,
    pub last_agent_run_at: Option<DateTime<Utc>>,
    pub next_agent_run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AgentConfig {
    pub const DEFAULT_ACTIVE_WEEKDAYS: [u8; 5] = [1, 2, 3, 4, 5];

    pub fn with_defaults(now: DateTime<Utc>) -> Self {
        Self {
            is_running: false,
            is_paused: false,
            daily_email_limit: 50,
            hourly_email_limit: 10,
            emails_sent_today: 0,
            emails_sent_this_hour: 0,
            last_reset_date: None,
            last_hour_reset: None,
            business_hours_start: "09:00".to_string(),
            business_hours_end: "17:00".to_string(),
            timezone: "America/New_York".to_string(),
            active_weekdays: Self::DEFAULT_ACTIVE_WEEKDAYS.to_vec(),
            respect_business_hours: false,
            respect_unsubscribes: true,
            pause_on_high_error_rate: true,
            error_rate_threshold: 10.0,
            agent_check_interval_minutes: 5,
            inbox_check_interval_minutes: 15,
            total_emails_sent: 0,
            total_errors: 0,
            total_replies_received: 0,
            agent_started_at: None,
            agent_stopped_at: None,
            last_agent_run_at: None,
            next_agent_run_at: None,
            updated_at: now,
        }
    }

    /// Error rate as a percentage of all attempted sends; zero before the first send.
    pub fn error_rate_pct(&self) -> f64 {
        if self.total_emails_sent == 0 {
            return 0.0;
        }
        self.total_errors as f64 / self.total_emails_sent as f64 * 100.0
    }
}

/// Constrained subset of settings an operator may change at runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettingsPatch {
    pub daily_email_limit: Option<u32>,
    pub hourly_email_limit: Option<u32>,
    pub business_hours_start: Option<String>,
    pub business_hours_end: Option<String>,
    pub respect_business_hours: Option<bool>,
}

impl AgentSettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.daily_email_limit.is_none()
            && self.hourly_email_limit.is_none()
            && self.business_hours_start.is_none()
            && self.business_hours_end.is_none()
            && self.respect_business_hours.is_none()
    }
}

/// Counter-window resets detected on read, to be persisted without clobbering
/// concurrent increments.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WindowReset {
    pub daily: Option<NaiveDate>,
    pub hourly: Option<DateTime<Utc>>,
}

impl WindowReset {
    pub fn is_empty(&self) -> bool {
        self.daily.is_none() && self.hourly.is_none()
    }
}

pub fn encode_weekdays(days: &[u8]) -> String {
    days.iter().map(u8::to_string).collect::<Vec<_>>().join(",")
}

pub fn decode_weekdays(raw: &str) -> Option<Vec<u8>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u8>().ok().filter(|day| (1..=7).contains(day)))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{decode_weekdays, encode_weekdays, AgentConfig};

    #[test]
    fn defaults_match_operational_baseline() {
        let config = AgentConfig::with_defaults(Utc::now());
        assert_eq!(config.daily_email_limit, 50);
        assert_eq!(config.hourly_email_limit, 10);
        assert_eq!(config.active_weekdays, vec![1, 2, 3, 4, 5]);
        assert!(!config.is_running);
        assert_eq!(config.error_rate_pct(), 0.0);
    }

    #[test]
    fn weekday_encoding_rejects_out_of_range_days() {
        assert_eq!(encode_weekdays(&[1, 3, 5]), "1,3,5");
        assert_eq!(decode_weekdays("1, 3,5"), Some(vec![1, 3, 5]));
        assert_eq!(decode_weekdays("0,8"), None);
        assert_eq!(decode_weekdays("mon"), None);
    }
}
