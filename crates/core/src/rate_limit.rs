//! Daily and hourly send quotas against the shared agent record.
//!
//! Windows reset lazily: the first read after a window boundary zeroes the counter and
//! stamps the new anchor. [`roll_windows`] reports which anchors moved so the store can
//! persist them without touching concurrently incremented counters.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent_config::{AgentConfig, WindowReset};

/// Outcome of a gate check. Rejections are values, not errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
}

impl Verdict {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self { allowed: true, reason: reason.into() }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self { allowed: false, reason: reason.into() }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowUsage {
    pub sent: u32,
    pub limit: u32,
    pub remaining: u32,
}

impl WindowUsage {
    fn new(sent: u32, limit: u32) -> Self {
        Self { sent, limit, remaining: limit.saturating_sub(sent) }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub daily: WindowUsage,
    pub hourly: WindowUsage,
}

impl Capacity {
    pub fn sendable(&self) -> u32 {
        self.daily.remaining.min(self.hourly.remaining)
    }
}

/// Zeroes any counter whose window has elapsed and returns the anchors that moved.
pub fn roll_windows(config: &mut AgentConfig, now: DateTime<Utc>) -> WindowReset {
    WindowReset { daily: roll_daily(config, now), hourly: roll_hourly(config, now) }
}

fn roll_daily(config: &mut AgentConfig, now: DateTime<Utc>) -> Option<NaiveDate> {
    let today = now.date_naive();
    if config.last_reset_date == Some(today) {
        return None;
    }
    config.emails_sent_today = 0;
    config.last_reset_date = Some(today);
    Some(today)
}

fn roll_hourly(config: &mut AgentConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let elapsed = match config.last_hour_reset {
        None => true,
        Some(anchor) => now - anchor >= Duration::hours(1),
    };
    if !elapsed {
        return None;
    }
    config.emails_sent_this_hour = 0;
    config.last_hour_reset = Some(now);
    Some(now)
}

pub fn check_daily(config: &mut AgentConfig, now: DateTime<Utc>) -> Verdict {
    roll_daily(config, now);
    if config.emails_sent_today >= config.daily_email_limit {
        return Verdict::deny(format!("Daily limit reached ({})", config.daily_email_limit));
    }
    Verdict::allow(format!("OK ({}/{})", config.emails_sent_today, config.daily_email_limit))
}

pub fn check_hourly(config: &mut AgentConfig, now: DateTime<Utc>) -> Verdict {
    roll_hourly(config, now);
    if config.emails_sent_this_hour >= config.hourly_email_limit {
        return Verdict::deny(format!("Hourly limit reached ({})", config.hourly_email_limit));
    }
    Verdict::allow(format!("OK ({}/{})", config.emails_sent_this_hour, config.hourly_email_limit))
}

/// Daily quota first, then hourly; the first rejection wins.
pub fn can_send(config: &mut AgentConfig, now: DateTime<Utc>) -> Verdict {
    let daily = check_daily(config, now);
    if !daily.allowed {
        return daily;
    }
    let hourly = check_hourly(config, now);
    if !hourly.allowed {
        return hourly;
    }
    Verdict::allow("All limits OK")
}

/// In-memory mirror of the store's atomic attempt update.
pub fn increment(config: &mut AgentConfig, now: DateTime<Utc>) {
    record_attempt(config, true, now);
}

pub fn record_attempt(config: &mut AgentConfig, success: bool, now: DateTime<Utc>) {
    roll_windows(config, now);
    config.emails_sent_today = config.emails_sent_today.saturating_add(1);
    config.emails_sent_this_hour = config.emails_sent_this_hour.saturating_add(1);
    config.total_emails_sent = config.total_emails_sent.saturating_add(1);
    if !success {
        config.total_errors = config.total_errors.saturating_add(1);
    }
    config.updated_at = now;
}

pub fn remaining_capacity(config: &mut AgentConfig, now: DateTime<Utc>) -> Capacity {
    roll_windows(config, now);
    Capacity {
        daily: WindowUsage::new(config.emails_sent_today, config.daily_email_limit),
        hourly: WindowUsage::new(config.emails_sent_this_hour, config.hourly_email_limit),
    }
}

pub fn reset_counters(config: &mut AgentConfig, now: DateTime<Utc>) {
    config.emails_sent_today = 0;
    config.emails_sent_this_hour = 0;
    config.last_reset_date = Some(now.date_naive());
    config.last_hour_reset = Some(now);
    config.updated_at = now;
}
