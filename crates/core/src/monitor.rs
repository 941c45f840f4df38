//! Periodic agent health evaluation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent_config::AgentConfig;
use crate::safety;

pub const INACTIVITY_ALERT_MINUTES: i64 = 30;
pub const ERROR_RATE_ALERT_MIN_SENT: u64 = 10;
pub const ERROR_RATE_ALERT_PCT: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    NoActivity,
    HighErrorRate,
    ZeroSends,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthAlert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub alerts: Vec<HealthAlert>,
    pub error_rate_pct: f64,
    /// The configured auto-pause threshold was crossed.
    pub emergency_stop_required: bool,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn status(&self) -> &'static str {
        if self.is_healthy() {
            "healthy"
        } else {
            "unhealthy"
        }
    }
}

pub fn evaluate_health(config: &AgentConfig, now: DateTime<Utc>) -> HealthReport {
    let mut alerts = Vec::new();

    if config.is_running {
        if let Some(last_run) = config.last_agent_run_at {
            let idle = now - last_run;
            if idle > Duration::minutes(INACTIVITY_ALERT_MINUTES) {
                alerts.push(HealthAlert {
                    kind: AlertKind::NoActivity,
                    severity: AlertSeverity::Warning,
                    message: format!("Agent hasn't run in {} minutes", idle.num_minutes()),
                });
            }
        }
    }

    let error_rate_pct = config.error_rate_pct();
    if config.total_emails_sent > ERROR_RATE_ALERT_MIN_SENT && error_rate_pct > ERROR_RATE_ALERT_PCT
    {
        alerts.push(HealthAlert {
            kind: AlertKind::HighErrorRate,
            severity: AlertSeverity::Critical,
            message: format!("Error rate at {error_rate_pct:.1}%"),
        });
    }

    let sent_today = if config.last_reset_date == Some(now.date_naive()) {
        config.emails_sent_today
    } else {
        0
    };
    if config.is_running && sent_today == 0 {
        alerts.push(HealthAlert {
            kind: AlertKind::ZeroSends,
            severity: AlertSeverity::Info,
            message: "No emails sent today".to_string(),
        });
    }

    let emergency_stop_required = config.is_running && !safety::check_error_rate(config).safe;

    HealthReport { alerts, error_rate_pct, emergency_stop_required, checked_at: now }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{evaluate_health, AlertKind, AlertSeverity};
    use crate::domain::agent_config::AgentConfig;

    fn running(now: chrono::DateTime<Utc>) -> AgentConfig {
        let mut config = AgentConfig::with_defaults(now);
        config.is_running = true;
        config.last_agent_run_at = Some(now - Duration::minutes(2));
        config.last_reset_date = Some(now.date_naive());
        config.emails_sent_today = 4;
        config
    }

    #[test]
    fn quiet_running_agent_is_healthy() {
        let now = Utc::now();
        let report = evaluate_health(&running(now), now);
        assert!(report.is_healthy());
        assert_eq!(report.status(), "healthy");
        assert!(!report.emergency_stop_required);
    }

    #[test]
    fn stalled_agent_raises_no_activity_warning() {
        let now = Utc::now();
        let mut config = running(now);
        config.last_agent_run_at = Some(now - Duration::minutes(45));

        let report = evaluate_health(&config, now);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].kind, AlertKind::NoActivity);
        assert_eq!(report.alerts[0].severity, AlertSeverity::Warning);
        assert_eq!(report.alerts[0].message, "Agent hasn't run in 45 minutes");
    }

    #[test]
    fn high_error_rate_is_critical_and_requests_stop() {
        let now = Utc::now();
        let mut config = running(now);
        config.total_emails_sent = 20;
        config.total_errors = 5;

        let report = evaluate_health(&config, now);
        assert!(report
            .alerts
            .iter()
            .any(|alert| alert.kind == AlertKind::HighErrorRate
                && alert.severity == AlertSeverity::Critical
                && alert.message == "Error rate at 25.0%"));
        assert!(report.emergency_stop_required);

        config.pause_on_high_error_rate = false;
        assert!(!evaluate_health(&config, now).emergency_stop_required);
    }

    #[test]
    fn small_samples_do_not_raise_error_rate_alert() {
        let now = Utc::now();
        let mut config = running(now);
        config.total_emails_sent = 10;
        config.total_errors = 5;
        let report = evaluate_health(&config, now);
        assert!(report.alerts.iter().all(|alert| alert.kind != AlertKind::HighErrorRate));
    }

    #[test]
    fn stale_daily_counter_counts_as_zero_sends() {
        let now = Utc::now();
        let mut config = running(now);
        config.last_reset_date = Some((now - Duration::days(1)).date_naive());

        let report = evaluate_health(&config, now);
        assert_eq!(report.alerts[0].kind, AlertKind::ZeroSends);
        assert_eq!(report.alerts[0].severity, AlertSeverity::Info);
    }

    #[test]
    fn stopped_agent_only_reports_error_rate() {
        let now = Utc::now();
        let mut config = AgentConfig::with_defaults(now);
        config.last_agent_run_at = Some(now - Duration::days(3));
        assert!(evaluate_health(&config, now).is_healthy());
    }
}
