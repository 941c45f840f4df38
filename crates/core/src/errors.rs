use thiserror::Error;

use crate::{delivery::DeliveryError, lifecycle::LeadTransitionError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    LeadTransition(#[from] LeadTransitionError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Failure taxonomy shared by the operator surfaces.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    StateConflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("agent config not found; run `cadence migrate` and `cadence agent start`")]
    ConfigMissing,
}

impl From<DeliveryError> for ApplicationError {
    fn from(value: DeliveryError) -> Self {
        Self::Domain(DomainError::Delivery(value))
    }
}

impl From<LeadTransitionError> for ApplicationError {
    fn from(value: LeadTransitionError) -> Self {
        Self::Domain(DomainError::LeadTransition(value))
    }
}

impl ApplicationError {
    /// Stable snake_case label for structured output.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Domain(_) | Self::InvalidInput(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::StateConflict(_) | Self::ConfigMissing => "agent_state",
            Self::Persistence(_) | Self::Integration(_) => "persistence",
        }
    }

    /// Whether retrying the same request later could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Integration(_))
    }
}

#[cfg(test)]
mod tests {
    use crate::delivery::DeliveryError;
    use crate::domain::email_queue::{EmailQueueId, QueueStatus};
    use crate::domain::lead::LeadStatus;
    use crate::errors::{ApplicationError, DomainError};
    use crate::lifecycle::{LeadEvent, LeadTransitionError};

    #[test]
    fn lead_transition_error_is_an_invalid_request() {
        let error = ApplicationError::from(LeadTransitionError::InvalidTransition {
            state: LeadStatus::Closed,
            event: LeadEvent::FollowUpQueued,
        });

        assert!(matches!(error, ApplicationError::Domain(DomainError::LeadTransition(_))));
        assert_eq!(error.class(), "invalid_request");
        assert!(!error.is_transient());
    }

    #[test]
    fn delivery_conflicts_stay_domain_errors() {
        let error = ApplicationError::from(DeliveryError::InvalidTransition {
            from: QueueStatus::Sent,
            to: QueueStatus::Pending,
            reason: "only failed rows can be requeued".to_string(),
        });
        assert_eq!(error.class(), "invalid_request");

        let claimed = ApplicationError::from(DeliveryError::ClaimConflict(EmailQueueId("q-1".into())));
        assert!(claimed.to_string().contains("q-1"));
    }

    #[test]
    fn persistence_failures_are_transient() {
        let error = ApplicationError::Persistence("database is locked".to_owned());
        assert_eq!(error.class(), "persistence");
        assert!(error.is_transient());
    }

    #[test]
    fn missing_agent_config_points_at_the_fix() {
        let error = ApplicationError::ConfigMissing;
        assert_eq!(error.class(), "agent_state");
        assert!(error.to_string().contains("cadence agent start"));
    }
}
