pub mod config;
pub mod decision;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod monitor;
pub mod rate_limit;
pub mod replies;
pub mod safety;
pub mod schedule;

pub use chrono;

pub use decision::{Decision, DecisionAction, DecisionBatch};
pub use delivery::{DeliveryEngine, DeliveryEngineConfig, DeliveryError, RetryPolicy};
pub use domain::agent_config::{AgentConfig, AgentSettingsPatch};
pub use domain::email_queue::{EmailKind, EmailQueueEntry, EmailQueueId, QueueStatus};
pub use domain::lead::{ContentVariant, Lead, LeadId, LeadStatus};
pub use errors::{ApplicationError, DomainError};
pub use lifecycle::{LeadEvent, LeadTransition, LeadTransitionError};
pub use rate_limit::{Capacity, Verdict};
pub use schedule::{Clock, FixedClock, SystemClock};
