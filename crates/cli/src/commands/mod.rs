pub mod agent;
pub mod config;
pub mod doctor;
pub mod inbox;
pub mod leads;
pub mod migrate;
pub mod queue;
pub mod seed;

use std::future::Future;
use std::sync::Arc;

use cadence_agent::{AgentRuntime, AgentStores, ControlError};
use cadence_core::config::{AppConfig, LoadOptions};
use cadence_core::errors::ApplicationError;
use cadence_core::schedule::SystemClock;
use cadence_db::{connect_with_config, migrations};
use serde::Serialize;
use serde_json::Value;

/// `(error_class, message, exit_code)` carried out of an async command body.
pub(crate) type Failure = (&'static str, String, u8);

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data: None,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    /// Success with a structured body under `data`.
    pub fn success_with(command: &str, message: impl Into<String>, data: impl Serialize) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data: serde_json::to_value(data).ok(),
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<tokio::runtime::Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            3,
        )
    })
}

/// Connects, applies pending migrations and hands `body` a fully wired agent.
pub(crate) fn with_agent<T, F, Fut>(command: &str, body: F) -> Result<T, CommandResult>
where
    F: FnOnce(AppConfig, AgentRuntime) -> Fut,
    Fut: Future<Output = Result<T, Failure>>,
{
    let config = load_config(command)?;
    let runtime = build_runtime(command)?;

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let agent =
            AgentRuntime::build(&config, AgentStores::sql(pool.clone()), Arc::new(SystemClock))
                .map_err(|error| ("runtime_init", error.to_string(), 3u8))?;
        let outcome = body(config, agent).await;
        pool.close().await;
        outcome
    });

    result.map_err(|(error_class, message, exit_code)| {
        CommandResult::failure(command, error_class, message, exit_code)
    })
}

pub(crate) fn control_failure(error: ControlError) -> Failure {
    let error = ApplicationError::from(error);
    let exit_code = match &error {
        ApplicationError::StateConflict(_) | ApplicationError::ConfigMissing => 7,
        ApplicationError::NotFound(_) => 8,
        ApplicationError::Domain(_) | ApplicationError::InvalidInput(_) => 9,
        ApplicationError::Persistence(_) | ApplicationError::Integration(_) => 10,
    };
    (error.class(), error.to_string(), exit_code)
}

/// Collapses a command body outcome into the printed result.
pub(crate) fn finish<T: Serialize>(
    command: &str,
    outcome: Result<(String, T), CommandResult>,
) -> CommandResult {
    match outcome {
        Ok((message, data)) => CommandResult::success_with(command, message, data),
        Err(failure) => failure,
    }
}
