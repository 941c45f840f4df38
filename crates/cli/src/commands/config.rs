use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use cadence_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// One reported setting: dotted key, display value and the env var that can override it.
struct Field {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

fn field(key: &'static str, value: impl ToString, env_key: &'static str) -> Field {
    Field { key, value: value.to_string(), env_key }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key,
            field.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let llm_api_key = config.llm.api_key.as_ref().map(|key| redact_secret(key.expose_secret()));
    let smtp_password =
        config.smtp.password.as_ref().map(|password| redact_secret(password.expose_secret()));

    vec![
        field("database.url", &config.database.url, "CADENCE_DATABASE_URL"),
        field(
            "database.max_connections",
            config.database.max_connections,
            "CADENCE_DATABASE_MAX_CONNECTIONS",
        ),
        field("database.timeout_secs", config.database.timeout_secs, "CADENCE_DATABASE_TIMEOUT_SECS"),
        field("llm.provider", format!("{:?}", config.llm.provider), "CADENCE_LLM_PROVIDER"),
        field("llm.model", &config.llm.model, "CADENCE_LLM_MODEL"),
        field(
            "llm.base_url",
            config.llm.base_url.as_deref().unwrap_or("<unset>"),
            "CADENCE_LLM_BASE_URL",
        ),
        field("llm.api_key", llm_api_key.as_deref().unwrap_or("<unset>"), "CADENCE_LLM_API_KEY"),
        field("llm.timeout_secs", config.llm.timeout_secs, "CADENCE_LLM_TIMEOUT_SECS"),
        field("smtp.enabled", config.smtp.enabled, "CADENCE_SMTP_ENABLED"),
        field("smtp.host", &config.smtp.host, "CADENCE_SMTP_HOST"),
        field("smtp.port", config.smtp.port, "CADENCE_SMTP_PORT"),
        field(
            "smtp.username",
            config.smtp.username.as_deref().unwrap_or("<unset>"),
            "CADENCE_SMTP_USERNAME",
        ),
        field(
            "smtp.password",
            smtp_password.as_deref().unwrap_or("<unset>"),
            "CADENCE_SMTP_PASSWORD",
        ),
        field("smtp.from_address", &config.smtp.from_address, "CADENCE_SMTP_FROM_ADDRESS"),
        field(
            "smtp.from_name",
            config.smtp.from_name.as_deref().unwrap_or("<unset>"),
            "CADENCE_SMTP_FROM_NAME",
        ),
        field("agent.tick_secs", config.agent.tick_secs, "CADENCE_AGENT_TICK_SECS"),
        field("agent.inbox_poll_secs", config.agent.inbox_poll_secs, "CADENCE_AGENT_INBOX_POLL_SECS"),
        field(
            "agent.health_check_secs",
            config.agent.health_check_secs,
            "CADENCE_AGENT_HEALTH_CHECK_SECS",
        ),
        field(
            "agent.hard_cycle_ceiling",
            config.agent.hard_cycle_ceiling,
            "CADENCE_AGENT_HARD_CYCLE_CEILING",
        ),
        field(
            "agent.log_retention_days",
            config.agent.log_retention_days,
            "CADENCE_AGENT_LOG_RETENTION_DAYS",
        ),
        field("worker.concurrency", config.worker.concurrency, "CADENCE_WORKER_CONCURRENCY"),
        field("worker.max_retries", config.worker.max_retries, "CADENCE_WORKER_MAX_RETRIES"),
        field("server.bind_address", &config.server.bind_address, "CADENCE_SERVER_BIND_ADDRESS"),
        field(
            "server.health_check_port",
            config.server.health_check_port,
            "CADENCE_SERVER_HEALTH_CHECK_PORT",
        ),
        field("logging.level", &config.logging.level, "CADENCE_LOGGING_LEVEL"),
        field("logging.format", format!("{:?}", config.logging.format), "CADENCE_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["cadence.toml", "config/cadence.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Keeps the first four characters of long secrets so operators can tell keys apart.
fn redact_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    if trimmed.chars().count() > 12 {
        let prefix: String = trimmed.chars().take(4).collect();
        return format!("{prefix}***");
    }
    "<redacted>".to_string()
}
