use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub smtp: SmtpConfig,
    pub agent: AgentLoopConfig,
    pub worker: WorkerConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    /// When false, sends are rejected by the transport instead of reaching a relay.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub timeout_secs: u64,
}

/// Cadence of the background loops driven by the server.
#[derive(Clone, Debug)]
pub struct AgentLoopConfig {
    pub tick_secs: u64,
    pub inbox_poll_secs: u64,
    pub health_check_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Upper bound on sends enqueued by a single cycle.
    pub hard_cycle_ceiling: u32,
    pub candidate_batch: u32,
    pub log_retention_days: u32,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub hard_time_limit_secs: u64,
    pub claim_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub smtp_enabled: Option<bool>,
    pub smtp_host: Option<String>,
    pub worker_concurrency: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://cadence.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3".to_string(),
                timeout_secs: 60,
            },
            smtp: SmtpConfig {
                enabled: false,
                host: "localhost".to_string(),
                port: 587,
                username: None,
                password: None,
                from_address: "outreach@localhost".to_string(),
                from_name: None,
                timeout_secs: 30,
            },
            agent: AgentLoopConfig {
                tick_secs: 300,
                inbox_poll_secs: 900,
                health_check_secs: 600,
                cleanup_interval_secs: 86_400,
                hard_cycle_ceiling: 20,
                candidate_batch: 200,
                log_retention_days: 90,
            },
            worker: WorkerConfig {
                concurrency: 4,
                max_retries: 3,
                retry_base_delay_secs: 300,
                retry_max_delay_secs: 3_600,
                hard_time_limit_secs: 300,
                claim_timeout_secs: 600,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("cadence.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(smtp) = patch.smtp {
            if let Some(enabled) = smtp.enabled {
                self.smtp.enabled = enabled;
            }
            if let Some(host) = smtp.host {
                self.smtp.host = host;
            }
            if let Some(port) = smtp.port {
                self.smtp.port = port;
            }
            if let Some(username) = smtp.username {
                self.smtp.username = Some(username);
            }
            if let Some(smtp_password_value) = smtp.password {
                self.smtp.password = Some(secret_value(smtp_password_value));
            }
            if let Some(from_address) = smtp.from_address {
                self.smtp.from_address = from_address;
            }
            if let Some(from_name) = smtp.from_name {
                self.smtp.from_name = Some(from_name);
            }
            if let Some(timeout_secs) = smtp.timeout_secs {
                self.smtp.timeout_secs = timeout_secs;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(tick_secs) = agent.tick_secs {
                self.agent.tick_secs = tick_secs;
            }
            if let Some(inbox_poll_secs) = agent.inbox_poll_secs {
                self.agent.inbox_poll_secs = inbox_poll_secs;
            }
            if let Some(health_check_secs) = agent.health_check_secs {
                self.agent.health_check_secs = health_check_secs;
            }
            if let Some(cleanup_interval_secs) = agent.cleanup_interval_secs {
                self.agent.cleanup_interval_secs = cleanup_interval_secs;
            }
            if let Some(hard_cycle_ceiling) = agent.hard_cycle_ceiling {
                self.agent.hard_cycle_ceiling = hard_cycle_ceiling;
            }
            if let Some(candidate_batch) = agent.candidate_batch {
                self.agent.candidate_batch = candidate_batch;
            }
            if let Some(log_retention_days) = agent.log_retention_days {
                self.agent.log_retention_days = log_retention_days;
            }
        }

        if let Some(worker) = patch.worker {
            if let Some(concurrency) = worker.concurrency {
                self.worker.concurrency = concurrency;
            }
            if let Some(max_retries) = worker.max_retries {
                self.worker.max_retries = max_retries;
            }
            if let Some(retry_base_delay_secs) = worker.retry_base_delay_secs {
                self.worker.retry_base_delay_secs = retry_base_delay_secs;
            }
            if let Some(retry_max_delay_secs) = worker.retry_max_delay_secs {
                self.worker.retry_max_delay_secs = retry_max_delay_secs;
            }
            if let Some(hard_time_limit_secs) = worker.hard_time_limit_secs {
                self.worker.hard_time_limit_secs = hard_time_limit_secs;
            }
            if let Some(claim_timeout_secs) = worker.claim_timeout_secs {
                self.worker.claim_timeout_secs = claim_timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CADENCE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CADENCE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("CADENCE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CADENCE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("CADENCE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CADENCE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CADENCE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CADENCE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CADENCE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CADENCE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("CADENCE_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CADENCE_SMTP_ENABLED") {
            self.smtp.enabled = parse_env("CADENCE_SMTP_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CADENCE_SMTP_HOST") {
            self.smtp.host = value;
        }
        if let Some(value) = read_env("CADENCE_SMTP_PORT") {
            self.smtp.port = parse_env("CADENCE_SMTP_PORT", &value)?;
        }
        if let Some(value) = read_env("CADENCE_SMTP_USERNAME") {
            self.smtp.username = Some(value);
        }
        if let Some(value) = read_env("CADENCE_SMTP_PASSWORD") {
            self.smtp.password = Some(secret_value(value));
        }
        if let Some(value) = read_env("CADENCE_SMTP_FROM_ADDRESS") {
            self.smtp.from_address = value;
        }
        if let Some(value) = read_env("CADENCE_SMTP_FROM_NAME") {
            self.smtp.from_name = Some(value);
        }
        if let Some(value) = read_env("CADENCE_SMTP_TIMEOUT_SECS") {
            self.smtp.timeout_secs = parse_env("CADENCE_SMTP_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CADENCE_AGENT_TICK_SECS") {
            self.agent.tick_secs = parse_env("CADENCE_AGENT_TICK_SECS", &value)?;
        }
        if let Some(value) = read_env("CADENCE_AGENT_INBOX_POLL_SECS") {
            self.agent.inbox_poll_secs = parse_env("CADENCE_AGENT_INBOX_POLL_SECS", &value)?;
        }
        if let Some(value) = read_env("CADENCE_AGENT_HEALTH_CHECK_SECS") {
            self.agent.health_check_secs = parse_env("CADENCE_AGENT_HEALTH_CHECK_SECS", &value)?;
        }
        if let Some(value) = read_env("CADENCE_AGENT_HARD_CYCLE_CEILING") {
            self.agent.hard_cycle_ceiling =
                parse_env("CADENCE_AGENT_HARD_CYCLE_CEILING", &value)?;
        }
        if let Some(value) = read_env("CADENCE_AGENT_LOG_RETENTION_DAYS") {
            self.agent.log_retention_days =
                parse_env("CADENCE_AGENT_LOG_RETENTION_DAYS", &value)?;
        }

        if let Some(value) = read_env("CADENCE_WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_env("CADENCE_WORKER_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("CADENCE_WORKER_MAX_RETRIES") {
            self.worker.max_retries = parse_env("CADENCE_WORKER_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("CADENCE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CADENCE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_env("CADENCE_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("CADENCE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("CADENCE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("CADENCE_LOGGING_LEVEL").or_else(|| read_env("CADENCE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CADENCE_LOGGING_FORMAT").or_else(|| read_env("CADENCE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(enabled) = overrides.smtp_enabled {
            self.smtp.enabled = enabled;
        }
        if let Some(host) = overrides.smtp_host {
            self.smtp.host = host;
        }
        if let Some(concurrency) = overrides.worker_concurrency {
            self.worker.concurrency = concurrency;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_smtp(&self.smtp)?;
        validate_agent(&self.agent)?;
        validate_worker(&self.worker)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("cadence.toml"), PathBuf::from("config/cadence.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_smtp(smtp: &SmtpConfig) -> Result<(), ConfigError> {
    if smtp.timeout_secs == 0 || smtp.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "smtp.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if !smtp.enabled {
        return Ok(());
    }

    if smtp.host.trim().is_empty() {
        return Err(ConfigError::Validation(
            "smtp.host is required when smtp.enabled is true".to_string(),
        ));
    }
    if smtp.port == 0 {
        return Err(ConfigError::Validation("smtp.port must be greater than zero".to_string()));
    }
    if !smtp.from_address.contains('@') {
        return Err(ConfigError::Validation(
            "smtp.from_address must be an email address (e.g. `outreach@yourdomain.com`)"
                .to_string(),
        ));
    }

    let has_password = smtp
        .password
        .as_ref()
        .map(|value| !value.expose_secret().trim().is_empty())
        .unwrap_or(false);
    if smtp.username.is_some() != has_password {
        return Err(ConfigError::Validation(
            "smtp.username and smtp.password must be set together".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentLoopConfig) -> Result<(), ConfigError> {
    if agent.tick_secs == 0 || agent.inbox_poll_secs == 0 || agent.health_check_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.tick_secs, agent.inbox_poll_secs and agent.health_check_secs must be greater than zero"
                .to_string(),
        ));
    }
    if agent.cleanup_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "agent.cleanup_interval_secs must be greater than zero".to_string(),
        ));
    }
    if agent.hard_cycle_ceiling == 0 {
        return Err(ConfigError::Validation(
            "agent.hard_cycle_ceiling must be greater than zero".to_string(),
        ));
    }
    if agent.candidate_batch == 0 || agent.candidate_batch > 1_000 {
        return Err(ConfigError::Validation(
            "agent.candidate_batch must be in range 1..=1000".to_string(),
        ));
    }
    if agent.log_retention_days == 0 {
        return Err(ConfigError::Validation(
            "agent.log_retention_days must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_worker(worker: &WorkerConfig) -> Result<(), ConfigError> {
    if worker.concurrency == 0 || worker.concurrency > 64 {
        return Err(ConfigError::Validation(
            "worker.concurrency must be in range 1..=64".to_string(),
        ));
    }
    if worker.retry_base_delay_secs == 0 {
        return Err(ConfigError::Validation(
            "worker.retry_base_delay_secs must be greater than zero".to_string(),
        ));
    }
    if worker.retry_max_delay_secs < worker.retry_base_delay_secs {
        return Err(ConfigError::Validation(
            "worker.retry_max_delay_secs must be at least worker.retry_base_delay_secs"
                .to_string(),
        ));
    }
    if worker.hard_time_limit_secs == 0 {
        return Err(ConfigError::Validation(
            "worker.hard_time_limit_secs must be greater than zero".to_string(),
        ));
    }
    if worker.claim_timeout_secs <= worker.hard_time_limit_secs {
        return Err(ConfigError::Validation(
            "worker.claim_timeout_secs must exceed worker.hard_time_limit_secs".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    smtp: Option<SmtpPatch>,
    agent: Option<AgentPatch>,
    worker: Option<WorkerPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SmtpPatch {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    from_address: Option<String>,
    from_name: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    tick_secs: Option<u64>,
    inbox_poll_secs: Option<u64>,
    health_check_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    hard_cycle_ceiling: Option<u32>,
    candidate_batch: Option<u32>,
    log_retention_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    concurrency: Option<usize>,
    max_retries: Option<u32>,
    retry_base_delay_secs: Option<u64>,
    retry_max_delay_secs: Option<u64>,
    hard_time_limit_secs: Option<u64>,
    claim_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
