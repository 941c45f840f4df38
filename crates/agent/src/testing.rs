//! Fakes shared by the agent unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::chrono::{DateTime, TimeZone, Utc};
use cadence_core::delivery::{DeliveryEngine, DeliveryEngineConfig};
use cadence_core::domain::action_log::{ActionLogQuery, ActionStatistics, AgentActionLog};
use cadence_core::domain::agent_config::AgentConfig;
use cadence_core::domain::email_queue::TaskId;
use cadence_core::schedule::{Clock, FixedClock};
use cadence_db::repositories::{ActionLogRepository, RepositoryError};
use tokio::sync::Mutex;

use crate::llm::{LlmClient, LlmError};
use crate::mail::{MailError, MailTransport, OutboundEmail};
use crate::queue::{QueueError, SendJob, TaskQueue};

/// Monday 2026-03-09 14:00 UTC, inside New York business hours.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).single().expect("valid instant")
}

pub fn clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(now()))
}

pub fn engine() -> DeliveryEngine {
    DeliveryEngine::with_config(DeliveryEngineConfig {
        retry_jitter_ratio: 0.0,
        ..DeliveryEngineConfig::default()
    })
}

pub fn running_config() -> AgentConfig {
    let mut config = AgentConfig::with_defaults(now());
    config.is_running = true;
    config.agent_started_at = Some(now());
    config
}

pub struct ScriptedLlm {
    reply: Mutex<Option<String>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Mutex::new(Some(text.to_string())),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self { reply: Mutex::new(None), calls: AtomicUsize::new(0), prompts: Mutex::new(Vec::new()) }
    }

    pub async fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn prompts(&self) -> Vec<String> {
        self.prompts.lock().await.clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().await.push(prompt.to_string());
        self.reply.lock().await.clone().ok_or(LlmError::Timeout)
    }
}

pub struct ScriptedMail {
    accepting: Mutex<bool>,
    sent: Mutex<Vec<OutboundEmail>>,
}

impl ScriptedMail {
    pub fn accepting() -> Self {
        Self { accepting: Mutex::new(true), sent: Mutex::new(Vec::new()) }
    }

    pub fn rejecting() -> Self {
        Self { accepting: Mutex::new(false), sent: Mutex::new(Vec::new()) }
    }

    pub async fn set_accepting(&self, accepting: bool) {
        *self.accepting.lock().await = accepting;
    }

    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl MailTransport for ScriptedMail {
    async fn send(&self, email: &OutboundEmail) -> Result<(), MailError> {
        if !*self.accepting.lock().await {
            return Err(MailError::Transport("connection refused".to_string()));
        }
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

/// Records submissions without running anything.
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<(SendJob, Option<Duration>, TaskId)>>,
}

impl RecordingQueue {
    pub async fn jobs(&self) -> Vec<(SendJob, Option<Duration>, TaskId)> {
        self.jobs.lock().await.clone()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn enqueue(&self, job: SendJob, delay: Option<Duration>) -> Result<TaskId, QueueError> {
        let mut jobs = self.jobs.lock().await;
        let task_id = TaskId(format!("task-{}", jobs.len() + 1));
        jobs.push((job, delay, task_id.clone()));
        Ok(task_id)
    }
}

/// Audit store whose writes always fail.
#[derive(Default)]
pub struct FailingActionLog {
    attempts: AtomicUsize,
}

impl FailingActionLog {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionLogRepository for FailingActionLog {
    async fn append(&self, _entry: AgentActionLog) -> Result<(), RepositoryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(RepositoryError::Decode("action log is read-only".to_string()))
    }

    async fn list(&self, _query: &ActionLogQuery) -> Result<Vec<AgentActionLog>, RepositoryError> {
        Ok(Vec::new())
    }

    async fn count(&self, _query: &ActionLogQuery) -> Result<u64, RepositoryError> {
        Ok(0)
    }

    async fn statistics(
        &self,
        _since: Option<DateTime<Utc>>,
    ) -> Result<ActionStatistics, RepositoryError> {
        Ok(ActionStatistics::default())
    }

    async fn prune_before(&self, _cutoff: DateTime<Utc>) -> Result<u64, RepositoryError> {
        Ok(0)
    }
}
