//! Assembles the agent from configuration.
//!
//! The server and the CLI both need the same graph: one LLM client, one mail transport and
//! one worker pool shared by the runner, the control surface and the scheduler.

use std::sync::Arc;

use cadence_core::config::AppConfig;
use cadence_core::delivery::{DeliveryEngine, DeliveryEngineConfig};
use cadence_core::schedule::Clock;
use thiserror::Error;

use crate::control::AgentControl;
use crate::executor::SendExecutor;
use crate::llm::{self, LlmClient, LlmError};
use crate::mail::{self, MailError, MailTransport};
use crate::prompt::{PromptError, PromptRenderer};
use crate::queue::{PoolSettings, TaskQueue, WorkerPool};
use crate::replies::{ReplyFetcher, ReplyProcessor};
use crate::runner::{AgentRunner, RunnerSettings};
use crate::scheduler::{AgentScheduler, SchedulerSettings};
use crate::stores::AgentStores;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Mail(#[from] MailError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

pub struct AgentRuntime {
    pub stores: AgentStores,
    pub pool: WorkerPool,
    pub runner: Arc<AgentRunner>,
    pub control: AgentControl,
    pub replies: Arc<ReplyProcessor>,
    engine: DeliveryEngine,
    clock: Arc<dyn Clock>,
    scheduler_settings: SchedulerSettings,
}

impl AgentRuntime {
    pub fn build(
        config: &AppConfig,
        stores: AgentStores,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RuntimeError> {
        let llm: Arc<dyn LlmClient> = Arc::from(llm::from_config(&config.llm)?);
        let mail: Arc<dyn MailTransport> = Arc::from(mail::from_config(&config.smtp)?);
        tracing::info!(
            event_name = "agent.runtime_built",
            llm = llm.name(),
            smtp_enabled = config.smtp.enabled,
            concurrency = config.worker.concurrency,
        );
        Self::with_collaborators(config, stores, clock, llm, mail)
    }

    /// Same wiring as [`AgentRuntime::build`] with caller-supplied LLM and mail backends.
    pub fn with_collaborators(
        config: &AppConfig,
        stores: AgentStores,
        clock: Arc<dyn Clock>,
        llm: Arc<dyn LlmClient>,
        mail: Arc<dyn MailTransport>,
    ) -> Result<Self, RuntimeError> {
        let prompts = Arc::new(PromptRenderer::new()?);
        let engine = DeliveryEngine::with_config(DeliveryEngineConfig::from(&config.worker));

        let executor = SendExecutor::new(
            stores.clone(),
            engine.clone(),
            llm.clone(),
            mail,
            prompts.clone(),
            clock.clone(),
        )
        .with_sender_name(config.smtp.from_name.clone());
        let pool = WorkerPool::new(Arc::new(executor), PoolSettings::from(&config.worker));
        let queue: Arc<dyn TaskQueue> = Arc::new(pool.clone());

        let runner = Arc::new(AgentRunner::new(
            stores.clone(),
            engine.clone(),
            queue.clone(),
            clock.clone(),
            RunnerSettings::from(&config.agent),
        ));
        let control =
            AgentControl::new(stores.clone(), engine.clone(), queue, runner.clone(), clock.clone());
        let replies = Arc::new(ReplyProcessor::new(stores.clone(), llm, prompts, clock.clone()));

        Ok(Self {
            stores,
            pool,
            runner,
            control,
            replies,
            engine,
            clock,
            scheduler_settings: SchedulerSettings::from(&config.agent),
        })
    }

    pub fn scheduler(&self, fetcher: Option<Arc<dyn ReplyFetcher>>) -> AgentScheduler {
        AgentScheduler::new(
            self.stores.clone(),
            self.engine.clone(),
            self.runner.clone(),
            self.replies.clone(),
            fetcher,
            Arc::new(self.pool.clone()),
            self.clock.clone(),
            self.scheduler_settings.clone(),
        )
    }
}
