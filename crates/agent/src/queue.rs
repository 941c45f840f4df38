//! In-process task queue for send jobs.
//!
//! Jobs carry only a queue row id; all state lives in the database, so a lost task is
//! recovered by re-dispatching the row. Concurrency is bounded by a semaphore and every
//! attempt runs under a hard time limit. A job asking for a retry is resubmitted under the
//! same task id after its delay.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::WorkerConfig;
use cadence_core::domain::email_queue::{EmailQueueId, TaskId};
use thiserror::Error;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendJob {
    pub queue_id: EmailQueueId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Done,
    RetryAfter(Duration),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task queue is shut down")]
    Closed,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &SendJob, task_id: &TaskId) -> JobOutcome;
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: SendJob, delay: Option<Duration>) -> Result<TaskId, QueueError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub concurrency: usize,
    pub hard_time_limit: Duration,
}

impl From<&WorkerConfig> for PoolSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            hard_time_limit: Duration::from_secs(config.hard_time_limit_secs),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    hard_time_limit: Duration,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    idle: Notify,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn JobHandler>, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                handler,
                permits: Arc::new(Semaphore::new(settings.concurrency.max(1))),
                hard_time_limit: settings.hard_time_limit,
                in_flight: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Jobs accepted and not yet finished, including ones waiting out a retry delay.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until no job is in flight. Returns false if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let inner = Arc::clone(&self.inner);
        let wait = async move {
            loop {
                let notified = inner.idle.notified();
                if inner.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Stops accepting jobs. Running attempts finish; waiting ones are dropped and their
    /// rows are picked up again by recovery.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.permits.close();
        tracing::info!(event_name = "worker_pool.shutdown", in_flight = self.in_flight());
    }
}

#[async_trait]
impl TaskQueue for WorkerPool {
    async fn enqueue(&self, job: SendJob, delay: Option<Duration>) -> Result<TaskId, QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let task_id = TaskId(Uuid::new_v4().to_string());
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_job(Arc::clone(&self.inner), job, task_id.clone(), delay));
        Ok(task_id)
    }
}

async fn run_job(inner: Arc<PoolInner>, job: SendJob, task_id: TaskId, delay: Option<Duration>) {
    let mut delay = delay;
    loop {
        if let Some(wait) = delay.take() {
            tokio::time::sleep(wait).await;
        }
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        let Ok(permit) = Arc::clone(&inner.permits).acquire_owned().await else {
            break;
        };
        let attempt = tokio::time::timeout(inner.hard_time_limit, inner.handler.handle(&job, &task_id));
        let outcome = attempt.await;
        drop(permit);

        match outcome {
            Ok(JobOutcome::Done) => break,
            Ok(JobOutcome::RetryAfter(wait)) => {
                tracing::debug!(
                    event_name = "worker_pool.retry_scheduled",
                    queue_id = %job.queue_id,
                    task_id = %task_id.0,
                    delay_secs = wait.as_secs(),
                );
                delay = Some(wait);
            }
            Err(_) => {
                // The row stays in processing; the orphan sweep reclaims it once stale.
                tracing::error!(
                    event_name = "worker_pool.time_limit_exceeded",
                    queue_id = %job.queue_id,
                    task_id = %task_id.0,
                    limit_secs = inner.hard_time_limit.as_secs(),
                );
                break;
            }
        }
    }

    if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        inner.idle.notify_waiters();
    }
}
