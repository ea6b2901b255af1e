//! Bounded background queue for fact extraction with per-task status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, mpsc};
use uuid::Uuid;

use crate::app::model::{ExtractionTask, TaskRecord, TaskStatus};
use crate::error::PipelineError;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &ExtractionTask) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("extraction queue is full")]
    Full,
    #[error("extraction queue is shut down")]
    Closed,
}

/// How long a finished task stays visible to `status`.
pub const FINISHED_TASK_RETENTION: Duration = Duration::from_secs(60 * 60);
/// Above this many tracked tasks the oldest finished ones are dropped early.
pub const MAX_TRACKED_TASKS: usize = 10_000;

type StatusMap = Arc<Mutex<HashMap<Uuid, TaskRecord>>>;

#[derive(Clone)]
pub struct ExtractionQueue {
    sender: mpsc::Sender<(Uuid, ExtractionTask)>,
    statuses: StatusMap,
    retention: Duration,
    max_tracked: usize,
}

impl ExtractionQueue {
    /// Spawns the dispatch loop. Must be called inside a tokio runtime.
    pub fn start(
        handler: Arc<dyn TaskHandler>,
        capacity: usize,
        max_concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let statuses: StatusMap = Arc::new(Mutex::new(HashMap::new()));
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));

        tokio::spawn(dispatch_loop(
            receiver,
            handler,
            semaphore,
            Arc::clone(&statuses),
            retry,
        ));

        Self {
            sender,
            statuses,
            retention: FINISHED_TASK_RETENTION,
            max_tracked: MAX_TRACKED_TASKS,
        }
    }

    /// Overrides how long and how many finished task records are kept.
    pub fn with_history(mut self, retention: Duration, max_tracked: usize) -> Self {
        self.retention = retention;
        self.max_tracked = max_tracked.max(1);
        self
    }

    pub async fn enqueue(&self, task: ExtractionTask) -> Result<Uuid, EnqueueError> {
        let task_id = Uuid::new_v4();
        let now = Utc::now();
        {
            let mut statuses = self.statuses.lock().await;
            prune_finished(&mut statuses, now, self.retention, self.max_tracked);
            statuses.insert(
                task_id,
                TaskRecord {
                    task_id,
                    task: task.clone(),
                    status: TaskStatus::Queued,
                    enqueued_at: now,
                    updated_at: now,
                },
            );
        }

        if let Err(err) = self.sender.try_send((task_id, task)) {
            self.statuses.lock().await.remove(&task_id);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
                mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
            });
        }
        tracing::debug!(%task_id, "extraction task queued");
        Ok(task_id)
    }

    pub async fn status(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.statuses.lock().await.get(&task_id).cloned()
    }
}

/// Drops finished records older than `retention`, then the oldest finished
/// ones while the map is full. Queued and running tasks are never dropped.
fn prune_finished(
    statuses: &mut HashMap<Uuid, TaskRecord>,
    now: DateTime<Utc>,
    retention: Duration,
    max_tracked: usize,
) {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    let before = statuses.len();
    statuses.retain(|_, r| !r.status.is_terminal() || now - r.updated_at < retention);

    if statuses.len() >= max_tracked {
        let mut finished = statuses
            .values()
            .filter(|r| r.status.is_terminal())
            .map(|r| (r.updated_at, r.task_id))
            .collect::<Vec<_>>();
        finished.sort();
        let excess = statuses.len() + 1 - max_tracked;
        for (_, task_id) in finished.into_iter().take(excess) {
            statuses.remove(&task_id);
        }
    }

    let pruned = before - statuses.len();
    if pruned > 0 {
        tracing::debug!(pruned, tracked = statuses.len(), "pruned finished extraction tasks");
    }
}

async fn dispatch_loop(
    mut receiver: mpsc::Receiver<(Uuid, ExtractionTask)>,
    handler: Arc<dyn TaskHandler>,
    semaphore: Arc<Semaphore>,
    statuses: StatusMap,
    retry: RetryPolicy,
) {
    while let Some((task_id, task)) = receiver.recv().await {
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(err) => {
                tracing::error!(?err, "extraction queue semaphore closed");
                return;
            }
        };
        let handler = Arc::clone(&handler);
        let statuses = Arc::clone(&statuses);
        tokio::spawn(async move {
            let _permit = permit;
            run_with_retry(task_id, &task, handler.as_ref(), &statuses, retry).await;
        });
    }
}

async fn run_with_retry(
    task_id: Uuid,
    task: &ExtractionTask,
    handler: &dyn TaskHandler,
    statuses: &StatusMap,
    retry: RetryPolicy,
) {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        set_status(statuses, task_id, TaskStatus::Running { attempt }).await;
        match handler.handle(task).await {
            Ok(()) => {
                tracing::info!(
                    %task_id,
                    user_id = %task.user_id,
                    session_id = %task.session_id,
                    attempt,
                    "extraction task succeeded"
                );
                set_status(statuses, task_id, TaskStatus::Succeeded { attempts: attempt }).await;
                return;
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                tracing::warn!(
                    %task_id,
                    user_id = %task.user_id,
                    attempt,
                    ?delay,
                    error = %err,
                    "extraction attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                tracing::error!(
                    %task_id,
                    user_id = %task.user_id,
                    session_id = %task.session_id,
                    attempt,
                    error = %err,
                    "extraction task failed"
                );
                set_status(
                    statuses,
                    task_id,
                    TaskStatus::Failed {
                        attempts: attempt,
                        error: err.to_string(),
                    },
                )
                .await;
                return;
            }
        }
    }
}

async fn set_status(statuses: &StatusMap, task_id: Uuid, status: TaskStatus) {
    if let Some(record) = statuses.lock().await.get_mut(&task_id) {
        record.status = status;
        record.updated_at = Utc::now();
    }
}
