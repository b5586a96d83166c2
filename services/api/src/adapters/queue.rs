//! services/api/src/adapters/queue.rs
//!
//! The durable generation queue: a PostgreSQL table implementing the
//! `TaskQueue` port, and the worker that drains it.
//!
//! Delivery is at-least-once. A claimed task whose worker disappears is
//! reclaimed once its lease runs out, so the work runner must tolerate
//! running the same task twice (it skips units that already exist).

use async_trait::async_trait;
use course_engine_core::dispatcher::{background_budget, GenerationWork, WorkRunner};
use course_engine_core::ports::{PortError, PortResult, TaskHandle, TaskQueue};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Added to the delay before each retry, multiplied by the attempt number.
const RETRY_BACKOFF_STEP: Duration = Duration::from_secs(5);
/// Floor on how long one queued task may run.
pub const QUEUE_TASK_TIMEOUT: Duration = Duration::from_secs(300);
/// A running task not finished within this window is handed out again.
/// Longer than any task timeout, so a live worker is never overtaken.
const CLAIM_LEASE: Duration = Duration::from_secs(360);

//=========================================================================================
// `TaskQueue` Implementation
//=========================================================================================

#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(FromRow)]
struct TaskIdRecord {
    id: Uuid,
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn submit(&self, task_kind: &str, payload: serde_json::Value) -> PortResult<TaskHandle> {
        let record = sqlx::query_as::<_, TaskIdRecord>(
            "INSERT INTO generation_tasks (id, kind, payload) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(task_kind)
        .bind(Json(payload))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PortError::Unavailable(e.to_string()))?;
        Ok(TaskHandle { id: record.id })
    }
}

//=========================================================================================
// Retry Policy
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Linear backoff: the n-th failed attempt waits n steps, until attempts run out.
pub fn retry_decision(attempts: u32, max_attempts: u32) -> RetryDecision {
    if attempts >= max_attempts {
        RetryDecision::GiveUp
    } else {
        RetryDecision::RetryAfter(RETRY_BACKOFF_STEP * attempts.max(1))
    }
}

//=========================================================================================
// Worker
//=========================================================================================

#[derive(FromRow)]
struct ClaimedTask {
    id: Uuid,
    kind: String,
    payload: Json<serde_json::Value>,
    attempts: i32,
}

pub struct QueueWorker {
    pool: PgPool,
    runner: Arc<dyn WorkRunner>,
    poll_interval: Duration,
    max_attempts: u32,
}

impl QueueWorker {
    pub fn new(
        pool: PgPool,
        runner: Arc<dyn WorkRunner>,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            pool,
            runner,
            poll_interval,
            max_attempts,
        }
    }

    /// Polls for due tasks until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(poll_ms = self.poll_interval.as_millis() as u64, "Queue worker started.");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Queue worker stopping.");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            // Drain everything that is due before sleeping again.
            loop {
                if shutdown.is_cancelled() {
                    break;
                }
                match self.claim().await {
                    Ok(Some(task)) => self.process(task).await,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to claim a generation task");
                        break;
                    }
                }
            }
        }
    }

    async fn claim(&self) -> Result<Option<ClaimedTask>, sqlx::Error> {
        sqlx::query_as::<_, ClaimedTask>(
            "UPDATE generation_tasks \
             SET status = 'running', attempts = attempts + 1, updated_at = now() \
             WHERE id = ( \
               SELECT id FROM generation_tasks \
               WHERE (status = 'pending' AND run_at <= now()) \
                  OR (status = 'running' AND updated_at < now() - make_interval(secs => $1)) \
               ORDER BY run_at \
               LIMIT 1 \
               FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, kind, payload, attempts",
        )
        .bind(CLAIM_LEASE.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
    }

    async fn process(&self, task: ClaimedTask) {
        let attempts = task.attempts.max(0) as u32;
        debug!(task_id = %task.id, kind = %task.kind, attempts, "Running generation task");

        let work: GenerationWork = match serde_json::from_value(task.payload.0) {
            Ok(work) => work,
            Err(e) => {
                // A payload that cannot be decoded will never succeed.
                error!(task_id = %task.id, error = %e, "Undecodable generation task");
                self.finish(task.id, "failed", Some(e.to_string())).await;
                return;
            }
        };

        let timeout = background_budget(self.runner.as_ref(), &work, QUEUE_TASK_TIMEOUT);
        let outcome = match tokio::time::timeout(timeout, self.runner.run(&work)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => {
                let reason = format!("timed out after {}s", timeout.as_secs());
                if let Err(e) = self.runner.abandon(&work, &reason).await {
                    warn!(task_id = %task.id, error = %e, "Failed to clean up timed-out work");
                }
                Err(reason)
            }
        };

        match outcome {
            Ok(()) => {
                info!(task_id = %task.id, course_id = %work.course_id, kind = %task.kind, "Generation task done");
                self.finish(task.id, "done", None).await;
            }
            Err(reason) => match retry_decision(attempts, self.max_attempts) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(task_id = %task.id, attempts, %reason, retry_in_s = delay.as_secs(), "Generation task failed, retrying");
                    self.reschedule(task.id, delay, &reason).await;
                }
                RetryDecision::GiveUp => {
                    error!(task_id = %task.id, attempts, %reason, "Generation task failed permanently");
                    self.finish(task.id, "failed", Some(reason)).await;
                }
            },
        }
    }

    async fn finish(&self, task_id: Uuid, status: &str, last_error: Option<String>) {
        let result = sqlx::query(
            "UPDATE generation_tasks SET status = $2, last_error = $3, updated_at = now() WHERE id = $1",
        )
        .bind(task_id)
        .bind(status)
        .bind(last_error)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            error!(%task_id, error = %e, "Failed to record task outcome");
        }
    }

    async fn reschedule(&self, task_id: Uuid, delay: Duration, reason: &str) {
        let result = sqlx::query(
            "UPDATE generation_tasks \
             SET status = 'pending', last_error = $2, \
                 run_at = now() + make_interval(secs => $3), updated_at = now() \
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(reason)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            error!(%task_id, error = %e, "Failed to reschedule task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_until_attempts_run_out() {
        assert_eq!(retry_decision(1, 3), RetryDecision::RetryAfter(Duration::from_secs(5)));
        assert_eq!(retry_decision(2, 3), RetryDecision::RetryAfter(Duration::from_secs(10)));
        assert_eq!(retry_decision(3, 3), RetryDecision::GiveUp);
        assert_eq!(retry_decision(7, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn single_attempt_never_retries() {
        assert_eq!(retry_decision(1, 1), RetryDecision::GiveUp);
    }

    struct BudgetedRunner(Duration);

    #[async_trait]
    impl WorkRunner for BudgetedRunner {
        async fn run(&self, _work: &GenerationWork) -> course_engine_core::EngineResult<()> {
            Ok(())
        }

        fn time_budget(&self, _work: &GenerationWork) -> Option<Duration> {
            Some(self.0)
        }
    }

    fn outline_work() -> GenerationWork {
        GenerationWork {
            course_id: Uuid::new_v4(),
            request: course_engine_core::generation::UnitRequest::Outline,
            mode: course_engine_core::dispatcher::WorkMode::Persist,
        }
    }

    #[test]
    fn task_timeout_covers_the_generation_budget() {
        let work = outline_work();
        let usual = background_budget(&BudgetedRunner(Duration::from_secs(120)), &work, QUEUE_TASK_TIMEOUT);
        assert_eq!(usual, QUEUE_TASK_TIMEOUT);

        let long = background_budget(&BudgetedRunner(Duration::from_secs(400)), &work, QUEUE_TASK_TIMEOUT);
        assert!(long > Duration::from_secs(400));
    }
}
