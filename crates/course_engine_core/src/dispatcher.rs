//! crates/course_engine_core/src/dispatcher.rs
//!
//! Background generation dispatch.
//!
//! Work goes to the durable queue when one is configured and accepts it.
//! Otherwise it runs as a detached tokio task bounded by its own timeout and
//! unrelated to the request that triggered it. That path is best-effort: a
//! timeout, failure or crash drops the work. Every dispatch returns a ticket
//! whose state moves through `Queued`, `RunningDetached`, `Done` and
//! `Dropped`, so dropped work is observable instead of vanishing.

use crate::domain::{ContentStatus, Course, CourseStatus};
use crate::error::EngineResult;
use crate::generation::{GenerationOrchestrator, UnitRequest};
use crate::ports::{CourseRepository, TaskQueue};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Floor for background work. A unit whose own generation timeout is longer
/// gets that timeout plus `BACKGROUND_MARGIN`.
pub const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(60);
/// Headroom over the generator timeout, so the orchestrator records its own
/// timeout before the outer one cuts it off.
pub const BACKGROUND_MARGIN: Duration = Duration::from_secs(15);

//=========================================================================================
// Work and Dispatch State
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    /// Generate and write the unit into the course.
    Persist,
    /// Generate into the pregeneration cache only.
    Speculative,
}

/// A unit of background generation, also the durable queue payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationWork {
    pub course_id: Uuid,
    pub request: UnitRequest,
    pub mode: WorkMode,
}

impl GenerationWork {
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.course_id, self.request.unit_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The same unit was already running detached.
    Duplicate,
    Timeout,
    Failed(String),
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
    Queued { task_id: Uuid },
    RunningDetached,
    Done,
    Dropped(DropReason),
}

impl DispatchState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::RunningDetached)
    }
}

/// Observes one dispatch.
#[derive(Debug)]
pub struct DispatchTicket {
    rx: watch::Receiver<DispatchState>,
}

impl DispatchTicket {
    fn settled(state: DispatchState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    pub fn state(&self) -> DispatchState {
        self.rx.borrow().clone()
    }

    /// Waits until the work is queued, done or dropped.
    pub async fn wait(mut self) -> DispatchState {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if current.is_settled() {
                return current;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone();
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchStats {
    queued: AtomicU64,
    detached: AtomicU64,
    done: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchCounts {
    pub queued: u64,
    pub detached: u64,
    pub done: u64,
    pub dropped: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            queued: self.queued.load(Ordering::Relaxed),
            detached: self.detached.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

//=========================================================================================
// Work Runner
//=========================================================================================

/// Executes one piece of background work. Shared by the detached path and
/// whatever consumes the durable queue.
#[async_trait]
pub trait WorkRunner: Send + Sync {
    async fn run(&self, work: &GenerationWork) -> EngineResult<()>;

    /// The longest `run` may legitimately take for `work`, if known.
    fn time_budget(&self, _work: &GenerationWork) -> Option<Duration> {
        None
    }

    /// Cleans up after `work` was cut off from outside.
    async fn abandon(&self, _work: &GenerationWork, _reason: &str) -> EngineResult<()> {
        Ok(())
    }
}

/// The outer timeout for `work`: the runner's budget plus margin, never below `floor`.
pub fn background_budget(runner: &dyn WorkRunner, work: &GenerationWork, floor: Duration) -> Duration {
    runner
        .time_budget(work)
        .map(|budget| (budget + BACKGROUND_MARGIN).max(floor))
        .unwrap_or(floor)
}

/// Whether the unit already exists, making the work a no-op. Keeps
/// redelivered queue tasks harmless.
pub fn is_satisfied(course: &Course, request: &UnitRequest) -> bool {
    match request {
        UnitRequest::Outline => {
            course.outline.is_some() && course.outline_status == ContentStatus::Ready
        }
        UnitRequest::NextStep => course.steps.iter().any(|s| !s.completed),
        UnitRequest::LessonBlocks { lesson_id } => course
            .lesson(lesson_id)
            .map(|l| l.blocks_status == ContentStatus::Ready)
            .unwrap_or(false),
        UnitRequest::BlockContent {
            lesson_id,
            block_id,
        } => course
            .lesson(lesson_id)
            .and_then(|l| l.block(block_id))
            .map(|b| b.content_status == ContentStatus::Ready)
            .unwrap_or(false),
    }
}

/// Runs work through the orchestrator against the latest stored course.
pub struct OrchestratorRunner {
    repo: Arc<dyn CourseRepository>,
    orchestrator: Arc<GenerationOrchestrator>,
}

impl OrchestratorRunner {
    pub fn new(repo: Arc<dyn CourseRepository>, orchestrator: Arc<GenerationOrchestrator>) -> Self {
        Self { repo, orchestrator }
    }
}

#[async_trait]
impl WorkRunner for OrchestratorRunner {
    async fn run(&self, work: &GenerationWork) -> EngineResult<()> {
        let mut course = self.repo.get_course(work.course_id).await?;
        if course.status != CourseStatus::Active {
            debug!(course_id = %course.id, status = %course.status, "Skipping work for inactive course");
            return Ok(());
        }
        if is_satisfied(&course, &work.request) {
            debug!(course_id = %course.id, unit = %work.request.unit_key(), "Unit already generated");
            return Ok(());
        }
        match work.mode {
            WorkMode::Persist => self
                .orchestrator
                .generate(&mut course, &work.request)
                .await
                .map(|_| ()),
            WorkMode::Speculative => self.orchestrator.pregenerate(&course, &work.request).await,
        }
    }

    fn time_budget(&self, work: &GenerationWork) -> Option<Duration> {
        Some(self.orchestrator.timeouts().for_request(&work.request))
    }

    async fn abandon(&self, work: &GenerationWork, reason: &str) -> EngineResult<()> {
        // Speculative work never touches unit statuses.
        if work.mode != WorkMode::Persist {
            return Ok(());
        }
        self.orchestrator
            .mark_abandoned(work.course_id, &work.request, reason)
            .await
    }
}

//=========================================================================================
// Dispatcher
//=========================================================================================

pub struct TaskDispatcher {
    queue: Option<Arc<dyn TaskQueue>>,
    runner: Arc<dyn WorkRunner>,
    timeout: Duration,
    in_flight: Arc<DashMap<String, ()>>,
    stats: Arc<DispatchStats>,
}

impl TaskDispatcher {
    pub fn new(
        queue: Option<Arc<dyn TaskQueue>>,
        runner: Arc<dyn WorkRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            runner,
            timeout,
            in_flight: Arc::new(DashMap::new()),
            stats: Arc::new(DispatchStats::default()),
        }
    }

    pub fn stats(&self) -> DispatchCounts {
        self.stats.snapshot()
    }

    /// Hands `work` to the queue, or runs it detached. Never fails.
    pub async fn dispatch(&self, work: GenerationWork) -> DispatchTicket {
        if let Some(queue) = self.queue.as_ref() {
            match self.submit(queue.as_ref(), &work).await {
                Ok(task_id) => {
                    self.stats.queued.fetch_add(1, Ordering::Relaxed);
                    info!(course_id = %work.course_id, unit = %work.request.unit_key(), %task_id, "Queued background generation");
                    return DispatchTicket::settled(DispatchState::Queued { task_id });
                }
                Err(reason) => {
                    warn!(course_id = %work.course_id, %reason, "Task queue unavailable, running detached");
                }
            }
        }
        self.spawn_detached(work)
    }

    async fn submit(&self, queue: &dyn TaskQueue, work: &GenerationWork) -> Result<Uuid, String> {
        let payload = serde_json::to_value(work).map_err(|e| e.to_string())?;
        queue
            .submit(work.request.task_kind(), payload)
            .await
            .map(|handle| handle.id)
            .map_err(|e| e.to_string())
    }

    fn spawn_detached(&self, work: GenerationWork) -> DispatchTicket {
        let key = work.dedup_key();
        if self.in_flight.insert(key.clone(), ()).is_some() {
            debug!(key, "Identical background work already running");
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return DispatchTicket::settled(DispatchState::Dropped(DropReason::Duplicate));
        }

        let (tx, rx) = watch::channel(DispatchState::RunningDetached);
        self.stats.detached.fetch_add(1, Ordering::Relaxed);

        let runner = self.runner.clone();
        let in_flight = self.in_flight.clone();
        let stats = self.stats.clone();
        let timeout = background_budget(runner.as_ref(), &work, self.timeout);

        tokio::spawn(async move {
            let job = {
                let work = work.clone();
                let runner = runner.clone();
                tokio::spawn(async move { runner.run(&work).await })
            };
            let abort = job.abort_handle();

            let state = match tokio::time::timeout(timeout, job).await {
                Err(_) => {
                    abort.abort();
                    let reason = format!("background generation exceeded {}s", timeout.as_secs());
                    if let Err(e) = runner.abandon(&work, &reason).await {
                        warn!(course_id = %work.course_id, error = %e, "Failed to clean up abandoned work");
                    }
                    DispatchState::Dropped(DropReason::Timeout)
                }
                Ok(Err(_join_error)) => DispatchState::Dropped(DropReason::Panicked),
                Ok(Ok(Err(e))) => DispatchState::Dropped(DropReason::Failed(e.to_string())),
                Ok(Ok(Ok(()))) => DispatchState::Done,
            };

            in_flight.remove(&key);
            match &state {
                DispatchState::Done => {
                    stats.done.fetch_add(1, Ordering::Relaxed);
                    info!(course_id = %work.course_id, unit = %work.request.unit_key(), "Background generation finished");
                }
                DispatchState::Dropped(reason) => {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(course_id = %work.course_id, unit = %work.request.unit_key(), ?reason, "Background generation dropped");
                }
                _ => {}
            }
            tx.send_replace(state);
        });

        DispatchTicket { rx }
    }
}
