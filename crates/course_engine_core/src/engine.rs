//! crates/course_engine_core/src/engine.rs
//!
//! The `CourseEngine` wires every component together by constructor injection
//! and exposes the operations the outer surfaces call. Each operation loads
//! the course, mutates it in memory and writes it back as one logical update.
//! Concurrent operations on the same course are not serialized: the last
//! writer of a field group wins.

use crate::cache::{PregenerationCache, DEFAULT_TTL};
use crate::dispatcher::{
    is_satisfied, DispatchCounts, DispatchTicket, GenerationWork, OrchestratorRunner,
    TaskDispatcher, WorkMode, WorkRunner, BACKGROUND_TIMEOUT,
};
use crate::domain::{ContentStatus, Course, CourseStatus, Step, Tier};
use crate::error::{EngineError, EngineResult};
use crate::generation::{ensure_generatable, GenerationOrchestrator, GenerationTimeouts, UnitRequest};
use crate::memory::{MemoryCompactor, COMPACTION_INTERVAL, COMPACTION_TIMEOUT};
use crate::parser::{Unit, MAX_TEXT_LEN};
use crate::ports::{CoursePatch, CourseRepository, Generator, TaskQueue, UsageStore};
use crate::progress::{self, CompletionOutcome, NextUnit, UnitCompletion};
use crate::usage::{UsageDecision, UsageLimiter, UsageWindow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

//=========================================================================================
// Configuration and Wiring
//=========================================================================================

/// Engine tunables. `Default` matches the production constants.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub timeouts: GenerationTimeouts,
    pub background_timeout: Duration,
    pub compaction_interval: usize,
    pub compaction_timeout: Duration,
    /// Ask the generator for compaction summaries instead of deriving them.
    pub summarize_with_generator: bool,
    /// Cap on learner-supplied free text.
    pub max_text_len: usize,
    /// How many blocks ahead of the learner to pregenerate content for.
    pub pregeneration_depth: usize,
    pub cache_ttl: Duration,
    /// Tokens charged against the token windows for each generation.
    pub tokens_per_generation: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: GenerationTimeouts::default(),
            background_timeout: BACKGROUND_TIMEOUT,
            compaction_interval: COMPACTION_INTERVAL,
            compaction_timeout: COMPACTION_TIMEOUT,
            summarize_with_generator: true,
            max_text_len: MAX_TEXT_LEN,
            pregeneration_depth: 3,
            cache_ttl: DEFAULT_TTL,
            tokens_per_generation: 2_000,
        }
    }
}

/// The external capabilities the engine depends on.
#[derive(Clone)]
pub struct EnginePorts {
    pub repo: Arc<dyn CourseRepository>,
    pub generator: Arc<dyn Generator>,
    pub usage: Arc<dyn UsageStore>,
    /// `None` sends all background work down the detached path.
    pub queue: Option<Arc<dyn TaskQueue>>,
}

/// Who is calling. Tier comes from the caller's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Learner {
    pub user_id: Uuid,
    pub tier: Tier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub tier: Tier,
    pub windows: Vec<UsageDecision>,
    pub active_courses: UsageDecision,
}

pub struct CourseEngine {
    repo: Arc<dyn CourseRepository>,
    orchestrator: Arc<GenerationOrchestrator>,
    runner: Arc<dyn WorkRunner>,
    dispatcher: TaskDispatcher,
    compactor: MemoryCompactor,
    limiter: UsageLimiter,
    config: EngineConfig,
}

impl CourseEngine {
    pub fn new(ports: EnginePorts, config: EngineConfig) -> Self {
        let cache = PregenerationCache::new(config.cache_ttl);
        let orchestrator = Arc::new(GenerationOrchestrator::new(
            ports.generator.clone(),
            ports.repo.clone(),
            cache,
            config.timeouts,
        ));
        let runner: Arc<dyn WorkRunner> =
            Arc::new(OrchestratorRunner::new(ports.repo.clone(), orchestrator.clone()));
        let dispatcher =
            TaskDispatcher::new(ports.queue, runner.clone(), config.background_timeout);
        let compactor = MemoryCompactor::new(
            config.summarize_with_generator.then(|| ports.generator.clone()),
            config.compaction_interval,
            config.compaction_timeout,
        );

        Self {
            repo: ports.repo,
            orchestrator,
            runner,
            dispatcher,
            compactor,
            limiter: UsageLimiter::new(ports.usage),
            config,
        }
    }

    /// The runner durable-queue workers execute tasks with.
    pub fn work_runner(&self) -> Arc<dyn WorkRunner> {
        self.runner.clone()
    }

    pub fn cache(&self) -> &PregenerationCache {
        self.orchestrator.cache()
    }

    pub fn dispatch_stats(&self) -> DispatchCounts {
        self.dispatcher.stats()
    }

    //=====================================================================================
    // Internal Helpers
    //=====================================================================================

    /// Loads a course visible to `learner`. Deleted and foreign courses are not found.
    async fn load(&self, learner: &Learner, course_id: Uuid) -> EngineResult<Course> {
        let course = self.repo.get_course(course_id).await?;
        if course.user_id != learner.user_id || course.status == CourseStatus::Deleted {
            return Err(EngineError::NotFound(format!("course {}", course_id)));
        }
        Ok(course)
    }

    fn cap_text(&self, text: Option<String>) -> Option<String> {
        text.map(|t| match t.char_indices().nth(self.config.max_text_len) {
            Some((byte_idx, _)) => t[..byte_idx].to_string(),
            None => t,
        })
    }

    /// Charges one generation against every window, stopping at the first denial.
    async fn admit_generation(&self, learner: &Learner) -> EngineResult<()> {
        let charges = [
            (UsageWindow::DailyGenerations, 1),
            (UsageWindow::DailyTokens, self.config.tokens_per_generation),
            (UsageWindow::WeeklyTokens, self.config.tokens_per_generation),
        ];
        for (window, amount) in charges {
            let decision = self
                .limiter
                .reserve(learner.user_id, learner.tier, window, amount)
                .await?;
            if !decision.allowed {
                return Err(EngineError::LimitExceeded(decision));
            }
        }
        Ok(())
    }

    async fn ensure_course_capacity(&self, learner: &Learner) -> EngineResult<()> {
        let active = self.repo.count_active_courses(learner.user_id).await?;
        let decision = UsageLimiter::check_active_courses(learner.tier, active);
        if decision.allowed {
            Ok(())
        } else {
            info!(user_id = %learner.user_id, active, limit = decision.limit, "Active course limit reached");
            Err(EngineError::LimitExceeded(decision))
        }
    }

    /// The stored unit for a request that is already satisfied.
    fn existing_unit(course: &Course, request: &UnitRequest) -> Option<Unit> {
        if !is_satisfied(course, request) {
            return None;
        }
        match request {
            UnitRequest::Outline => course.outline.clone().map(Unit::Outline),
            UnitRequest::NextStep => course
                .steps
                .iter()
                .find(|s| !s.completed)
                .cloned()
                .map(Unit::Step),
            UnitRequest::LessonBlocks { lesson_id } => course
                .lesson(lesson_id)
                .map(|l| Unit::LessonBlocks(l.blocks.clone())),
            UnitRequest::BlockContent {
                lesson_id,
                block_id,
            } => course
                .lesson(lesson_id)
                .and_then(|l| l.block(block_id))
                .and_then(|b| b.content.clone())
                .map(Unit::BlockContent),
        }
    }

    async fn speculate(&self, course_id: Uuid, request: UnitRequest) {
        let ticket = self
            .dispatcher
            .dispatch(GenerationWork {
                course_id,
                request,
                mode: WorkMode::Speculative,
            })
            .await;
        debug!(course_id = %course_id, state = ?ticket.state(), "Pregeneration dispatched");
    }

    /// Content for the next blocks of `lesson_id` the learner has not finished.
    async fn pregenerate_blocks_ahead(&self, course: &Course, lesson_id: &str) {
        let Some(lesson) = course.lesson(lesson_id) else {
            return;
        };
        let pending = lesson
            .blocks
            .iter()
            .filter(|b| {
                !lesson
                    .progress
                    .as_ref()
                    .and_then(|p| p.result(&b.id))
                    .map(|r| r.completed)
                    .unwrap_or(false)
            })
            .filter(|b| b.content_status != ContentStatus::Ready)
            .take(self.config.pregeneration_depth);
        for block in pending {
            self.speculate(
                course.id,
                UnitRequest::BlockContent {
                    lesson_id: lesson.id.clone(),
                    block_id: block.id.clone(),
                },
            )
            .await;
        }
    }

    /// The field groups a completion touches.
    fn progress_patch(course: &Course) -> CoursePatch {
        CoursePatch {
            status: Some(course.status),
            outline: course.outline.clone(),
            current_position: course
                .outline
                .as_ref()
                .map(|_| course.current_position.clone()),
            steps: (!course.steps.is_empty()).then(|| course.steps.clone()),
            memory: Some(course.memory.clone()),
            progress: Some(course.progress),
            lessons_completed: Some(course.lessons_completed),
            updated_at: Some(course.updated_at),
            last_accessed_at: course.last_accessed_at,
            completed_at: course.completed_at,
            ..Default::default()
        }
    }

    //=====================================================================================
    // Course Lifecycle
    //=====================================================================================

    /// Creates a course and hands outline generation to the background.
    pub async fn create_course(
        &self,
        learner: &Learner,
        title: &str,
        goal: &str,
    ) -> EngineResult<(Course, DispatchTicket)> {
        let title = title.trim();
        if title.is_empty() {
            return Err(EngineError::Validation("title must not be empty".to_string()));
        }
        self.ensure_course_capacity(learner).await?;
        self.admit_generation(learner).await?;

        let goal = self.cap_text(Some(goal.trim().to_string())).unwrap_or_default();
        let course = Course::new(learner.user_id, title, goal);
        self.repo.create_course(&course).await?;
        info!(course_id = %course.id, user_id = %learner.user_id, "Course created");

        let ticket = self
            .dispatcher
            .dispatch(GenerationWork {
                course_id: course.id,
                request: UnitRequest::Outline,
                mode: WorkMode::Persist,
            })
            .await;
        Ok((course, ticket))
    }

    /// Returns a course and stamps its last access.
    pub async fn get_course(&self, learner: &Learner, course_id: Uuid) -> EngineResult<Course> {
        let mut course = self.load(learner, course_id).await?;
        let now = Utc::now();
        course.last_accessed_at = Some(now);
        self.repo
            .update_course(
                course_id,
                &CoursePatch {
                    last_accessed_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(course)
    }

    pub async fn list_courses(&self, learner: &Learner) -> EngineResult<Vec<Course>> {
        Ok(self.repo.list_courses(learner.user_id).await?)
    }

    pub async fn archive_course(&self, learner: &Learner, course_id: Uuid) -> EngineResult<Course> {
        let mut course = self.load(learner, course_id).await?;
        if course.status == CourseStatus::Archived {
            return Ok(course);
        }
        if !course.status.can_transition_to(CourseStatus::Archived) {
            return Err(EngineError::Validation(format!(
                "a {} course cannot be archived",
                course.status
            )));
        }
        let now = Utc::now();
        course.status = CourseStatus::Archived;
        course.archived_at = Some(now);
        course.updated_at = now;
        self.repo
            .update_course(
                course_id,
                &CoursePatch {
                    status: Some(course.status),
                    archived_at: Some(course.archived_at),
                    updated_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        info!(course_id = %course_id, "Course archived");
        Ok(course)
    }

    /// Restores an archived course to active, or to completed if it had been finished.
    pub async fn unarchive_course(&self, learner: &Learner, course_id: Uuid) -> EngineResult<Course> {
        let mut course = self.load(learner, course_id).await?;
        match course.status {
            CourseStatus::Archived => {}
            CourseStatus::Active => return Ok(course),
            status => {
                return Err(EngineError::Validation(format!(
                    "a {} course cannot be unarchived",
                    status
                )))
            }
        }
        let target = if course.completed_at.is_some() {
            CourseStatus::Completed
        } else {
            self.ensure_course_capacity(learner).await?;
            CourseStatus::Active
        };

        let now = Utc::now();
        course.status = target;
        course.archived_at = None;
        course.updated_at = now;
        self.repo
            .update_course(
                course_id,
                &CoursePatch {
                    status: Some(target),
                    archived_at: Some(None),
                    updated_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        info!(course_id = %course_id, status = %target, "Course unarchived");
        Ok(course)
    }

    /// Soft-deletes a course. Deleting it again is a no-op.
    pub async fn delete_course(&self, learner: &Learner, course_id: Uuid) -> EngineResult<()> {
        let course = self.repo.get_course(course_id).await?;
        if course.user_id != learner.user_id {
            return Err(EngineError::NotFound(format!("course {}", course_id)));
        }
        if course.status == CourseStatus::Deleted {
            return Ok(());
        }
        let now = Utc::now();
        self.repo
            .update_course(
                course_id,
                &CoursePatch {
                    status: Some(CourseStatus::Deleted),
                    deleted_at: Some(now),
                    updated_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        info!(course_id = %course_id, "Course deleted");
        Ok(())
    }

    //=====================================================================================
    // Generation
    //=====================================================================================

    /// What the learner should do next. Never generates anything itself.
    pub async fn next_unit(&self, learner: &Learner, course_id: Uuid) -> EngineResult<NextUnit> {
        let course = self.load(learner, course_id).await?;
        Ok(progress::strategy_for(&course).next_unit(&course))
    }

    /// Generates a unit, or returns it if it already exists.
    pub async fn generate_unit(
        &self,
        learner: &Learner,
        course_id: Uuid,
        request: &UnitRequest,
    ) -> EngineResult<Unit> {
        let mut course = self.load(learner, course_id).await?;
        ensure_generatable(&course)?;
        if let Some(unit) = Self::existing_unit(&course, request) {
            debug!(course_id = %course_id, unit = %request.unit_key(), "Unit already exists");
            return Ok(unit);
        }

        self.admit_generation(learner).await?;
        let unit = self.orchestrator.generate(&mut course, request).await?;

        if let UnitRequest::LessonBlocks { lesson_id } = request {
            self.pregenerate_blocks_ahead(&course, lesson_id).await;
        }
        Ok(unit)
    }

    /// Legacy flow: the current unfinished step, generating one if needed.
    pub async fn next_step(&self, learner: &Learner, course_id: Uuid) -> EngineResult<Step> {
        match self
            .generate_unit(learner, course_id, &UnitRequest::NextStep)
            .await?
        {
            Unit::Step(step) => Ok(step),
            other => Err(EngineError::Validation(format!(
                "expected a step, generated {:?}",
                other
            ))),
        }
    }

    //=====================================================================================
    // Progress
    //=====================================================================================

    pub async fn complete_step(
        &self,
        learner: &Learner,
        course_id: Uuid,
        step_id: &str,
        completion: UnitCompletion,
    ) -> EngineResult<CompletionOutcome> {
        let mut course = self.load(learner, course_id).await?;
        let completion = UnitCompletion {
            user_answer: self.cap_text(completion.user_answer),
            score: completion.score,
        };
        let outcome = progress::complete_step(&mut course, step_id, completion)?;
        if !outcome.recorded {
            debug!(course_id = %course_id, step_id, "Step already completed");
            return Ok(outcome);
        }

        if let Some(index) = outcome.completed_index {
            self.compactor.maybe_compact(&mut course, index).await;
        }
        self.repo
            .update_course(course_id, &Self::progress_patch(&course))
            .await?;
        info!(course_id = %course_id, step_id, progress = outcome.progress, "Step completed");

        if !outcome.course_complete {
            self.speculate(course_id, UnitRequest::NextStep).await;
        }
        Ok(outcome)
    }

    pub async fn complete_block(
        &self,
        learner: &Learner,
        course_id: Uuid,
        lesson_id: &str,
        block_id: &str,
        completion: UnitCompletion,
    ) -> EngineResult<CompletionOutcome> {
        let mut course = self.load(learner, course_id).await?;
        let completion = UnitCompletion {
            user_answer: self.cap_text(completion.user_answer),
            score: completion.score,
        };
        let outcome = progress::complete_block(&mut course, lesson_id, block_id, completion)?;
        if !outcome.recorded {
            debug!(course_id = %course_id, lesson_id, "Lesson already completed");
            return Ok(outcome);
        }

        if outcome.lesson_completed {
            if let Some(index) = outcome.completed_index {
                self.compactor.maybe_compact(&mut course, index).await;
            }
        }
        self.repo
            .update_course(course_id, &Self::progress_patch(&course))
            .await?;
        info!(
            course_id = %course_id,
            lesson_id,
            block_id,
            lesson_completed = outcome.lesson_completed,
            progress = outcome.progress,
            "Block completed"
        );

        if outcome.already_completed || outcome.course_complete {
            return Ok(outcome);
        }
        if outcome.lesson_completed {
            if let Some(position) = outcome.position.as_ref() {
                self.speculate(
                    course_id,
                    UnitRequest::LessonBlocks {
                        lesson_id: position.lesson_id.clone(),
                    },
                )
                .await;
            }
        } else {
            self.pregenerate_blocks_ahead(&course, lesson_id).await;
        }
        Ok(outcome)
    }

    /// Records that the learner looked at a step again. Allowed on archived
    /// and completed courses.
    pub async fn view_step(&self, learner: &Learner, course_id: Uuid, step_id: &str) -> EngineResult<Step> {
        let mut course = self.load(learner, course_id).await?;
        let step = course
            .find_step(step_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("step {}", step_id)))?;

        let now = Utc::now();
        course
            .memory
            .topics
            .entry(step.topic.clone())
            .or_default()
            .last_reviewed = Some(now);
        self.repo
            .update_course(
                course_id,
                &CoursePatch {
                    memory: Some(course.memory),
                    last_accessed_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;
        Ok(step)
    }

    //=====================================================================================
    // Usage
    //=====================================================================================

    pub async fn usage_status(&self, learner: &Learner) -> EngineResult<UsageReport> {
        let mut windows = Vec::with_capacity(3);
        for window in [
            UsageWindow::DailyGenerations,
            UsageWindow::DailyTokens,
            UsageWindow::WeeklyTokens,
        ] {
            windows.push(self.limiter.peek(learner.user_id, learner.tier, window).await?);
        }
        let active = self.repo.count_active_courses(learner.user_id).await?;
        Ok(UsageReport {
            tier: learner.tier,
            windows,
            active_courses: UsageLimiter::check_active_courses(learner.tier, active),
        })
    }
}
