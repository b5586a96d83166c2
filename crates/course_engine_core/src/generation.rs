//! crates/course_engine_core/src/generation.rs
//!
//! The generation orchestrator: produces one unit (outline, next step, a
//! lesson's block set or one block's content) for a course.
//!
//! A pregenerated unit in the cache is used first. Otherwise the generator is
//! called exactly once under a per-kind timeout and its output parsed. The
//! result is written back as a single field-group update, and a failure is
//! recorded on the unit's own status so the rest of the course is unaffected.
//! Dropping the returned future (e.g. on client disconnect) abandons the
//! generator call.

use crate::cache::{CacheKey, PregenerationCache};
use crate::domain::{ContentStatus, Course, CourseStatus, ProgressStatus};
use crate::error::{EngineError, EngineResult, GenerationError};
use crate::parser::{self, ParseError, Unit, UnitKind};
use crate::position;
use crate::ports::{CoursePatch, CourseRepository, Generator};
use crate::prompt::{self, Prompt};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

//=========================================================================================
// Unit Requests
//=========================================================================================

/// Names the unit to generate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum UnitRequest {
    Outline,
    NextStep,
    LessonBlocks { lesson_id: String },
    BlockContent { lesson_id: String, block_id: String },
}

impl UnitRequest {
    /// The per-course identity of this unit, used for cache and de-duplication keys.
    pub fn unit_key(&self) -> String {
        match self {
            Self::Outline => "outline".to_string(),
            Self::NextStep => "next_step".to_string(),
            Self::LessonBlocks { lesson_id } => format!("blocks:{}", lesson_id),
            Self::BlockContent {
                lesson_id,
                block_id,
            } => format!("content:{}:{}", lesson_id, block_id),
        }
    }

    /// Task kind name used on the durable queue.
    pub fn task_kind(&self) -> &'static str {
        match self {
            Self::Outline => "outline",
            Self::NextStep => "step",
            Self::LessonBlocks { .. } => "block_skeleton",
            Self::BlockContent { .. } => "block_content",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationTimeouts {
    pub outline: Duration,
    pub step: Duration,
    pub blocks: Duration,
    pub block_content: Duration,
}

impl Default for GenerationTimeouts {
    fn default() -> Self {
        Self {
            outline: Duration::from_secs(120),
            step: Duration::from_secs(60),
            blocks: Duration::from_secs(60),
            block_content: Duration::from_secs(60),
        }
    }
}

impl GenerationTimeouts {
    pub fn for_request(&self, request: &UnitRequest) -> Duration {
        match request {
            UnitRequest::Outline => self.outline,
            UnitRequest::NextStep => self.step,
            UnitRequest::LessonBlocks { .. } => self.blocks,
            UnitRequest::BlockContent { .. } => self.block_content,
        }
    }
}

/// Rejects generation for any course that is not active.
pub fn ensure_generatable(course: &Course) -> EngineResult<()> {
    match course.status {
        CourseStatus::Active => Ok(()),
        status => Err(EngineError::CourseInactive { status }),
    }
}

/// Logs a status change and whether it followed the allowed lifecycle.
/// Invalid transitions are reported, never blocked.
fn log_transition(course_id: Uuid, unit: &str, old: ContentStatus, new: ContentStatus) {
    let valid = ContentStatus::is_valid_transition(old, new);
    if valid {
        info!(course_id = %course_id, unit, old_status = %old, new_status = %new, valid_transition = valid, "Unit status changed");
    } else {
        warn!(course_id = %course_id, unit, old_status = %old, new_status = %new, valid_transition = valid, "Unexpected unit status transition");
    }
}

//=========================================================================================
// Orchestrator
//=========================================================================================

pub struct GenerationOrchestrator {
    generator: Arc<dyn Generator>,
    repo: Arc<dyn CourseRepository>,
    cache: PregenerationCache,
    timeouts: GenerationTimeouts,
}

/// What the request resolves to inside the course.
struct Target {
    kind: UnitKind,
    prompt: Prompt,
}

impl GenerationOrchestrator {
    pub fn new(
        generator: Arc<dyn Generator>,
        repo: Arc<dyn CourseRepository>,
        cache: PregenerationCache,
        timeouts: GenerationTimeouts,
    ) -> Self {
        Self {
            generator,
            repo,
            cache,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &GenerationTimeouts {
        &self.timeouts
    }

    pub fn cache(&self) -> &PregenerationCache {
        &self.cache
    }

    fn resolve(&self, course: &Course, request: &UnitRequest) -> EngineResult<Target> {
        match request {
            UnitRequest::Outline => Ok(Target {
                kind: UnitKind::Outline,
                prompt: prompt::outline_prompt(course),
            }),
            UnitRequest::NextStep => Ok(Target {
                kind: UnitKind::Step,
                prompt: prompt::step_prompt(course),
            }),
            UnitRequest::LessonBlocks { lesson_id } => {
                let (si, li) = course.locate_lesson(lesson_id).ok_or_else(|| {
                    EngineError::Validation(format!("unknown lesson '{}'", lesson_id))
                })?;
                let outline = course
                    .outline
                    .as_ref()
                    .ok_or_else(|| EngineError::Validation("course has no outline".to_string()))?;
                let section = &outline.sections[si];
                Ok(Target {
                    kind: UnitKind::LessonBlocks,
                    prompt: prompt::lesson_blocks_prompt(course, section, &section.lessons[li]),
                })
            }
            UnitRequest::BlockContent {
                lesson_id,
                block_id,
            } => {
                let (si, li) = course.locate_lesson(lesson_id).ok_or_else(|| {
                    EngineError::Validation(format!("unknown lesson '{}'", lesson_id))
                })?;
                let outline = course
                    .outline
                    .as_ref()
                    .ok_or_else(|| EngineError::Validation("course has no outline".to_string()))?;
                let section = &outline.sections[si];
                let lesson = &section.lessons[li];
                let block = lesson.block(block_id).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "unknown block '{}' in lesson '{}'",
                        block_id, lesson_id
                    ))
                })?;
                Ok(Target {
                    kind: UnitKind::BlockContent(block.block_type),
                    prompt: prompt::block_content_prompt(course, section, lesson, block),
                })
            }
        }
    }

    fn current_status(course: &Course, request: &UnitRequest) -> Option<ContentStatus> {
        match request {
            UnitRequest::Outline => Some(course.outline_status),
            UnitRequest::NextStep => None,
            UnitRequest::LessonBlocks { lesson_id } => {
                course.lesson(lesson_id).map(|l| l.blocks_status)
            }
            UnitRequest::BlockContent {
                lesson_id,
                block_id,
            } => course
                .lesson(lesson_id)
                .and_then(|l| l.block(block_id))
                .map(|b| b.content_status),
        }
    }

    /// Sets the unit's status (and error message) in memory, logging the change.
    fn set_status(
        course: &mut Course,
        request: &UnitRequest,
        status: ContentStatus,
        message: Option<String>,
    ) {
        let course_id = course.id;
        let unit = request.unit_key();
        match request {
            UnitRequest::Outline => {
                log_transition(course_id, &unit, course.outline_status, status);
                course.outline_status = status;
                course.outline_error = message;
            }
            UnitRequest::NextStep => {}
            UnitRequest::LessonBlocks { lesson_id } => {
                if let Some(lesson) = course.lesson_mut(lesson_id) {
                    log_transition(course_id, &unit, lesson.blocks_status, status);
                    lesson.blocks_status = status;
                    lesson.blocks_error = message;
                }
            }
            UnitRequest::BlockContent {
                lesson_id,
                block_id,
            } => {
                if let Some(block) = course
                    .lesson_mut(lesson_id)
                    .and_then(|l| l.block_mut(block_id))
                {
                    log_transition(course_id, &unit, block.content_status, status);
                    block.content_status = status;
                    block.content_error = message;
                }
            }
        }
    }

    /// The field group a request writes.
    fn patch_for(course: &Course, request: &UnitRequest) -> CoursePatch {
        let mut patch = CoursePatch {
            updated_at: Some(Utc::now()),
            ..Default::default()
        };
        match request {
            UnitRequest::Outline => {
                patch.outline_status = Some(course.outline_status);
                patch.outline_error = Some(course.outline_error.clone());
                if course.outline.is_some() {
                    patch.outline = course.outline.clone();
                    patch.total_lessons = Some(course.total_lessons);
                    patch.current_position = Some(course.current_position.clone());
                }
            }
            UnitRequest::NextStep => patch.steps = Some(course.steps.clone()),
            UnitRequest::LessonBlocks { .. } | UnitRequest::BlockContent { .. } => {
                patch.outline = course.outline.clone();
            }
        }
        patch
    }

    /// Writes a parsed unit into the course and marks it ready.
    fn apply(course: &mut Course, request: &UnitRequest, unit: Unit) -> EngineResult<()> {
        match (request, unit) {
            (UnitRequest::Outline, Unit::Outline(mut outline)) => {
                course.total_lessons = outline.lesson_count() as u32;
                course.current_position = position::initialize(&mut outline);
                course.outline = Some(outline);
                Self::set_status(course, request, ContentStatus::Ready, None);
            }
            (UnitRequest::NextStep, Unit::Step(mut step)) => {
                step.index = course.steps.iter().map(|s| s.index + 1).max().unwrap_or(0);
                while course.steps.iter().any(|s| s.id == step.id) {
                    step.id = Uuid::new_v4().to_string();
                }
                course.steps.push(step);
            }
            (UnitRequest::LessonBlocks { lesson_id }, Unit::LessonBlocks(blocks)) => {
                let lesson = course.lesson_mut(lesson_id).ok_or_else(|| {
                    EngineError::Validation(format!("unknown lesson '{}'", lesson_id))
                })?;
                lesson.blocks = blocks;
                if lesson.status == ProgressStatus::Pending {
                    lesson.status = ProgressStatus::InProgress;
                }
                Self::set_status(course, request, ContentStatus::Ready, None);
            }
            (
                UnitRequest::BlockContent {
                    lesson_id,
                    block_id,
                },
                Unit::BlockContent(content),
            ) => {
                let block = course
                    .lesson_mut(lesson_id)
                    .and_then(|l| l.block_mut(block_id))
                    .ok_or_else(|| {
                        EngineError::Validation(format!("unknown block '{}'", block_id))
                    })?;
                if content.block_type() != block.block_type {
                    return Err(GenerationError::from(ParseError::MalformedResponse {
                        reason: format!(
                            "{} content for a {} block",
                            content.block_type(),
                            block.block_type
                        ),
                        raw: String::new(),
                    })
                    .into());
                }
                block.content = Some(content);
                Self::set_status(course, request, ContentStatus::Ready, None);
            }
            (request, _) => {
                return Err(EngineError::Validation(format!(
                    "generated unit does not match request '{}'",
                    request.unit_key()
                )))
            }
        }
        course.updated_at = Utc::now();
        Ok(())
    }

    /// Calls the generator once under the kind's timeout and parses the output.
    async fn produce(
        &self,
        course_id: Uuid,
        request: &UnitRequest,
        target: &Target,
    ) -> Result<Unit, GenerationError> {
        let timeout = self.timeouts.for_request(request);
        let started = Instant::now();
        debug!(course_id = %course_id, unit = %request.unit_key(), "Calling generator");

        let raw = match tokio::time::timeout(timeout, self.generator.complete(&target.prompt)).await {
            Err(_) => {
                return Err(GenerationError::timeout(format!(
                    "{} took longer than {}s",
                    request.unit_key(),
                    timeout.as_secs()
                )))
            }
            Ok(Err(e)) => return Err(GenerationError::upstream(e.to_string())),
            Ok(Ok(raw)) => raw,
        };

        let unit = parser::parse(&raw, target.kind)?;
        info!(
            course_id = %course_id,
            unit = %request.unit_key(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generated unit"
        );
        Ok(unit)
    }

    /// Generates `request` for `course`, mutating it in place and persisting
    /// the touched field group.
    pub async fn generate(&self, course: &mut Course, request: &UnitRequest) -> EngineResult<Unit> {
        ensure_generatable(course)?;
        let target = self.resolve(course, request)?;

        // 1. Pregenerated unit, if any.
        let key = CacheKey::new(course.id, &request.unit_key());
        if let Some(unit) = self.cache.take(&key) {
            info!(course_id = %course.id, unit = %request.unit_key(), "Using pregenerated unit");
            let snapshot = course.clone();
            if Self::current_status(course, request).is_some() {
                Self::set_status(course, request, ContentStatus::Generating, None);
            }
            match Self::apply(course, request, unit.clone()) {
                Ok(()) => {
                    self.repo
                        .update_course(course.id, &Self::patch_for(course, request))
                        .await?;
                    return Ok(unit);
                }
                Err(e) => {
                    warn!(course_id = %course.id, error = %e, "Discarding unusable pregenerated unit");
                    *course = snapshot;
                }
            }
        }

        // 2. Mark the unit as generating so concurrent readers can see it.
        if Self::current_status(course, request).is_some() {
            Self::set_status(course, request, ContentStatus::Generating, None);
            self.repo
                .update_course(course.id, &Self::patch_for(course, request))
                .await?;
        }

        // 3. One generator call, then parse and apply.
        let outcome = match self.produce(course.id, request, &target).await {
            Ok(unit) => Self::apply(course, request, unit.clone()).map(|_| unit),
            Err(e) => Err(EngineError::Generation(e)),
        };

        match outcome {
            Ok(unit) => {
                self.repo
                    .update_course(course.id, &Self::patch_for(course, request))
                    .await?;
                Ok(unit)
            }
            Err(e) => {
                error!(course_id = %course.id, unit = %request.unit_key(), error = %e, "Unit generation failed");
                if Self::current_status(course, request).is_some() {
                    Self::set_status(course, request, ContentStatus::Error, Some(e.to_string()));
                    if let Err(persist) = self
                        .repo
                        .update_course(course.id, &Self::patch_for(course, request))
                        .await
                    {
                        error!(course_id = %course.id, error = %persist, "Failed to record generation error");
                    }
                }
                Err(e)
            }
        }
    }

    /// Marks a unit that was cut off mid-generation as failed, so it does not
    /// stay `generating` with nobody left to finish it. Reloads the course;
    /// units in any other status are left alone.
    pub async fn mark_abandoned(
        &self,
        course_id: Uuid,
        request: &UnitRequest,
        reason: &str,
    ) -> EngineResult<()> {
        let mut course = self.repo.get_course(course_id).await?;
        if Self::current_status(&course, request) != Some(ContentStatus::Generating) {
            return Ok(());
        }
        Self::set_status(&mut course, request, ContentStatus::Error, Some(reason.to_string()));
        self.repo
            .update_course(course_id, &Self::patch_for(&course, request))
            .await?;
        Ok(())
    }

    /// Generates `request` ahead of time into the cache without touching the course.
    pub async fn pregenerate(&self, course: &Course, request: &UnitRequest) -> EngineResult<()> {
        ensure_generatable(course)?;
        let key = CacheKey::new(course.id, &request.unit_key());
        if self.cache.contains(&key) {
            debug!(course_id = %course.id, unit = %request.unit_key(), "Unit already pregenerated");
            return Ok(());
        }
        let target = self.resolve(course, request)?;
        let unit = self.produce(course.id, request, &target).await?;
        self.cache.put(key, unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Block, BlockType, Lesson, Outline, Section};
    use crate::in_memory::InMemoryCourseRepository;
    use crate::ports::{PortError, PortResult};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses in order and counts calls.
    struct ScriptedGenerator {
        responses: Mutex<VecDeque<PortResult<String>>>,
        calls: Mutex<usize>,
        delay: Option<Duration>,
    }

    impl ScriptedGenerator {
        fn new(responses: Vec<PortResult<String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
                delay: None,
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn complete(&self, _prompt: &Prompt) -> PortResult<String> {
            *self.calls.lock().unwrap() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(PortError::Unexpected("script exhausted".into())))
        }
    }

    fn course_with_lesson() -> Course {
        let mut course = Course::new(Uuid::new_v4(), "Rust", "learn rust");
        let mut outline = Outline {
            title: "Rust".into(),
            sections: vec![Section {
                id: "s1".into(),
                title: "Basics".into(),
                lessons: vec![Lesson {
                    id: "l1".into(),
                    title: "Hello".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        course.current_position = position::initialize(&mut outline);
        course.outline = Some(outline);
        course.total_lessons = 1;
        course
    }

    async fn setup(
        generator: ScriptedGenerator,
        course: &Course,
    ) -> (GenerationOrchestrator, Arc<ScriptedGenerator>, Arc<InMemoryCourseRepository>) {
        let generator = Arc::new(generator);
        let repo = Arc::new(InMemoryCourseRepository::new());
        repo.create_course(course).await.unwrap();
        let orchestrator = GenerationOrchestrator::new(
            generator.clone(),
            repo.clone(),
            PregenerationCache::default(),
            GenerationTimeouts::default(),
        );
        (orchestrator, generator, repo)
    }

    const BLOCKS: &str = r#"{"lessonId": "l1", "blocks": [
        {"id": "b1", "type": "text", "title": "Intro", "order": 1},
        {"id": "b2", "type": "question", "title": "Check", "order": 2}]}"#;

    #[tokio::test]
    async fn generates_and_persists_lesson_blocks() {
        let mut course = course_with_lesson();
        let (orchestrator, generator, repo) =
            setup(ScriptedGenerator::new(vec![Ok(BLOCKS.into())]), &course).await;
        let request = UnitRequest::LessonBlocks {
            lesson_id: "l1".into(),
        };

        orchestrator.generate(&mut course, &request).await.unwrap();

        assert_eq!(generator.calls(), 1);
        let stored = repo.get_course(course.id).await.unwrap();
        let lesson = stored.lesson("l1").unwrap();
        assert_eq!(lesson.blocks_status, ContentStatus::Ready);
        assert_eq!(lesson.blocks.len(), 2);
        assert!(lesson.blocks_error.is_none());
    }

    #[tokio::test]
    async fn parse_failure_marks_unit_error_without_retry() {
        let mut course = course_with_lesson();
        let (orchestrator, generator, repo) =
            setup(ScriptedGenerator::new(vec![Ok("not json".into())]), &course).await;
        let request = UnitRequest::LessonBlocks {
            lesson_id: "l1".into(),
        };

        let err = orchestrator.generate(&mut course, &request).await.unwrap_err();
        match err {
            EngineError::Generation(e) => assert_eq!(e.cause, crate::error::GenerationCause::Parse),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(generator.calls(), 1);

        let stored = repo.get_course(course.id).await.unwrap();
        let lesson = stored.lesson("l1").unwrap();
        assert_eq!(lesson.blocks_status, ContentStatus::Error);
        assert!(lesson.blocks_error.is_some());
        assert_eq!(stored.status, CourseStatus::Active);
    }

    #[tokio::test]
    async fn errored_unit_can_be_regenerated() {
        let mut course = course_with_lesson();
        let (orchestrator, _, repo) = setup(
            ScriptedGenerator::new(vec![
                Err(PortError::Unavailable("rate limited".into())),
                Ok(BLOCKS.into()),
            ]),
            &course,
        )
        .await;
        let request = UnitRequest::LessonBlocks {
            lesson_id: "l1".into(),
        };

        assert!(orchestrator.generate(&mut course, &request).await.is_err());
        orchestrator.generate(&mut course, &request).await.unwrap();
        let stored = repo.get_course(course.id).await.unwrap();
        assert_eq!(stored.lesson("l1").unwrap().blocks_status, ContentStatus::Ready);
        assert!(stored.lesson("l1").unwrap().blocks_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_generator_times_out() {
        let mut course = course_with_lesson();
        let mut generator = ScriptedGenerator::new(vec![Ok(BLOCKS.into())]);
        generator.delay = Some(Duration::from_secs(61));
        let (orchestrator, _, _) = setup(generator, &course).await;

        let err = orchestrator
            .generate(
                &mut course,
                &UnitRequest::LessonBlocks {
                    lesson_id: "l1".into(),
                },
            )
            .await
            .unwrap_err();
        match err {
            EngineError::Generation(e) => {
                assert_eq!(e.cause, crate::error::GenerationCause::Timeout)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandoned_unit_is_marked_error() {
        let mut course = course_with_lesson();
        course.outline.as_mut().unwrap().sections[0].lessons[0].blocks_status =
            ContentStatus::Generating;
        let (orchestrator, _, repo) = setup(ScriptedGenerator::new(vec![]), &course).await;
        let request = UnitRequest::LessonBlocks {
            lesson_id: "l1".into(),
        };

        orchestrator
            .mark_abandoned(course.id, &request, "background generation timed out")
            .await
            .unwrap();

        let stored = repo.get_course(course.id).await.unwrap();
        let lesson = stored.lesson("l1").unwrap();
        assert_eq!(lesson.blocks_status, ContentStatus::Error);
        assert_eq!(
            lesson.blocks_error.as_deref(),
            Some("background generation timed out")
        );

        // A unit that already settled is not touched.
        let ready = UnitRequest::Outline;
        orchestrator.mark_abandoned(course.id, &ready, "late").await.unwrap();
        let stored = repo.get_course(course.id).await.unwrap();
        assert_eq!(stored.outline_error, None);
    }

    #[tokio::test]
    async fn cache_hit_skips_generator() {
        let mut course = course_with_lesson();
        course.outline.as_mut().unwrap().sections[0].lessons[0].blocks = vec![Block {
            id: "b1".into(),
            block_type: BlockType::Flashcard,
            title: "Card".into(),
            purpose: String::new(),
            order: 1,
            content_status: ContentStatus::Pending,
            content_error: None,
            content: None,
        }];
        let (orchestrator, generator, repo) = setup(
            ScriptedGenerator::new(vec![Ok(r#"{"front": "f", "back": "b"}"#.into())]),
            &course,
        )
        .await;
        let request = UnitRequest::BlockContent {
            lesson_id: "l1".into(),
            block_id: "b1".into(),
        };

        orchestrator.pregenerate(&course, &request).await.unwrap();
        assert_eq!(orchestrator.cache().size(), 1);

        orchestrator.generate(&mut course, &request).await.unwrap();
        assert_eq!(generator.calls(), 1);
        assert_eq!(orchestrator.cache().size(), 0);
        let stored = repo.get_course(course.id).await.unwrap();
        let block = stored.lesson("l1").unwrap().block("b1").unwrap().clone();
        assert_eq!(block.content_status, ContentStatus::Ready);
        assert!(block.content.is_some());
    }

    #[tokio::test]
    async fn next_step_appends_with_next_index() {
        let mut course = Course::new(Uuid::new_v4(), "Go", "learn go");
        let step = r#"{"type": "lesson", "topic": "slices", "title": "Slices", "content": "..."}"#;
        let (orchestrator, _, repo) =
            setup(ScriptedGenerator::new(vec![Ok(step.into()), Ok(step.into())]), &course).await;

        orchestrator.generate(&mut course, &UnitRequest::NextStep).await.unwrap();
        orchestrator.generate(&mut course, &UnitRequest::NextStep).await.unwrap();

        let stored = repo.get_course(course.id).await.unwrap();
        let indices: Vec<usize> = stored.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_ne!(stored.steps[0].id, stored.steps[1].id);
    }

    #[tokio::test]
    async fn archived_course_rejects_generation() {
        let mut course = course_with_lesson();
        course.status = CourseStatus::Archived;
        let (orchestrator, generator, _) = setup(ScriptedGenerator::new(vec![]), &course).await;

        let err = orchestrator
            .generate(&mut course, &UnitRequest::NextStep)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "course archived");
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_lesson_is_a_validation_error() {
        let mut course = course_with_lesson();
        let (orchestrator, _, _) = setup(ScriptedGenerator::new(vec![]), &course).await;
        let err = orchestrator
            .generate(
                &mut course,
                &UnitRequest::LessonBlocks {
                    lesson_id: "missing".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn outline_initializes_position() {
        let mut course = Course::new(Uuid::new_v4(), "Rust", "learn rust");
        let outline = r#"{"title": "Rust", "sections": [
            {"id": "s1", "title": "Basics", "lessons": [{"id": "l1", "title": "Hello"}, {"id": "l2", "title": "Vars"}]}]}"#;
        let (orchestrator, _, repo) =
            setup(ScriptedGenerator::new(vec![Ok(outline.into())]), &course).await;

        orchestrator.generate(&mut course, &UnitRequest::Outline).await.unwrap();

        let stored = repo.get_course(course.id).await.unwrap();
        assert_eq!(stored.outline_status, ContentStatus::Ready);
        assert_eq!(stored.total_lessons, 2);
        assert_eq!(stored.current_position.unwrap().lesson_id, "l1");
    }
}
