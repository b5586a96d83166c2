//! crates/course_engine_core/src/progress.rs
//!
//! Progress, completion and "what's next" for both progression models.
//!
//! Legacy courses progress through a flat list of steps; newer ones through
//! the outline's lessons and blocks. Both sit behind `ProgressionStrategy` so
//! the engine never branches on the data shape itself.

use crate::domain::{
    Block, BlockResult, ContentStatus, Course, CourseStatus, LessonPosition, LessonProgress,
    ProgressStatus, Step, QUIZ_PASS_SCORE,
};
use crate::error::{EngineError, EngineResult};
use crate::generation::UnitRequest;
use crate::position;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// `min(100, floor(100 * completed / total))`, and 0 when there is nothing to complete.
pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed.saturating_mul(100)) / total).min(100) as u8
}

//=========================================================================================
// Next Unit
//=========================================================================================

/// What the learner should see next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextUnit {
    /// The unit does not exist yet and must be generated first.
    Generate {
        request: UnitRequest,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<LessonPosition>,
    },
    Step {
        step: Step,
    },
    Block {
        position: LessonPosition,
        block: Block,
    },
    Finished,
}

//=========================================================================================
// Strategies
//=========================================================================================

pub trait ProgressionStrategy: Send + Sync {
    fn total_units(&self, course: &Course) -> usize;
    fn completed_units(&self, course: &Course) -> usize;
    /// Every unit exists, is completed and meets its pass criterion.
    fn all_units_pass(&self, course: &Course) -> bool;
    fn next_unit(&self, course: &Course) -> NextUnit;
}

/// The flat step list. Total is the planned lesson count of the course.
pub struct StepProgression;

impl ProgressionStrategy for StepProgression {
    fn total_units(&self, course: &Course) -> usize {
        course.total_lessons as usize
    }

    fn completed_units(&self, course: &Course) -> usize {
        course.steps.iter().filter(|s| s.completed).count()
    }

    fn all_units_pass(&self, course: &Course) -> bool {
        !course.steps.is_empty() && course.steps.iter().all(Step::passes)
    }

    fn next_unit(&self, course: &Course) -> NextUnit {
        if let Some(step) = course.steps.iter().find(|s| !s.completed) {
            return NextUnit::Step { step: step.clone() };
        }
        // Below the pass mark at full progress, the learner keeps getting review steps.
        let total = self.total_units(course);
        if total > 0 && self.completed_units(course) >= total && self.all_units_pass(course) {
            return NextUnit::Finished;
        }
        NextUnit::Generate {
            request: UnitRequest::NextStep,
            position: None,
        }
    }
}

/// The outline tree. A unit is a lesson.
pub struct OutlineProgression;

impl OutlineProgression {
    fn lesson_passes(progress: Option<&LessonProgress>, has_questions: bool) -> bool {
        if !has_questions {
            return true;
        }
        progress.map(|p| p.score() >= QUIZ_PASS_SCORE).unwrap_or(false)
    }

    /// The cursor, or the first unfinished lesson if the cursor is missing.
    fn effective_position(course: &Course) -> Option<LessonPosition> {
        if let Some(position) = course.current_position.clone() {
            return Some(position);
        }
        let outline = course.outline.as_ref()?;
        outline.sections.iter().enumerate().find_map(|(si, section)| {
            section
                .lessons
                .iter()
                .position(|l| l.status != ProgressStatus::Completed)
                .map(|li| LessonPosition {
                    section_index: si,
                    lesson_index: li,
                    section_id: section.id.clone(),
                    lesson_id: section.lessons[li].id.clone(),
                })
        })
    }
}

impl ProgressionStrategy for OutlineProgression {
    fn total_units(&self, course: &Course) -> usize {
        course.outline.as_ref().map(|o| o.lesson_count()).unwrap_or(0)
    }

    fn completed_units(&self, course: &Course) -> usize {
        course
            .outline
            .as_ref()
            .map(|o| {
                o.lessons()
                    .filter(|(_, l)| l.status == ProgressStatus::Completed)
                    .count()
            })
            .unwrap_or(0)
    }

    fn all_units_pass(&self, course: &Course) -> bool {
        let Some(outline) = course.outline.as_ref() else {
            return false;
        };
        outline.lesson_count() > 0
            && outline.lessons().all(|(_, lesson)| {
                lesson.status == ProgressStatus::Completed
                    && Self::lesson_passes(lesson.progress.as_ref(), lesson.has_question_blocks())
            })
    }

    fn next_unit(&self, course: &Course) -> NextUnit {
        if course.outline.is_none() {
            return NextUnit::Generate {
                request: UnitRequest::Outline,
                position: None,
            };
        }
        let Some(position) = Self::effective_position(course) else {
            return NextUnit::Finished;
        };
        let Some(lesson) = course.lesson(&position.lesson_id) else {
            return NextUnit::Finished;
        };

        if lesson.blocks_status != ContentStatus::Ready || lesson.blocks.is_empty() {
            return NextUnit::Generate {
                request: UnitRequest::LessonBlocks {
                    lesson_id: lesson.id.clone(),
                },
                position: Some(position),
            };
        }

        let pending = lesson.blocks.iter().find(|b| {
            !lesson
                .progress
                .as_ref()
                .and_then(|p| p.result(&b.id))
                .map(|r| r.completed)
                .unwrap_or(false)
        });
        match pending {
            Some(block) if block.content_status == ContentStatus::Ready => NextUnit::Block {
                position,
                block: block.clone(),
            },
            Some(block) => NextUnit::Generate {
                request: UnitRequest::BlockContent {
                    lesson_id: lesson.id.clone(),
                    block_id: block.id.clone(),
                },
                position: Some(position),
            },
            None => NextUnit::Finished,
        }
    }
}

static STEPS: StepProgression = StepProgression;
static OUTLINE: OutlineProgression = OutlineProgression;

/// Courses with steps keep using them; everything else follows the outline.
pub fn strategy_for(course: &Course) -> &'static dyn ProgressionStrategy {
    if course.steps.is_empty() {
        &OUTLINE
    } else {
        &STEPS
    }
}

//=========================================================================================
// Recompute
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub progress: u8,
    pub course_complete: bool,
}

/// Recomputes progress and, when every unit passes at 100%, completes the
/// course. Completion is one-way; progress never decreases while active.
pub fn recompute(course: &mut Course) -> ProgressSnapshot {
    let strategy = strategy_for(course);
    let total = strategy.total_units(course);
    let completed = strategy.completed_units(course);
    let percent = progress_percent(completed, total);
    let course_complete = percent == 100 && strategy.all_units_pass(course);

    if course.status == CourseStatus::Active {
        course.progress = course.progress.max(percent);
    }
    course.lessons_completed = completed as u32;

    if course_complete && course.status == CourseStatus::Active {
        let now = Utc::now();
        course.status = CourseStatus::Completed;
        course.completed_at = Some(now);
        course.updated_at = now;
    }

    ProgressSnapshot {
        progress: course.progress,
        course_complete: course.status == CourseStatus::Completed,
    }
}

//=========================================================================================
// Completions
//=========================================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCompletion {
    #[serde(default)]
    pub user_answer: Option<String>,
    /// 0-100.
    #[serde(default)]
    pub score: Option<f64>,
}

/// Result of completing a step or block.
///
/// `progress`, `course_complete`, `lessons_completed` and `position` are the
/// course state after the call, so a repeat returns the same values as the
/// first completion. The remaining fields describe what this call did: a
/// repeat reports `already_completed`, no `lesson_completed` and no
/// `completed_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub progress: u8,
    pub course_complete: bool,
    pub lessons_completed: u32,
    /// The unit had already been completed before this call.
    pub already_completed: bool,
    /// This call changed the course and it needs writing back.
    pub recorded: bool,
    /// A lesson finished as part of this call.
    pub lesson_completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<LessonPosition>,
    /// Zero-based position in the completed history of the unit this call completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_index: Option<usize>,
}

impl CompletionOutcome {
    fn unchanged(course: &Course) -> Self {
        Self {
            progress: course.progress,
            course_complete: course.status == CourseStatus::Completed,
            lessons_completed: course.lessons_completed,
            already_completed: true,
            recorded: false,
            lesson_completed: false,
            position: course.current_position.clone(),
            completed_index: None,
        }
    }
}

fn require_active(course: &Course) -> EngineResult<()> {
    match course.status {
        CourseStatus::Active => Ok(()),
        status => Err(EngineError::CourseInactive { status }),
    }
}

fn clamp_score(score: Option<f64>) -> Option<f64> {
    score.map(|s| s.clamp(0.0, 100.0))
}

/// Completes a legacy step. Completing it again returns the stored state untouched.
pub fn complete_step(
    course: &mut Course,
    step_id: &str,
    completion: UnitCompletion,
) -> EngineResult<CompletionOutcome> {
    let step = course
        .find_step(step_id)
        .ok_or_else(|| EngineError::NotFound(format!("step {}", step_id)))?;
    if step.completed {
        return Ok(CompletionOutcome::unchanged(course));
    }
    require_active(course)?;

    let now = Utc::now();
    if let Some(step) = course.steps.iter_mut().find(|s| s.id == step_id) {
        step.completed = true;
        step.completed_at = Some(now);
        step.user_answer = completion.user_answer;
        step.score = clamp_score(completion.score);
    }
    course.updated_at = now;
    course.last_accessed_at = Some(now);

    let snapshot = recompute(course);
    let completed = course.steps.iter().filter(|s| s.completed).count();
    Ok(CompletionOutcome {
        progress: snapshot.progress,
        course_complete: snapshot.course_complete,
        lessons_completed: course.lessons_completed,
        already_completed: false,
        recorded: true,
        lesson_completed: false,
        position: None,
        completed_index: completed.checked_sub(1),
    })
}

/// Records a block result and, when it finishes the lesson, advances the cursor.
///
/// A result for a block that already has one replaces it (last write wins) but
/// counts as a repeat: no lesson is re-completed and nothing is re-triggered.
pub fn complete_block(
    course: &mut Course,
    lesson_id: &str,
    block_id: &str,
    completion: UnitCompletion,
) -> EngineResult<CompletionOutcome> {
    let lesson = course
        .lesson(lesson_id)
        .ok_or_else(|| EngineError::NotFound(format!("lesson {}", lesson_id)))?;
    let block = lesson
        .block(block_id)
        .ok_or_else(|| EngineError::NotFound(format!("block {} in lesson {}", block_id, lesson_id)))?;
    if lesson.status == ProgressStatus::Completed {
        return Ok(CompletionOutcome::unchanged(course));
    }
    require_active(course)?;

    let block_type = block.block_type;
    let now = Utc::now();
    let (repeat, lesson_done, passed) = {
        let Some(lesson) = course.lesson_mut(lesson_id) else {
            return Err(EngineError::NotFound(format!("lesson {}", lesson_id)));
        };
        let has_questions = lesson.has_question_blocks();
        if lesson.status == ProgressStatus::Pending {
            lesson.status = ProgressStatus::InProgress;
        }
        let progress = lesson.progress.get_or_insert_with(|| LessonProgress::started(now));
        let previous = progress.result(block_id).cloned();
        let repeat = previous.as_ref().map(|r| r.completed).unwrap_or(false);
        progress.upsert_result(BlockResult {
            block_id: block_id.to_string(),
            block_type,
            completed: true,
            completed_at: Some(now),
            user_answer: completion.user_answer,
            score: clamp_score(completion.score),
            attempts: previous.map(|r| r.attempts).unwrap_or(0) + 1,
        });
        let lesson_done = !repeat && progress.is_complete(&lesson.blocks);
        let passed = !has_questions || progress.score() >= QUIZ_PASS_SCORE;
        (repeat, lesson_done, passed)
    };

    if lesson_done && !position::advance(course, lesson_id, passed) {
        // Finished off-cursor: the lesson still counts, the cursor stays put.
        if let Some(lesson) = course.lesson_mut(lesson_id) {
            lesson.status = ProgressStatus::Completed;
            if let Some(progress) = lesson.progress.as_mut() {
                progress.passed = Some(passed);
                progress.completed_at = Some(now);
            }
        }
    }
    course.updated_at = now;
    course.last_accessed_at = Some(now);

    let snapshot = recompute(course);
    Ok(CompletionOutcome {
        progress: snapshot.progress,
        course_complete: snapshot.course_complete,
        lessons_completed: course.lessons_completed,
        already_completed: repeat,
        recorded: true,
        lesson_completed: lesson_done,
        position: course.current_position.clone(),
        completed_index: if lesson_done {
            (course.lessons_completed as usize).checked_sub(1)
        } else {
            None
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockType, Lesson, Outline, Section, StepType};
    use uuid::Uuid;

    fn step(id: &str, index: usize, step_type: StepType) -> Step {
        Step {
            id: id.into(),
            index,
            step_type,
            topic: "topic".into(),
            title: id.into(),
            content: Some("body".into()),
            question: None,
            options: vec![],
            expected_answer: None,
            task: None,
            hints: vec![],
            completed: false,
            completed_at: None,
            user_answer: None,
            score: None,
            created_at: Utc::now(),
        }
    }

    fn block(id: &str, block_type: BlockType) -> Block {
        Block {
            id: id.into(),
            block_type,
            title: id.into(),
            purpose: String::new(),
            order: 0,
            content_status: ContentStatus::Ready,
            content_error: None,
            content: None,
        }
    }

    fn outline_course(lessons: Vec<Vec<Block>>) -> Course {
        let mut course = Course::new(Uuid::new_v4(), "Rust", "goal");
        let mut outline = Outline {
            title: "Rust".into(),
            sections: vec![Section {
                id: "s1".into(),
                title: "Basics".into(),
                lessons: lessons
                    .into_iter()
                    .enumerate()
                    .map(|(i, blocks)| Lesson {
                        id: format!("l{}", i),
                        title: format!("Lesson {}", i),
                        blocks_status: if blocks.is_empty() {
                            ContentStatus::Pending
                        } else {
                            ContentStatus::Ready
                        },
                        blocks,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        course.current_position = position::initialize(&mut outline);
        course.total_lessons = outline.lesson_count() as u32;
        course.outline = Some(outline);
        course
    }

    // ----------------------------------------------------------------------
    // Formula
    // ----------------------------------------------------------------------

    #[test]
    fn progress_formula() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(5, 0), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 66);
        assert_eq!(progress_percent(3, 3), 100);
        assert_eq!(progress_percent(7, 3), 100);
        for t in 1..20 {
            for c in 0..=t + 2 {
                assert_eq!(progress_percent(c, t) as usize, (100 * c / t).min(100));
            }
        }
    }

    // ----------------------------------------------------------------------
    // Steps
    // ----------------------------------------------------------------------

    #[test]
    fn failing_quiz_blocks_completion() {
        let mut course = Course::new(Uuid::new_v4(), "Go", "goal");
        course.total_lessons = 2;
        course.steps = vec![step("a", 0, StepType::Lesson), step("q", 1, StepType::Quiz)];

        complete_step(&mut course, "a", UnitCompletion::default()).unwrap();
        let outcome = complete_step(
            &mut course,
            "q",
            UnitCompletion {
                user_answer: Some("x".into()),
                score: Some(60.0),
            },
        )
        .unwrap();

        assert_eq!(outcome.progress, 100);
        assert!(!outcome.course_complete);
        assert_eq!(course.status, CourseStatus::Active);
    }

    #[test]
    fn passing_all_units_completes_course() {
        let mut course = Course::new(Uuid::new_v4(), "Go", "goal");
        course.total_lessons = 1;
        course.steps = vec![step("q", 0, StepType::Quiz)];

        let outcome = complete_step(
            &mut course,
            "q",
            UnitCompletion {
                user_answer: None,
                score: Some(70.0),
            },
        )
        .unwrap();
        assert!(outcome.course_complete);
        assert_eq!(course.status, CourseStatus::Completed);
        assert!(course.completed_at.is_some());
        assert_eq!(outcome.completed_index, Some(0));
    }

    #[test]
    fn repeated_step_completion_is_idempotent() {
        let mut course = Course::new(Uuid::new_v4(), "Go", "goal");
        course.total_lessons = 4;
        course.steps = vec![step("a", 0, StepType::Lesson)];

        let first = complete_step(&mut course, "a", UnitCompletion::default()).unwrap();
        let stored = course.clone();
        let second = complete_step(
            &mut course,
            "a",
            UnitCompletion {
                user_answer: Some("different".into()),
                score: Some(10.0),
            },
        )
        .unwrap();

        assert!(!first.already_completed);
        assert!(second.already_completed);
        assert_eq!(second.progress, first.progress);
        assert_eq!(second.lessons_completed, first.lessons_completed);
        assert_eq!(course, stored);
    }

    #[test]
    fn zero_total_means_zero_progress() {
        let mut course = Course::new(Uuid::new_v4(), "Go", "goal");
        course.steps = vec![step("a", 0, StepType::Lesson)];
        let outcome = complete_step(&mut course, "a", UnitCompletion::default()).unwrap();
        assert_eq!(outcome.progress, 0);
        assert!(!outcome.course_complete);
    }

    #[test]
    fn step_next_unit_prefers_incomplete_step() {
        let mut course = Course::new(Uuid::new_v4(), "Go", "goal");
        course.total_lessons = 3;
        course.steps = vec![step("a", 0, StepType::Lesson)];
        assert!(matches!(strategy_for(&course).next_unit(&course), NextUnit::Step { .. }));

        complete_step(&mut course, "a", UnitCompletion::default()).unwrap();
        assert_eq!(
            strategy_for(&course).next_unit(&course),
            NextUnit::Generate {
                request: UnitRequest::NextStep,
                position: None
            }
        );
    }

    // ----------------------------------------------------------------------
    // Outline
    // ----------------------------------------------------------------------

    #[test]
    fn fresh_outline_asks_for_first_lesson_blocks() {
        let course = outline_course(vec![vec![], vec![]]);
        match strategy_for(&course).next_unit(&course) {
            NextUnit::Generate { request, position } => {
                assert_eq!(
                    request,
                    UnitRequest::LessonBlocks {
                        lesson_id: "l0".into()
                    }
                );
                let position = position.unwrap();
                assert_eq!((position.section_index, position.lesson_index), (0, 0));
            }
            other => panic!("unexpected next unit {other:?}"),
        }
    }

    #[test]
    fn last_block_advances_without_closing_section() {
        let mut course = outline_course(vec![
            vec![block("b1", BlockType::Text), block("b2", BlockType::Flashcard)],
            vec![block("c1", BlockType::Text)],
        ]);

        let first = complete_block(&mut course, "l0", "b1", UnitCompletion::default()).unwrap();
        assert!(!first.lesson_completed);
        assert_eq!(first.progress, 0);

        let second = complete_block(&mut course, "l0", "b2", UnitCompletion::default()).unwrap();
        assert!(second.lesson_completed);
        assert_eq!(second.progress, 50);
        assert_eq!(second.lessons_completed, 1);
        assert_eq!(second.completed_index, Some(0));
        let position = second.position.unwrap();
        assert_eq!((position.section_index, position.lesson_index), (0, 1));
        assert_eq!(
            course.outline.as_ref().unwrap().sections[0].status,
            ProgressStatus::InProgress
        );

        let last = complete_block(&mut course, "l1", "c1", UnitCompletion::default()).unwrap();
        assert!(last.course_complete);
        assert_eq!(
            course.outline.as_ref().unwrap().sections[0].status,
            ProgressStatus::Completed
        );
    }

    #[test]
    fn repeated_block_completion_does_not_recount() {
        let mut course = outline_course(vec![
            vec![block("b1", BlockType::Text)],
            vec![block("c1", BlockType::Text)],
        ]);
        let first = complete_block(&mut course, "l0", "b1", UnitCompletion::default()).unwrap();
        let second = complete_block(&mut course, "l0", "b1", UnitCompletion::default()).unwrap();
        assert!(second.already_completed);
        assert!(!second.lesson_completed);
        assert_eq!(second.lessons_completed, first.lessons_completed);
        assert_eq!(second.progress, first.progress);
    }

    #[test]
    fn completing_a_finished_lesson_again_reports_the_same_state() {
        let mut course = outline_course(vec![
            vec![block("b1", BlockType::Text)],
            vec![block("c1", BlockType::Text)],
        ]);
        let first = complete_block(&mut course, "l0", "b1", UnitCompletion::default()).unwrap();
        let again = complete_block(&mut course, "l0", "b1", UnitCompletion::default()).unwrap();

        assert_eq!(
            (again.progress, again.course_complete, again.lessons_completed, &again.position),
            (first.progress, first.course_complete, first.lessons_completed, &first.position)
        );
        assert!(first.recorded && first.lesson_completed);
        assert_eq!(first.completed_index, Some(0));
        assert!(again.already_completed);
        assert!(!again.recorded && !again.lesson_completed);
        assert_eq!(again.completed_index, None);
    }

    #[test]
    fn block_retry_in_open_lesson_is_last_write_wins() {
        let mut course = outline_course(vec![vec![
            block("q1", BlockType::Question),
            block("t1", BlockType::Text),
        ]]);
        complete_block(
            &mut course,
            "l0",
            "q1",
            UnitCompletion {
                user_answer: Some("a".into()),
                score: Some(0.0),
            },
        )
        .unwrap();
        let retry = complete_block(
            &mut course,
            "l0",
            "q1",
            UnitCompletion {
                user_answer: Some("b".into()),
                score: Some(100.0),
            },
        )
        .unwrap();
        assert!(retry.already_completed);

        let progress = course.lesson("l0").unwrap().progress.clone().unwrap();
        assert_eq!(progress.block_results.len(), 1);
        assert_eq!(progress.block_results[0].attempts, 2);
        assert_eq!(progress.score(), 100.0);
    }

    #[test]
    fn failing_lesson_quiz_blocks_course_completion() {
        let mut course = outline_course(vec![vec![block("q1", BlockType::Question)]]);
        let outcome = complete_block(
            &mut course,
            "l0",
            "q1",
            UnitCompletion {
                user_answer: Some("wrong".into()),
                score: Some(40.0),
            },
        )
        .unwrap();
        assert_eq!(outcome.progress, 100);
        assert!(!outcome.course_complete);
        assert_eq!(
            course.lesson("l0").unwrap().progress.as_ref().unwrap().passed,
            Some(false)
        );
    }

    #[test]
    fn archived_course_rejects_new_completions() {
        let mut course = outline_course(vec![vec![block("b1", BlockType::Text)]]);
        course.status = CourseStatus::Archived;
        let err = complete_block(&mut course, "l0", "b1", UnitCompletion::default()).unwrap_err();
        assert_eq!(err.code(), "COURSE_ARCHIVED");
    }

    #[test]
    fn completed_course_is_never_uncompleted() {
        let mut course = outline_course(vec![vec![block("b1", BlockType::Text)]]);
        complete_block(&mut course, "l0", "b1", UnitCompletion::default()).unwrap();
        assert_eq!(course.status, CourseStatus::Completed);

        // Adding lessons later lowers the ratio but not the status or stored progress.
        course.outline.as_mut().unwrap().sections[0].lessons.push(Lesson {
            id: "extra".into(),
            ..Default::default()
        });
        let snapshot = recompute(&mut course);
        assert!(snapshot.course_complete);
        assert_eq!(course.status, CourseStatus::Completed);
        assert_eq!(course.progress, 100);
    }
}
