//! crates/course_engine_core/src/position.rs
//!
//! The single "current lesson" cursor of the outline model.

use crate::domain::{Course, LessonPosition, Outline, ProgressStatus};
use chrono::Utc;

fn position_at(outline: &Outline, section_index: usize, lesson_index: usize) -> LessonPosition {
    let section = &outline.sections[section_index];
    LessonPosition {
        section_index,
        lesson_index,
        section_id: section.id.clone(),
        lesson_id: section.lessons[lesson_index].id.clone(),
    }
}

/// Marks the section and lesson at the given indices in progress.
fn enter(outline: &mut Outline, section_index: usize, lesson_index: usize) -> LessonPosition {
    let section = &mut outline.sections[section_index];
    if section.status == ProgressStatus::Pending {
        section.status = ProgressStatus::InProgress;
    }
    let lesson = &mut section.lessons[lesson_index];
    if lesson.status == ProgressStatus::Pending {
        lesson.status = ProgressStatus::InProgress;
    }
    position_at(outline, section_index, lesson_index)
}

/// Points the cursor at the first lesson of the first non-empty section and
/// marks both in progress. Returns `None` for an outline without lessons.
pub fn initialize(outline: &mut Outline) -> Option<LessonPosition> {
    let section_index = outline.sections.iter().position(|s| !s.lessons.is_empty())?;
    Some(enter(outline, section_index, 0))
}

/// Moves the cursor past `completed_lesson_id`.
///
/// Returns `false` without touching anything when the lesson is not the one
/// under the cursor, so replayed completions are harmless. The finished
/// section is marked completed only once its last lesson completes. When no
/// lesson remains the cursor is cleared.
pub fn advance(course: &mut Course, completed_lesson_id: &str, passed: bool) -> bool {
    let Some(cursor) = course.current_position.clone() else {
        return false;
    };
    if cursor.lesson_id != completed_lesson_id {
        return false;
    }
    let Some(outline) = course.outline.as_mut() else {
        return false;
    };
    let (si, li) = (cursor.section_index, cursor.lesson_index);
    let in_bounds = outline
        .sections
        .get(si)
        .and_then(|s| s.lessons.get(li))
        .map(|l| l.id == cursor.lesson_id)
        .unwrap_or(false);
    if !in_bounds {
        return false;
    }

    {
        let lesson = &mut outline.sections[si].lessons[li];
        lesson.status = ProgressStatus::Completed;
        if let Some(progress) = lesson.progress.as_mut() {
            progress.passed = Some(passed);
            progress.completed_at.get_or_insert_with(Utc::now);
        }
    }

    let next = if li + 1 < outline.sections[si].lessons.len() {
        Some((si, li + 1))
    } else {
        outline.sections[si].status = ProgressStatus::Completed;
        outline.sections[si + 1..]
            .iter()
            .position(|s| !s.lessons.is_empty())
            .map(|offset| (si + 1 + offset, 0))
    };

    course.current_position = next.map(|(nsi, nli)| enter(outline, nsi, nli));
    true
}
