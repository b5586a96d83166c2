//! crates/course_engine_core/src/ports.rs
//!
//! Defines the service contracts (traits) the engine depends on.
//! These traits form the boundary of the hexagonal architecture, keeping the
//! engine independent of the concrete database, queue and LLM provider.

use crate::domain::{
    ContentStatus, Course, CourseStatus, LessonPosition, Memory, Outline, Step,
};
use crate::prompt::Prompt;
use crate::usage::UsageKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Generator
//=========================================================================================

/// The text-generation capability. One call per generation attempt; provider
/// selection and retries live behind this trait.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> PortResult<String>;
}

//=========================================================================================
// Course Persistence
//=========================================================================================

/// A partial update of a course document. Only the fields that are `Some`
/// are written; everything else in the stored document is left untouched.
/// Double options (`Option<Option<T>>`) distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoursePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CourseStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outline_status: Option<ContentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outline_error: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outline: Option<Outline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_position: Option<Option<LessonPosition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lessons_completed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_lessons: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CoursePatch {
    /// Snapshot of every mutable field group of `course`.
    pub fn full(course: &Course) -> Self {
        Self {
            status: Some(course.status),
            outline_status: Some(course.outline_status),
            outline_error: Some(course.outline_error.clone()),
            outline: course.outline.clone(),
            current_position: Some(course.current_position.clone()),
            steps: Some(course.steps.clone()),
            memory: Some(course.memory.clone()),
            progress: Some(course.progress),
            lessons_completed: Some(course.lessons_completed),
            total_lessons: Some(course.total_lessons),
            updated_at: Some(Utc::now()),
            last_accessed_at: course.last_accessed_at,
            completed_at: course.completed_at,
            archived_at: Some(course.archived_at),
            deleted_at: course.deleted_at,
        }
    }

    /// The patch as a JSON object holding only the named fields.
    pub fn to_fields(&self) -> PortResult<serde_json::Map<String, serde_json::Value>> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(PortError::Unexpected(
                "course patch did not serialize to an object".to_string(),
            )),
            Err(e) => Err(PortError::Unexpected(e.to_string())),
        }
    }

    /// Applies the patch to an in-memory course with the same field-path
    /// semantics the document stores use.
    pub fn apply_to(&self, course: &Course) -> PortResult<Course> {
        let mut doc =
            serde_json::to_value(course).map_err(|e| PortError::Unexpected(e.to_string()))?;
        if let serde_json::Value::Object(target) = &mut doc {
            for (field, value) in self.to_fields()? {
                target.insert(field, value);
            }
        }
        serde_json::from_value(doc).map_err(|e| PortError::Unexpected(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[async_trait]
pub trait CourseRepository: Send + Sync {
    async fn create_course(&self, course: &Course) -> PortResult<()>;

    /// Returns the stored course, including deleted ones; callers decide visibility.
    async fn get_course(&self, course_id: Uuid) -> PortResult<Course>;

    async fn update_course(&self, course_id: Uuid, patch: &CoursePatch) -> PortResult<()>;

    /// Lists a user's courses, never including deleted ones.
    async fn list_courses(&self, user_id: Uuid) -> PortResult<Vec<Course>>;

    async fn count_active_courses(&self, user_id: Uuid) -> PortResult<u32>;
}

//=========================================================================================
// Durable Task Queue
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: Uuid,
}

/// At-least-once task submission. Delivery and retry belong to the queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(&self, task_kind: &str, payload: serde_json::Value) -> PortResult<TaskHandle>;
}

//=========================================================================================
// Usage Counters
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterUpdate {
    pub admitted: bool,
    /// The counter value after the operation (unchanged when not admitted).
    pub used: u64,
}

/// Counters keyed by user, tier, metric and period bucket. `increment_if_below`
/// must check and increment in one atomic step on the store side.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn increment_if_below(
        &self,
        key: &UsageKey,
        amount: u64,
        limit: u64,
    ) -> PortResult<CounterUpdate>;

    async fn current(&self, key: &UsageKey) -> PortResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Course;

    #[test]
    fn patch_only_touches_named_fields() {
        let mut course = Course::new(Uuid::new_v4(), "Rust", "learn rust");
        course.lessons_completed = 3;
        course.outline_error = Some("boom".into());

        let patch = CoursePatch {
            progress: Some(40),
            outline_error: Some(None),
            ..Default::default()
        };
        let fields = patch.to_fields().unwrap();
        assert_eq!(fields.len(), 2);

        let updated = patch.apply_to(&course).unwrap();
        assert_eq!(updated.progress, 40);
        assert_eq!(updated.lessons_completed, 3);
        assert_eq!(updated.outline_error, None);
        assert_eq!(updated.title, "Rust");
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(CoursePatch::default().is_empty());
        let patch = CoursePatch {
            progress: Some(1),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
