//! crates/course_engine_core/src/domain.rs
//!
//! Defines the core data structures of the course engine: the `Course`
//! aggregate, the outline tree (sections, lessons, blocks), the legacy flat
//! step list, learner memory and the status enums that govern their lifecycles.
//!
//! Everything here serializes to the JSON document layout the persistence
//! adapters store, so field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Minimum score (0-100) a quiz-type unit needs to count as passed.
pub const QUIZ_PASS_SCORE: f64 = 70.0;

//=========================================================================================
// Status Enums
//=========================================================================================

/// Lifecycle status of a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CourseStatus {
    #[default]
    Active,
    Completed,
    Archived,
    Deleted,
}

impl CourseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Transitions are one-directional except archiving and restoring.
    /// `deleted` is terminal.
    pub fn can_transition_to(&self, next: CourseStatus) -> bool {
        use CourseStatus::*;
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Active, Completed) | (Active, Archived) | (Archived, Active) => true,
            // A completed course can be archived and restored to completed.
            (Completed, Archived) | (Archived, Completed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for CourseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CourseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown course status '{}'", other)),
        }
    }
}

/// Generation status shared by the outline, a lesson's block set and a block's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    #[default]
    Pending,
    Generating,
    Ready,
    Error,
}

impl ContentStatus {
    /// Valid transitions are `pending -> generating -> {ready | error}` and
    /// `error -> generating`. Anything else is a data-integrity warning.
    pub fn is_valid_transition(from: ContentStatus, to: ContentStatus) -> bool {
        use ContentStatus::*;
        matches!(
            (from, to),
            (Pending, Generating) | (Generating, Ready) | (Generating, Error) | (Error, Generating)
        )
    }
}

impl std::fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Generating => "generating",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Progress status of a section or lesson.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

//=========================================================================================
// Course Aggregate
//=========================================================================================

/// The root aggregate. Owns the outline tree, the legacy step list and the learner memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    /// What the learner said they want to achieve.
    pub goal: String,
    pub status: CourseStatus,
    #[serde(default)]
    pub outline_status: ContentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outline: Option<Outline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_position: Option<LessonPosition>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub memory: Memory,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub lessons_completed: u32,
    #[serde(default)]
    pub total_lessons: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Course {
    /// A fresh, active course with nothing generated yet.
    pub fn new(user_id: Uuid, title: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            goal: goal.into(),
            status: CourseStatus::Active,
            outline_status: ContentStatus::Pending,
            outline_error: None,
            outline: None,
            current_position: None,
            steps: Vec::new(),
            memory: Memory::default(),
            progress: 0,
            lessons_completed: 0,
            total_lessons: 0,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            completed_at: None,
            archived_at: None,
            deleted_at: None,
        }
    }

    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Locates a lesson anywhere in the outline, returning its indices.
    pub fn locate_lesson(&self, lesson_id: &str) -> Option<(usize, usize)> {
        let outline = self.outline.as_ref()?;
        outline.sections.iter().enumerate().find_map(|(si, section)| {
            section
                .lessons
                .iter()
                .position(|l| l.id == lesson_id)
                .map(|li| (si, li))
        })
    }

    pub fn lesson(&self, lesson_id: &str) -> Option<&Lesson> {
        let (si, li) = self.locate_lesson(lesson_id)?;
        self.outline.as_ref().map(|o| &o.sections[si].lessons[li])
    }

    pub fn lesson_mut(&mut self, lesson_id: &str) -> Option<&mut Lesson> {
        let (si, li) = self.locate_lesson(lesson_id)?;
        self.outline.as_mut().map(|o| &mut o.sections[si].lessons[li])
    }

    /// Whether this course progresses through the outline tree rather than
    /// the legacy flat step list.
    pub fn uses_outline(&self) -> bool {
        self.outline
            .as_ref()
            .map(|o| o.lesson_count() > 0)
            .unwrap_or(false)
            && self.steps.is_empty()
    }
}

//=========================================================================================
// Outline Tree
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Outline {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default)]
    pub estimated_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub learning_outcomes: Vec<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl Outline {
    pub fn lesson_count(&self) -> usize {
        self.sections.iter().map(|s| s.lessons.len()).sum()
    }

    pub fn lessons(&self) -> impl Iterator<Item = (&Section, &Lesson)> {
        self.sections
            .iter()
            .flat_map(|s| s.lessons.iter().map(move |l| (s, l)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimated_minutes: u32,
    #[serde(default)]
    pub learning_outcomes: Vec<String>,
    #[serde(default)]
    pub status: ProgressStatus,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub estimated_minutes: u32,
    #[serde(default)]
    pub status: ProgressStatus,
    #[serde(default)]
    pub blocks_status: ContentStatus,
    /// Present iff `blocks_status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks_error: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<LessonProgress>,
}

impl Lesson {
    pub fn block(&self, block_id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == block_id)
    }

    pub fn block_mut(&mut self, block_id: &str) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.id == block_id)
    }

    pub fn has_question_blocks(&self) -> bool {
        self.blocks.iter().any(|b| b.block_type == BlockType::Question)
    }
}

//=========================================================================================
// Blocks and Block Content
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Text,
    Code,
    Question,
    Task,
    Flashcard,
    Summary,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Code => "code",
            Self::Question => "question",
            Self::Task => "task",
            Self::Flashcard => "flashcard",
            Self::Summary => "summary",
        }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "code" => Ok(Self::Code),
            "question" => Ok(Self::Question),
            "task" => Ok(Self::Task),
            "flashcard" => Ok(Self::Flashcard),
            "summary" => Ok(Self::Summary),
            other => Err(format!("unknown block type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub content_status: ContentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<BlockContent>,
}

/// The payload of a block. Exactly one variant exists per `BlockType`, and the
/// JSON form keys the payload by that type name (`{"code": {...}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockContent {
    Text(TextContent),
    Code(CodeContent),
    Question(QuestionContent),
    Task(TaskContent),
    Flashcard(FlashcardContent),
    Summary(SummaryContent),
}

impl BlockContent {
    pub fn block_type(&self) -> BlockType {
        match self {
            Self::Text(_) => BlockType::Text,
            Self::Code(_) => BlockType::Code,
            Self::Question(_) => BlockType::Question,
            Self::Task(_) => BlockType::Task,
            Self::Flashcard(_) => BlockType::Flashcard,
            Self::Summary(_) => BlockType::Summary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TextContent {
    pub markdown: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CodeContent {
    pub language: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub runnable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuestionContent {
    pub id: String,
    pub text: String,
    /// multiple_choice, true_false, fill_blank, short_answer or code.
    #[serde(rename = "type", default)]
    pub question_type: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    pub correct_answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default)]
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuestionOption {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskContent {
    pub instruction: String,
    #[serde(default)]
    pub hints: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlashcardContent {
    pub front: String,
    pub back: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SummaryContent {
    pub key_points: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_up: Option<String>,
}

//=========================================================================================
// Lesson Progress
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonProgress {
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_block_index: usize,
    #[serde(default)]
    pub block_results: Vec<BlockResult>,
    /// Whether the lesson met its pass criterion when it completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passed: Option<bool>,
}

impl LessonProgress {
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            started_at: now,
            completed_at: None,
            current_block_index: 0,
            block_results: Vec::new(),
            passed: None,
        }
    }

    pub fn result(&self, block_id: &str) -> Option<&BlockResult> {
        self.block_results.iter().find(|r| r.block_id == block_id)
    }

    /// Stores a block result, replacing any earlier one for the same block.
    pub fn upsert_result(&mut self, result: BlockResult) {
        match self
            .block_results
            .iter_mut()
            .find(|r| r.block_id == result.block_id)
        {
            Some(existing) => *existing = result,
            None => self.block_results.push(result),
        }
        self.current_block_index = self.block_results.len();
    }

    /// Mean over question results and any result with a positive score.
    /// A lesson with nothing scored counts as 100.
    pub fn score(&self) -> f64 {
        let scored: Vec<f64> = self
            .block_results
            .iter()
            .filter(|r| r.block_type == BlockType::Question || r.score.unwrap_or(0.0) > 0.0)
            .map(|r| r.score.unwrap_or(0.0))
            .collect();
        if scored.is_empty() {
            return 100.0;
        }
        scored.iter().sum::<f64>() / scored.len() as f64
    }

    /// True once every block in the lesson has a completed result.
    pub fn is_complete(&self, blocks: &[Block]) -> bool {
        !blocks.is_empty()
            && blocks.iter().all(|b| {
                self.result(&b.id)
                    .map(|r| r.completed)
                    .unwrap_or(false)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockResult {
    pub block_id: String,
    pub block_type: BlockType,
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub attempts: u32,
}

//=========================================================================================
// Position Cursor
//=========================================================================================

/// The "what to show next" cursor into the outline. The id pair is kept in
/// step with the index pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LessonPosition {
    pub section_index: usize,
    pub lesson_index: usize,
    pub section_id: String,
    pub lesson_id: String,
}

//=========================================================================================
// Legacy Steps
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    #[default]
    Lesson,
    Quiz,
    Exercise,
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lesson" => Ok(Self::Lesson),
            "quiz" => Ok(Self::Quiz),
            "exercise" => Ok(Self::Exercise),
            other => Err(format!("unknown step type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    /// Append-only position in the course; never renumbered.
    pub index: usize,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub topic: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    /// Quizzes must score at least the pass mark; everything else only needs completing.
    pub fn passes(&self) -> bool {
        match self.step_type {
            StepType::Quiz => self.completed && self.score.unwrap_or(0.0) >= QUIZ_PASS_SCORE,
            _ => self.completed,
        }
    }
}

//=========================================================================================
// Learner Memory
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    #[serde(default)]
    pub topics: BTreeMap<String, TopicMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<Compaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TopicMemory {
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_tested: u32,
}

/// Marks the boundary of history already folded into the topic map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Compaction {
    pub last_step_index: usize,
    pub summary: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    pub compacted_at: DateTime<Utc>,
}

//=========================================================================================
// Tiers
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}
