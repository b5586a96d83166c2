//! crates/course_engine_core/src/parser.rs
//!
//! Turns raw generator output into typed units. Pure: no I/O, no logging.
//!
//! The generator is asked for a single JSON object but frequently wraps it in
//! a Markdown fence or surrounds it with prose, so extraction is lenient while
//! the shape checks are strict. Missing ids are filled with fresh UUIDs and
//! oversized free text is cut to `MAX_TEXT_LEN` characters.

use crate::domain::{
    Block, BlockContent, BlockType, CodeContent, ContentStatus, FlashcardContent, Lesson, Outline,
    ProgressStatus, QuestionContent, QuestionOption, Section, Step, StepType, SummaryContent,
    TaskContent, TextContent,
};
use chrono::Utc;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// Hard cap on any free-text field, in characters.
pub const MAX_TEXT_LEN: usize = 10_000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String, raw: String },
}

impl ParseError {
    fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            Self::MalformedResponse { raw, .. } => raw,
        }
    }
}

/// What the raw text is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Outline,
    Step,
    LessonBlocks,
    BlockContent(BlockType),
}

/// A parsed, normalized unit ready to be applied to a course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "unit", rename_all = "snake_case")]
pub enum Unit {
    Outline(Outline),
    /// Index is assigned when the step is appended to a course.
    Step(Step),
    LessonBlocks(Vec<Block>),
    BlockContent(BlockContent),
}

pub fn parse(raw: &str, kind: UnitKind) -> Result<Unit, ParseError> {
    match kind {
        UnitKind::Outline => parse_outline(raw).map(Unit::Outline),
        UnitKind::Step => parse_step(raw).map(Unit::Step),
        UnitKind::LessonBlocks => parse_lesson_blocks(raw).map(Unit::LessonBlocks),
        UnitKind::BlockContent(block_type) => {
            parse_block_content(raw, block_type).map(Unit::BlockContent)
        }
    }
}

//=========================================================================================
// JSON Extraction and Normalization Helpers
//=========================================================================================

/// A fence that wraps the entire response. The body is greedy so fences
/// quoted inside JSON strings stay part of it.
fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)\A```(?:json|JSON)?[ \t]*\n?(.*)```\z").expect("fence pattern is valid")
    })
}

/// Strips a Markdown fence around the whole response, then narrows to the
/// outermost object so surrounding prose is ignored.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let unfenced = fence_regex()
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);
    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, ParseError> {
    serde_json::from_str(extract_json(raw))
        .map_err(|e| ParseError::malformed(format!("invalid JSON: {}", e), raw))
}

/// Truncates on a character boundary.
pub fn truncate(text: String) -> String {
    match text.char_indices().nth(MAX_TEXT_LEN) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text,
    }
}

fn truncate_opt(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty()).map(truncate)
}

fn required(field: Option<String>, name: &str, raw: &str) -> Result<String, ParseError> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(truncate(value)),
        _ => Err(ParseError::malformed(format!("missing required field '{}'", name), raw)),
    }
}

fn id_or_fresh(id: Option<String>) -> String {
    match id {
        Some(id) if !id.trim().is_empty() => id,
        _ => Uuid::new_v4().to_string(),
    }
}

//=========================================================================================
// Outline
//=========================================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOutline {
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    emoji: Option<String>,
    #[serde(default)]
    estimated_minutes: Option<u32>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    prerequisites: Vec<String>,
    #[serde(default)]
    learning_outcomes: Vec<String>,
    #[serde(default)]
    sections: Vec<RawSection>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSection {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    estimated_minutes: Option<u32>,
    #[serde(default)]
    learning_outcomes: Vec<String>,
    #[serde(default)]
    lessons: Vec<RawLesson>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLesson {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    estimated_minutes: Option<u32>,
}

fn parse_outline(raw: &str) -> Result<Outline, ParseError> {
    let parsed: RawOutline = decode(raw)?;
    let title = required(parsed.title, "title", raw)?;
    if parsed.sections.is_empty() {
        return Err(ParseError::malformed("outline has no sections", raw));
    }

    let mut sections = Vec::with_capacity(parsed.sections.len());
    for section in parsed.sections {
        let section_title = required(section.title, "sections[].title", raw)?;
        if section.lessons.is_empty() {
            return Err(ParseError::malformed(
                format!("section '{}' has no lessons", section_title),
                raw,
            ));
        }
        let mut lessons = Vec::with_capacity(section.lessons.len());
        for lesson in section.lessons {
            lessons.push(Lesson {
                id: id_or_fresh(lesson.id),
                title: required(lesson.title, "lessons[].title", raw)?,
                description: truncate(lesson.description.unwrap_or_default()),
                estimated_minutes: lesson.estimated_minutes.unwrap_or_default(),
                status: ProgressStatus::Pending,
                blocks_status: ContentStatus::Pending,
                blocks_error: None,
                blocks: Vec::new(),
                progress: None,
            });
        }
        sections.push(Section {
            id: id_or_fresh(section.id),
            title: section_title,
            description: truncate(section.description.unwrap_or_default()),
            estimated_minutes: section.estimated_minutes.unwrap_or_default(),
            learning_outcomes: section.learning_outcomes,
            status: ProgressStatus::Pending,
            lessons,
        });
    }

    Ok(Outline {
        title,
        description: truncate(parsed.description.unwrap_or_default()),
        emoji: parsed.emoji.filter(|e| !e.is_empty()),
        estimated_minutes: parsed.estimated_minutes.unwrap_or_default(),
        difficulty: parsed.difficulty.filter(|d| !d.is_empty()),
        prerequisites: parsed.prerequisites,
        learning_outcomes: parsed.learning_outcomes,
        sections,
    })
}

//=========================================================================================
// Step
//=========================================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(rename = "type")]
    step_type: Option<String>,
    topic: Option<String>,
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    expected_answer: Option<String>,
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    hints: Vec<String>,
}

fn parse_step(raw: &str) -> Result<Step, ParseError> {
    let parsed: RawStep = decode(raw)?;
    let step_type: StepType = parsed
        .step_type
        .as_deref()
        .ok_or_else(|| ParseError::malformed("missing required field 'type'", raw))?
        .parse()
        .map_err(|e: String| ParseError::malformed(e, raw))?;
    let title = required(parsed.title, "title", raw)?;
    let topic = parsed
        .topic
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| title.clone());

    let mut step = Step {
        id: Uuid::new_v4().to_string(),
        index: 0,
        step_type,
        topic,
        title,
        content: truncate_opt(parsed.content),
        question: truncate_opt(parsed.question),
        options: parsed.options,
        expected_answer: truncate_opt(parsed.expected_answer),
        task: truncate_opt(parsed.task),
        hints: parsed.hints,
        completed: false,
        completed_at: None,
        user_answer: None,
        score: None,
        created_at: Utc::now(),
    };

    let missing = match step.step_type {
        StepType::Lesson if step.content.is_none() => Some("content"),
        StepType::Quiz if step.question.is_none() => Some("question"),
        StepType::Exercise if step.task.is_none() => Some("task"),
        _ => None,
    };
    if let Some(field) = missing {
        return Err(ParseError::malformed(
            format!("missing required field '{}'", field),
            raw,
        ));
    }
    if step.step_type != StepType::Quiz {
        step.options.clear();
    }
    Ok(step)
}

//=========================================================================================
// Lesson Blocks (skeleton)
//=========================================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlockSet {
    #[serde(default)]
    blocks: Vec<RawBlock>,
}

#[derive(Deserialize)]
struct RawBlock {
    id: Option<String>,
    #[serde(rename = "type")]
    block_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
    #[serde(default)]
    order: Option<u32>,
}

fn parse_lesson_blocks(raw: &str) -> Result<Vec<Block>, ParseError> {
    let parsed: RawBlockSet = decode(raw)?;
    if parsed.blocks.is_empty() {
        return Err(ParseError::malformed("lesson has no blocks", raw));
    }

    let mut blocks = Vec::with_capacity(parsed.blocks.len());
    for (position, block) in parsed.blocks.into_iter().enumerate() {
        let block_type: BlockType = block
            .block_type
            .as_deref()
            .ok_or_else(|| ParseError::malformed("missing required field 'blocks[].type'", raw))?
            .parse()
            .map_err(|e: String| ParseError::malformed(e, raw))?;
        blocks.push(Block {
            id: id_or_fresh(block.id),
            block_type,
            title: truncate(block.title.unwrap_or_default()),
            purpose: truncate(block.purpose.unwrap_or_default()),
            order: block.order.unwrap_or(position as u32 + 1),
            content_status: ContentStatus::Pending,
            content_error: None,
            content: None,
        });
    }
    blocks.sort_by_key(|b| b.order);
    Ok(blocks)
}

//=========================================================================================
// Block Content
//=========================================================================================

#[derive(Deserialize)]
struct RawText {
    text: Option<String>,
}

#[derive(Deserialize)]
struct RawCode {
    language: Option<String>,
    code: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    runnable: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawQuestion {
    id: Option<String>,
    text: Option<String>,
    #[serde(rename = "type", default)]
    question_type: Option<String>,
    #[serde(default)]
    options: Vec<QuestionOption>,
    correct_answer: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    hints: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTask {
    instruction: Option<String>,
    #[serde(default)]
    hints: Vec<String>,
    #[serde(default)]
    success_criteria: Vec<String>,
    #[serde(default)]
    solution: Option<String>,
}

#[derive(Deserialize)]
struct RawFlashcard {
    front: Option<String>,
    back: Option<String>,
    #[serde(default)]
    hint: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSummary {
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    next_up: Option<String>,
}

fn parse_block_content(raw: &str, block_type: BlockType) -> Result<BlockContent, ParseError> {
    let content = match block_type {
        BlockType::Text => {
            let parsed: RawText = decode(raw)?;
            BlockContent::Text(TextContent {
                markdown: required(parsed.text, "text", raw)?,
            })
        }
        BlockType::Code => {
            let parsed: RawCode = decode(raw)?;
            BlockContent::Code(CodeContent {
                language: parsed.language.unwrap_or_else(|| "text".to_string()),
                code: required(parsed.code, "code", raw)?,
                explanation: truncate_opt(parsed.explanation),
                runnable: parsed.runnable,
            })
        }
        BlockType::Question => {
            let parsed: RawQuestion = decode(raw)?;
            BlockContent::Question(QuestionContent {
                id: id_or_fresh(parsed.id),
                text: required(parsed.text, "text", raw)?,
                question_type: parsed
                    .question_type
                    .unwrap_or_else(|| "short_answer".to_string()),
                options: parsed.options,
                correct_answer: required(parsed.correct_answer, "correctAnswer", raw)?,
                explanation: truncate_opt(parsed.explanation),
                hints: parsed.hints,
            })
        }
        BlockType::Task => {
            let parsed: RawTask = decode(raw)?;
            BlockContent::Task(TaskContent {
                instruction: required(parsed.instruction, "instruction", raw)?,
                hints: parsed.hints,
                success_criteria: parsed.success_criteria,
                solution: truncate_opt(parsed.solution),
            })
        }
        BlockType::Flashcard => {
            let parsed: RawFlashcard = decode(raw)?;
            BlockContent::Flashcard(FlashcardContent {
                front: required(parsed.front, "front", raw)?,
                back: required(parsed.back, "back", raw)?,
                hint: truncate_opt(parsed.hint),
            })
        }
        BlockType::Summary => {
            let parsed: RawSummary = decode(raw)?;
            if parsed.key_points.is_empty() {
                return Err(ParseError::malformed("missing required field 'keyPoints'", raw));
            }
            BlockContent::Summary(SummaryContent {
                key_points: parsed.key_points.into_iter().map(truncate).collect(),
                next_up: truncate_opt(parsed.next_up),
            })
        }
    };
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fence() {
        let raw = "Here you go:\n```json\n{\"text\": \"hello\"}\n```\nEnjoy!";
        assert_eq!(extract_json(raw), "{\"text\": \"hello\"}");
        let unit = parse(raw, UnitKind::BlockContent(BlockType::Text)).unwrap();
        assert_eq!(
            unit,
            Unit::BlockContent(BlockContent::Text(TextContent {
                markdown: "hello".into()
            }))
        );
    }

    #[test]
    fn code_fences_inside_strings_survive() {
        let raw = r#"{"language":"rust","code":"```rust\nfn main() {}\n```"}"#;
        let unit = parse(raw, UnitKind::BlockContent(BlockType::Code)).unwrap();
        let Unit::BlockContent(BlockContent::Code(code)) = unit else {
            panic!("expected code content");
        };
        assert_eq!(code.code, "```rust\nfn main() {}\n```");

        let fenced = "```json\n{\"text\": \"Try this:\\n```rust\\nlet x = 1;\\n```\"}\n```";
        let unit = parse(fenced, UnitKind::BlockContent(BlockType::Text)).unwrap();
        assert_eq!(
            unit,
            Unit::BlockContent(BlockContent::Text(TextContent {
                markdown: "Try this:\n```rust\nlet x = 1;\n```".into()
            }))
        );
    }

    #[test]
    fn bare_fence_without_language_tag() {
        assert_eq!(extract_json("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json("  {\"a\": 1}  "), "{\"a\": 1}");
    }

    #[test]
    fn outline_assigns_missing_ids() {
        let raw = r#"{
            "title": "Rust Basics",
            "sections": [
                {"title": "Ownership", "lessons": [{"title": "Moves"}, {"id": "l2", "title": "Borrows"}]}
            ]
        }"#;
        let Unit::Outline(outline) = parse(raw, UnitKind::Outline).unwrap() else {
            panic!("expected an outline");
        };
        let section = &outline.sections[0];
        assert!(Uuid::parse_str(&section.id).is_ok());
        assert!(Uuid::parse_str(&section.lessons[0].id).is_ok());
        assert_eq!(section.lessons[1].id, "l2");
        assert_eq!(section.lessons[0].blocks_status, ContentStatus::Pending);
    }

    #[test]
    fn outline_without_sections_is_malformed() {
        let raw = r#"{"title": "Empty", "sections": []}"#;
        let err = parse(raw, UnitKind::Outline).unwrap_err();
        assert_eq!(err.raw(), raw);
    }

    #[test]
    fn non_json_keeps_raw_text() {
        let raw = "I'm sorry, I can't help with that.";
        let err = parse(raw, UnitKind::Step).unwrap_err();
        match err {
            ParseError::MalformedResponse { raw: kept, reason } => {
                assert_eq!(kept, raw);
                assert!(reason.starts_with("invalid JSON"));
            }
        }
    }

    #[test]
    fn quiz_step_requires_question() {
        let raw = r#"{"type": "quiz", "topic": "traits", "title": "Quiz time"}"#;
        assert!(parse(raw, UnitKind::Step).is_err());

        let raw = r#"{"type": "quiz", "topic": "traits", "title": "Quiz time",
                      "question": "What is a trait?", "options": ["a", "b"], "expectedAnswer": "a"}"#;
        let Unit::Step(step) = parse(raw, UnitKind::Step).unwrap() else {
            panic!("expected a step");
        };
        assert_eq!(step.step_type, StepType::Quiz);
        assert_eq!(step.options.len(), 2);
        assert!(!step.completed);
    }

    #[test]
    fn oversized_text_is_truncated_silently() {
        let long = "é".repeat(MAX_TEXT_LEN + 50);
        let raw = serde_json::json!({
            "type": "lesson", "topic": "t", "title": "Long", "content": long
        })
        .to_string();
        let Unit::Step(step) = parse(&raw, UnitKind::Step).unwrap() else {
            panic!("expected a step");
        };
        assert_eq!(step.content.unwrap().chars().count(), MAX_TEXT_LEN);
    }

    #[test]
    fn blocks_are_ordered_and_typed() {
        let raw = r#"{"lessonId": "l1", "blocks": [
            {"type": "question", "title": "Check", "order": 2},
            {"id": "b1", "type": "text", "title": "Intro", "order": 1}
        ]}"#;
        let Unit::LessonBlocks(blocks) = parse(raw, UnitKind::LessonBlocks).unwrap() else {
            panic!("expected blocks");
        };
        assert_eq!(blocks[0].id, "b1");
        assert_eq!(blocks[1].block_type, BlockType::Question);
        assert!(blocks.iter().all(|b| b.content_status == ContentStatus::Pending));
    }

    #[test]
    fn unknown_block_type_is_rejected() {
        let raw = r#"{"blocks": [{"type": "video", "title": "Watch"}]}"#;
        assert!(parse(raw, UnitKind::LessonBlocks).is_err());
    }

    #[test]
    fn question_content_needs_correct_answer() {
        let raw = r#"{"text": "2 + 2?", "type": "short_answer"}"#;
        assert!(parse(raw, UnitKind::BlockContent(BlockType::Question)).is_err());
    }
}
