//! crates/course_engine_core/src/prompt.rs
//!
//! Builds the prompts sent to the `Generator` for each unit kind. Every
//! prompt asks for a single JSON object whose shape the parser understands.

use crate::domain::{Block, BlockType, Course, Lesson, Section};
use crate::memory;

/// A two-part chat prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

const OUTLINE_SYSTEM: &str = "You design personalized courses. Respond with ONLY a JSON object: \
{\"title\": string, \"description\": string, \"emoji\": string, \"estimatedMinutes\": number, \
\"difficulty\": string, \"prerequisites\": [string], \"learningOutcomes\": [string], \
\"sections\": [{\"id\": string, \"title\": string, \"description\": string, \
\"estimatedMinutes\": number, \"learningOutcomes\": [string], \"lessons\": [{\"id\": string, \
\"title\": string, \"description\": string, \"estimatedMinutes\": number}]}]}";

const STEP_SYSTEM: &str = "You are an adaptive tutor producing the learner's next step. Respond \
with ONLY a JSON object: {\"type\": \"lesson\" | \"quiz\" | \"exercise\", \"topic\": string, \
\"title\": string, \"content\": string, \"question\": string, \"options\": [string], \
\"expectedAnswer\": string, \"task\": string, \"hints\": [string]}. Lessons fill content, quizzes \
fill question/options/expectedAnswer, exercises fill task/hints.";

const BLOCKS_SYSTEM: &str = "You plan the blocks of a single lesson. Respond with ONLY a JSON \
object: {\"lessonId\": string, \"blocks\": [{\"id\": string, \"type\": \"text\" | \"code\" | \
\"question\" | \"task\" | \"flashcard\" | \"summary\", \"title\": string, \"purpose\": string, \
\"order\": number}]}";

const COMPACTION_SYSTEM: &str = "You summarize a learner's recent history. Respond with ONLY a \
JSON object: {\"summary\": string, \"strengths\": [string], \"weaknesses\": [string], \
\"recommendations\": [string]}";

fn block_content_schema(block_type: BlockType) -> &'static str {
    match block_type {
        BlockType::Text => "{\"text\": string (markdown)}",
        BlockType::Code => {
            "{\"language\": string, \"code\": string, \"explanation\": string, \"runnable\": boolean}"
        }
        BlockType::Question => {
            "{\"id\": string, \"text\": string, \"type\": \"multiple_choice\" | \"true_false\" | \
             \"fill_blank\" | \"short_answer\" | \"code\", \"options\": [{\"id\": string, \"text\": \
             string}], \"correctAnswer\": string, \"explanation\": string, \"hints\": [string]}"
        }
        BlockType::Task => {
            "{\"instruction\": string, \"hints\": [string], \"successCriteria\": [string], \
             \"solution\": string}"
        }
        BlockType::Flashcard => "{\"front\": string, \"back\": string, \"hint\": string}",
        BlockType::Summary => "{\"keyPoints\": [string], \"nextUp\": string}",
    }
}

fn learner_context(course: &Course) -> String {
    let memory = memory::memory_context(&course.memory);
    if memory.is_empty() {
        format!("Learning goal: {}", course.goal)
    } else {
        format!("Learning goal: {}\n{}", course.goal, memory)
    }
}

pub fn outline_prompt(course: &Course) -> Prompt {
    Prompt {
        system: OUTLINE_SYSTEM.to_string(),
        user: format!(
            "Create a course outline titled around this goal.\n{}",
            learner_context(course)
        ),
    }
}

pub fn step_prompt(course: &Course) -> Prompt {
    let recent = memory::recent_history(course);
    let history = if recent.is_empty() {
        "This is the learner's first step.".to_string()
    } else {
        format!("Recent topics: {}", recent.join(", "))
    };
    Prompt {
        system: STEP_SYSTEM.to_string(),
        user: format!(
            "{}\n{}\nSteps completed so far: {}",
            learner_context(course),
            history,
            course.steps.iter().filter(|s| s.completed).count()
        ),
    }
}

pub fn lesson_blocks_prompt(course: &Course, section: &Section, lesson: &Lesson) -> Prompt {
    Prompt {
        system: BLOCKS_SYSTEM.to_string(),
        user: format!(
            "{}\nSection: {}\nLesson id: {}\nLesson: {}\nDescription: {}\nEstimated minutes: {}",
            learner_context(course),
            section.title,
            lesson.id,
            lesson.title,
            lesson.description,
            lesson.estimated_minutes
        ),
    }
}

pub fn block_content_prompt(
    course: &Course,
    section: &Section,
    lesson: &Lesson,
    block: &Block,
) -> Prompt {
    let siblings: String = lesson
        .blocks
        .iter()
        .map(|b| format!("- {} ({}) [{}]\n", b.title, b.block_type, b.content_status))
        .collect();
    Prompt {
        system: format!(
            "You write the content of one lesson block. Respond with ONLY a JSON object: {}",
            block_content_schema(block.block_type)
        ),
        user: format!(
            "{}\nSection: {}\nLesson: {}\nLesson blocks:\n{}Block: {} ({})\nPurpose: {}",
            learner_context(course),
            section.title,
            lesson.title,
            siblings,
            block.title,
            block.block_type,
            block.purpose
        ),
    }
}

pub fn compaction_prompt(course: &Course, history: &[memory::HistoryItem]) -> Prompt {
    let lines: String = history
        .iter()
        .map(|item| match item.score {
            Some(score) => format!("- {} / {}: scored {:.0}\n", item.topic, item.title, score),
            None => format!("- {} / {}: completed\n", item.topic, item.title),
        })
        .collect();
    Prompt {
        system: COMPACTION_SYSTEM.to_string(),
        user: format!("{}\nHistory:\n{}", learner_context(course), lines),
    }
}
