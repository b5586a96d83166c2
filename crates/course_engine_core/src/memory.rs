//! crates/course_engine_core/src/memory.rs
//!
//! Learner memory: folding completed history into per-topic confidence and
//! rendering the bounded context that goes back into generation prompts.
//!
//! Compaction runs inline with the completion that triggers it but can never
//! fail that completion. A failed attempt leaves the memory untouched, so the
//! same window is retried on the next completion.

use crate::domain::{Compaction, Course, Memory, ProgressStatus, StepType, TopicMemory};
use crate::parser;
use crate::ports::Generator;
use crate::prompt;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const COMPACTION_INTERVAL: usize = 10;
pub const COMPACTION_TIMEOUT: Duration = Duration::from_secs(60);
const RECENT_TOPICS: usize = 5;
const STRENGTH_THRESHOLD: f64 = 0.7;
const WEAKNESS_THRESHOLD: f64 = 0.5;

//=========================================================================================
// History
//=========================================================================================

/// One completed unit, in completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryItem {
    pub index: usize,
    pub topic: String,
    pub title: String,
    pub score: Option<f64>,
}

/// Completed units of the course: steps for the flat model, lessons otherwise.
pub fn history(course: &Course) -> Vec<HistoryItem> {
    if course.uses_outline() {
        let Some(outline) = course.outline.as_ref() else {
            return Vec::new();
        };
        outline
            .lessons()
            .filter(|(_, lesson)| lesson.status == ProgressStatus::Completed)
            .enumerate()
            .map(|(index, (section, lesson))| HistoryItem {
                index,
                topic: section.title.clone(),
                title: lesson.title.clone(),
                score: lesson
                    .progress
                    .as_ref()
                    .filter(|_| lesson.has_question_blocks())
                    .map(|p| p.score()),
            })
            .collect()
    } else {
        course
            .steps
            .iter()
            .filter(|s| s.completed)
            .enumerate()
            .map(|(index, step)| HistoryItem {
                index,
                topic: step.topic.clone(),
                title: step.title.clone(),
                score: match step.step_type {
                    StepType::Quiz => Some(step.score.unwrap_or(0.0)),
                    _ => step.score.filter(|s| *s > 0.0),
                },
            })
            .collect()
    }
}

fn boundary(memory: &Memory) -> i64 {
    memory
        .compaction
        .as_ref()
        .map(|c| c.last_step_index as i64)
        .unwrap_or(-1)
}

/// Topics of the most recent units not yet folded into the summary.
pub fn recent_history(course: &Course) -> Vec<String> {
    let last = boundary(&course.memory);
    let pending: Vec<String> = history(course)
        .into_iter()
        .filter(|item| item.index as i64 > last)
        .map(|item| item.topic)
        .collect();
    let skip = pending.len().saturating_sub(RECENT_TOPICS);
    pending.into_iter().skip(skip).collect()
}

/// Blends one result into a topic: the first score sets confidence, later
/// ones average with the prior value.
pub fn record_result(topic: &mut TopicMemory, score: Option<f64>, now: DateTime<Utc>) {
    topic.times_tested += 1;
    topic.last_reviewed = Some(now);
    if let Some(score) = score.filter(|s| *s > 0.0) {
        let normalized = (score / 100.0).clamp(0.0, 1.0);
        topic.confidence = if topic.confidence == 0.0 {
            normalized
        } else {
            (topic.confidence + normalized) / 2.0
        };
    }
}

/// Renders memory for a prompt. Empty when there is nothing to say.
pub fn memory_context(memory: &Memory) -> String {
    let mut lines = Vec::new();
    if let Some(compaction) = memory.compaction.as_ref() {
        if !compaction.summary.is_empty() {
            lines.push(format!("Learning Summary: {}", compaction.summary));
        }
        if !compaction.strengths.is_empty() {
            lines.push(format!("Strengths: {}", compaction.strengths.join(", ")));
        }
        if !compaction.weaknesses.is_empty() {
            lines.push(format!("Areas to improve: {}", compaction.weaknesses.join(", ")));
        }
    }
    if !memory.topics.is_empty() {
        lines.push("Topic Confidence:".to_string());
        for (name, topic) in &memory.topics {
            lines.push(format!("- {}: {:.0}%", name, topic.confidence * 100.0));
        }
    }
    lines.join("\n")
}

//=========================================================================================
// Compactor
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    NotDue,
    Compacted { boundary: usize },
    Failed(String),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SummaryResponse {
    summary: String,
    strengths: Vec<String>,
    weaknesses: Vec<String>,
    recommendations: Vec<String>,
}

pub struct MemoryCompactor {
    generator: Option<Arc<dyn Generator>>,
    interval: usize,
    timeout: Duration,
}

impl MemoryCompactor {
    /// Without a generator, summaries are derived from the confidence map alone.
    pub fn new(generator: Option<Arc<dyn Generator>>, interval: usize, timeout: Duration) -> Self {
        Self {
            generator,
            interval: interval.max(1),
            timeout,
        }
    }

    pub fn should_compact(&self, memory: &Memory, completed_index: usize) -> bool {
        completed_index as i64 - boundary(memory) >= self.interval as i64
    }

    /// Folds units `(boundary, completed_index]` into `course.memory` when the
    /// interval has been reached. On failure `course.memory` is left as it was.
    pub async fn maybe_compact(&self, course: &mut Course, completed_index: usize) -> CompactionOutcome {
        if !self.should_compact(&course.memory, completed_index) {
            return CompactionOutcome::NotDue;
        }

        let last = boundary(&course.memory);
        let window: Vec<HistoryItem> = history(course)
            .into_iter()
            .filter(|item| item.index as i64 > last && item.index <= completed_index)
            .collect();

        let now = Utc::now();
        let mut memory = course.memory.clone();
        for item in &window {
            let topic = memory.topics.entry(item.topic.clone()).or_default();
            record_result(topic, item.score, now);
        }

        let summary = match self.generator.as_ref() {
            Some(generator) => match self.summarize(generator.as_ref(), course, &window).await {
                Ok(summary) => summary,
                Err(reason) => {
                    warn!(course_id = %course.id, completed_index, %reason, "Memory compaction failed");
                    return CompactionOutcome::Failed(reason);
                }
            },
            None => derive_summary(&memory, &window),
        };

        memory.compaction = Some(Compaction {
            last_step_index: completed_index,
            summary: parser::truncate(summary.summary),
            strengths: summary.strengths,
            weaknesses: summary.weaknesses,
            recommendations: summary.recommendations,
            compacted_at: now,
        });
        course.memory = memory;

        info!(
            course_id = %course.id,
            boundary = completed_index,
            folded = window.len(),
            "Compacted learner memory"
        );
        CompactionOutcome::Compacted {
            boundary: completed_index,
        }
    }

    async fn summarize(
        &self,
        generator: &dyn Generator,
        course: &Course,
        window: &[HistoryItem],
    ) -> Result<SummaryResponse, String> {
        let prompt = prompt::compaction_prompt(course, window);
        let raw = tokio::time::timeout(self.timeout, generator.complete(&prompt))
            .await
            .map_err(|_| format!("summary timed out after {:?}", self.timeout))?
            .map_err(|e| e.to_string())?;
        let parsed: SummaryResponse = serde_json::from_str(parser::extract_json(&raw))
            .map_err(|e| format!("summary was not valid JSON: {}", e))?;
        if parsed.summary.trim().is_empty() {
            return Err("summary was empty".to_string());
        }
        Ok(parsed)
    }
}

fn derive_summary(memory: &Memory, window: &[HistoryItem]) -> SummaryResponse {
    let strengths: Vec<String> = memory
        .topics
        .iter()
        .filter(|(_, t)| t.confidence >= STRENGTH_THRESHOLD)
        .map(|(name, _)| name.clone())
        .collect();
    let weaknesses: Vec<String> = memory
        .topics
        .iter()
        .filter(|(_, t)| t.times_tested > 0 && t.confidence < WEAKNESS_THRESHOLD)
        .map(|(name, _)| name.clone())
        .collect();

    let scores: Vec<f64> = window.iter().filter_map(|i| i.score).collect();
    let mut summary = format!("Completed {} units since the last review", window.len());
    if !scores.is_empty() {
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        summary.push_str(&format!(", averaging {:.0}% on assessed work", mean));
    }
    summary.push('.');

    SummaryResponse {
        summary,
        recommendations: weaknesses.iter().map(|t| format!("Review {}", t)).collect(),
        strengths,
        weaknesses,
    }
}
