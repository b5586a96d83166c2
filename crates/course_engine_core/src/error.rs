//! crates/course_engine_core/src/error.rs
//!
//! The error taxonomy surfaced by the engine. Port failures arrive as
//! `PortError` and are wrapped; everything the synchronous request path can
//! return is an `EngineError` carrying a stable machine code.

use crate::domain::CourseStatus;
use crate::parser::ParseError;
use crate::ports::PortError;
use crate::usage::UsageDecision;
use std::fmt;

/// Why a unit failed to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationCause {
    Upstream,
    Parse,
    Timeout,
}

impl fmt::Display for GenerationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Upstream => "upstream",
            Self::Parse => "parse",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("generation failed ({cause}): {message}")]
pub struct GenerationError {
    pub cause: GenerationCause,
    pub message: String,
}

impl GenerationError {
    pub fn upstream(message: impl Into<String>) -> Self {
        Self {
            cause: GenerationCause::Upstream,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            cause: GenerationCause::Timeout,
            message: message.into(),
        }
    }
}

impl From<ParseError> for GenerationError {
    fn from(err: ParseError) -> Self {
        Self {
            cause: GenerationCause::Parse,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A malformed request to the engine, e.g. an unknown unit or block id.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The course is not active, so no new units may be generated or completed.
    #[error("course {status}")]
    CourseInactive { status: CourseStatus },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("usage limit reached ({} of {})", .0.used, .0.limit)]
    LimitExceeded(UsageDecision),

    #[error("persistence failure: {0}")]
    Persistence(PortError),
}

impl EngineError {
    /// A stable identifier callers can branch on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::CourseInactive { status } => match status {
                CourseStatus::Archived => "COURSE_ARCHIVED",
                CourseStatus::Completed => "COURSE_COMPLETED",
                CourseStatus::Deleted => "COURSE_DELETED",
                CourseStatus::Active => "COURSE_INACTIVE",
            },
            Self::Generation(_) => "GENERATION_ERROR",
            Self::LimitExceeded(_) => "LIMIT_EXCEEDED",
            Self::Persistence(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<PortError> for EngineError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::NotFound(what) => Self::NotFound(what),
            other => Self::Persistence(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archived_course_names_itself() {
        let err = EngineError::CourseInactive {
            status: CourseStatus::Archived,
        };
        assert_eq!(err.to_string(), "course archived");
        assert_eq!(err.code(), "COURSE_ARCHIVED");
    }

    #[test]
    fn port_not_found_maps_to_not_found() {
        let err: EngineError = PortError::NotFound("course 1".into()).into();
        assert!(matches!(err, EngineError::NotFound(_)));

        let err: EngineError = PortError::Unexpected("pool closed".into()).into();
        assert_eq!(err.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn generation_error_display() {
        let err = GenerationError::timeout("outline took longer than 120s");
        assert_eq!(
            err.to_string(),
            "generation failed (timeout): outline took longer than 120s"
        );
    }
}
