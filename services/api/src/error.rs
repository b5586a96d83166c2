//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and how it is
//! rendered as an HTTP response.

use crate::config::ConfigError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use course_engine_core::{CourseStatus, EngineError, UsageDecision};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error surfaced by the course engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents an error from running the embedded migrations.
    #[error("Migration Error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Engine(EngineError::Validation(message.into()))
    }
}

/// The JSON body of every error response.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub usage: Option<UsageDecision>,
}

fn engine_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::CourseInactive {
            status: CourseStatus::Deleted,
        } => StatusCode::NOT_FOUND,
        EngineError::CourseInactive { .. } => StatusCode::CONFLICT,
        EngineError::LimitExceeded(_) => StatusCode::FORBIDDEN,
        EngineError::Generation(_) => StatusCode::BAD_GATEWAY,
        EngineError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::Engine(err) => {
                let status = engine_status(err);
                let usage = match err {
                    EngineError::LimitExceeded(decision) => Some(decision.clone()),
                    _ => None,
                };
                // Internal details stay in the logs.
                let message = match err {
                    EngineError::Persistence(_) => "Internal server error".to_string(),
                    other => other.to_string(),
                };
                (
                    status,
                    ErrorBody {
                        code: err.code().to_string(),
                        error: message,
                        usage,
                    },
                )
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody {
                    code: "INTERNAL_ERROR".to_string(),
                    error: "Internal server error".to_string(),
                    usage: None,
                },
            ),
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use course_engine_core::{GenerationError, PortError, UsageWindow};

    #[test]
    fn taxonomy_maps_to_status_codes() {
        let cases = [
            (EngineError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (EngineError::NotFound("course".into()), StatusCode::NOT_FOUND),
            (
                EngineError::CourseInactive {
                    status: CourseStatus::Archived,
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::CourseInactive {
                    status: CourseStatus::Completed,
                },
                StatusCode::CONFLICT,
            ),
            (
                EngineError::CourseInactive {
                    status: CourseStatus::Deleted,
                },
                StatusCode::NOT_FOUND,
            ),
            (
                EngineError::Generation(GenerationError::timeout("slow")),
                StatusCode::BAD_GATEWAY,
            ),
            (
                EngineError::Persistence(PortError::Unavailable("db".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn limit_denial_carries_usage() {
        let decision = UsageDecision {
            allowed: false,
            used: 100,
            limit: 100,
            window: Some(UsageWindow::DailyGenerations),
            period: Some("2026-10-16".into()),
            resets_at: None,
        };
        let response = ApiError::from(EngineError::LimitExceeded(decision)).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn non_engine_errors_are_internal() {
        let response = ApiError::Internal("boom".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
