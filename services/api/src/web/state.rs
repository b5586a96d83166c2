//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use course_engine_core::CourseEngine;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CourseEngine>,
}

impl AppState {
    pub fn new(engine: Arc<CourseEngine>) -> Self {
        Self { engine }
    }
}
