pub mod cache;
pub mod dispatcher;
pub mod domain;
pub mod engine;
pub mod error;
pub mod generation;
pub mod in_memory;
pub mod memory;
pub mod parser;
pub mod ports;
pub mod position;
pub mod progress;
pub mod prompt;
pub mod usage;

pub use domain::{
    Block, BlockContent, BlockType, ContentStatus, Course, CourseStatus, Lesson, LessonPosition,
    Outline, Section, Step, StepType, Tier,
};
pub use engine::{CourseEngine, EngineConfig, EnginePorts, Learner, UsageReport};
pub use error::{EngineError, EngineResult, GenerationCause, GenerationError};
pub use generation::UnitRequest;
pub use parser::Unit;
pub use ports::{
    CoursePatch, CourseRepository, Generator, PortError, PortResult, TaskHandle, TaskQueue,
    UsageStore,
};
pub use progress::{CompletionOutcome, NextUnit, UnitCompletion};
pub use usage::{UsageDecision, UsageWindow};
