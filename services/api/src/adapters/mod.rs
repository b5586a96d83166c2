pub mod db;
pub mod generator_llm;
pub mod queue;

pub use db::DbAdapter;
pub use generator_llm::OpenAiGenerator;
pub use queue::{PgTaskQueue, QueueWorker};
