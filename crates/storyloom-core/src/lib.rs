//! Storyloom generation pipeline core
//!
//! The machinery between an incoming story request and the completion of
//! its artifacts: a durable job store, a queue decoupling admission from
//! execution, a worker that atomically claims and routes jobs, a text
//! orchestrator with strict schema validation between stages, a
//! single-transaction persistence coordinator, per-page media handlers and
//! a failure recorder.

pub mod ai;
pub mod assemble;
pub mod config;
pub mod error;
pub mod failures;
pub mod media;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod prompts;
pub mod queue;
pub mod repository;
pub mod worker;

// Re-export commonly used types
pub use ai::{ChatClient, ChatOutcome, ChatParams, OpenAiClient, TokenUsage};
pub use assemble::{StoryDraft, TranslationDraft, VocabularyDraft};
pub use config::Config;
pub use error::{Error, Result};
pub use failures::{FailureContext, FailureRecorder};
pub use models::{
    FailedJob, GenerationJob, JobStatus, JobType, MediaAsset, MediaKind, Story, StoryPage,
    StoryStatus, VocabEntry,
};
pub use orchestrator::{PipelineOutput, StoryOrchestrator, StoryRequest};
pub use persistence::PersistenceCoordinator;
pub use queue::{Envelope, JobQueue};
pub use repository::{create_pool, InMemoryJobStore, JobStore, PostgresDb, PostgresJobStore};
pub use worker::{MediaHandlers, Worker};

/// Current version of storyloom
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
