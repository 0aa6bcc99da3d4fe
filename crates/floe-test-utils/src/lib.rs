//! Shared test doubles and fixtures for floe crates.

pub mod fixtures;
pub mod llm;
pub mod summarizer;

pub use fixtures::*;
pub use llm::ScriptedLlm;
pub use summarizer::{FailingSummarizer, FlakySummarizer, RecordingSummarizer};
