//! Short-term memory for planner runs.
//!
//! Turns are stored per [`MemoryKey`](floe_core::types::MemoryKey) in a
//! [`ShortTermMemory`] store. Each key owns a [`SessionMemory`] that applies
//! the configured strategy (truncation or rolling summary), tracks summarizer
//! health and enforces the token budget.

pub mod isolation;
pub mod session;
pub mod state_store;
pub mod store;
pub mod summarizer;

pub use isolation::{lookup_path, resolve_key};
pub use session::{MemoryHealth, SessionMemory, SessionSnapshot};
pub use state_store::{InMemoryStateStore, SqliteStateStore};
pub use store::ShortTermMemory;
pub use summarizer::LlmSummarizer;
