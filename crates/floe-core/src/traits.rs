use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ConversationTurn, LlmResponse, PromptMessage};

/// Structured-output LLM client. Provider adapters live outside this
/// workspace; the planner only relies on this contract.
pub trait JsonLlmClient: Send + Sync + 'static {
    /// Generate a response, optionally constrained by a JSON schema.
    ///
    /// The returned content is untrusted: callers must parse and validate it.
    fn generate(
        &self,
        messages: Vec<PromptMessage>,
        schema: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<LlmResponse>>;
}

/// Key/value persistence for memory sessions and paused planner runs.
pub trait StateStore: Send + Sync + 'static {
    fn save(&self, key: &str, value: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    fn load(&self, key: &str) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>>;
}

/// Produces the rolling summary of turns that left the full zone.
pub trait Summarizer: Send + Sync + 'static {
    /// Fold `turns` into `previous` (if any), returning the new summary.
    fn summarize(
        &self,
        previous: Option<String>,
        turns: Vec<ConversationTurn>,
    ) -> BoxFuture<'_, Result<String>>;
}
