use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use floe_core::error::{FloeError, Result};
use floe_core::traits::{JsonLlmClient, Summarizer};
use floe_core::types::{ConversationTurn, PromptMessage};

const SYSTEM_PROMPT: &str = "You maintain a running summary of a conversation. \
Merge the new turns into the previous summary, preserving facts, decisions \
and open questions. Respond with JSON: {\"summary\": \"...\"}.";

/// [`Summarizer`] backed by a structured-output LLM.
pub struct LlmSummarizer {
    llm: Arc<dyn JsonLlmClient>,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn JsonLlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(previous: Option<&str>, turns: &[ConversationTurn]) -> String {
        let mut text = String::new();
        if let Some(previous) = previous {
            text.push_str("Previous summary:\n");
            text.push_str(previous);
            text.push_str("\n\n");
        }
        text.push_str("New turns:\n");
        for turn in turns {
            text.push_str(&format!("User: {}\nAssistant: {}\n", turn.user_message, turn.assistant_response));
            if let Some(digest) = &turn.trajectory_digest {
                if !digest.tools_invoked.is_empty() {
                    text.push_str(&format!("Tools: {}\n", digest.tools_invoked.join(", ")));
                }
            }
        }
        text
    }
}

impl Summarizer for LlmSummarizer {
    fn summarize(
        &self,
        previous: Option<String>,
        turns: Vec<ConversationTurn>,
    ) -> BoxFuture<'_, Result<String>> {
        let messages = vec![
            PromptMessage::system(SYSTEM_PROMPT),
            PromptMessage::user(Self::prompt(previous.as_deref(), &turns)),
        ];
        let schema = json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}},
            "required": ["summary"],
        });
        Box::pin(async move {
            let response = self
                .llm
                .generate(messages, Some(schema))
                .await
                .map_err(|e| FloeError::Summarizer(e.to_string()))?;

            // Providers without structured output may answer in plain text.
            let summary = match serde_json::from_str::<serde_json::Value>(&response.content) {
                Ok(value) => value
                    .get("summary")
                    .and_then(|s| s.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| FloeError::Summarizer("response missing 'summary'".into()))?,
                Err(_) => response.content.trim().to_string(),
            };
            if summary.trim().is_empty() {
                return Err(FloeError::Summarizer("empty summary".into()));
            }
            Ok(summary)
        })
    }
}
