use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use floe_core::error::{FloeError, Result};
use floe_core::traits::JsonLlmClient;
use floe_core::types::{LlmResponse, PromptMessage, Usage};

/// LLM double that replays a fixed script of responses and records every
/// prompt it was given.
#[derive(Default)]
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<LlmResponse>>>,
    prompts: Mutex<Vec<Vec<PromptMessage>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script of JSON actions, each returned verbatim as content.
    pub fn with_actions(actions: impl IntoIterator<Item = serde_json::Value>) -> Self {
        let llm = Self::new();
        for action in actions {
            llm.push_json(action);
        }
        llm
    }

    pub fn push_json(&self, value: serde_json::Value) -> &Self {
        self.push(Ok(LlmResponse::text(value.to_string())))
    }

    pub fn push_json_with_usage(&self, value: serde_json::Value, input: u64, output: u64) -> &Self {
        self.push(Ok(LlmResponse {
            content: value.to_string(),
            usage: Some(Usage {
                input_tokens: input,
                output_tokens: output,
            }),
        }))
    }

    pub fn push_text(&self, content: impl Into<String>) -> &Self {
        self.push(Ok(LlmResponse::text(content)))
    }

    pub fn push_error(&self, message: impl Into<String>) -> &Self {
        self.push(Err(FloeError::Llm(message.into())))
    }

    fn push(&self, item: Result<LlmResponse>) -> &Self {
        self.script.lock().unwrap().push_back(item);
        self
    }

    /// Number of generate calls made so far.
    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<Vec<PromptMessage>> {
        self.prompts.lock().unwrap().clone()
    }

    /// The user content of the most recent prompt.
    pub fn last_user_prompt(&self) -> Option<String> {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .and_then(|msgs| msgs.last())
            .map(|m| m.content.clone())
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl JsonLlmClient for ScriptedLlm {
    fn generate(
        &self,
        messages: Vec<PromptMessage>,
        _schema: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        self.prompts.lock().unwrap().push(messages);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FloeError::Llm("script exhausted".into())));
        Box::pin(async move { next })
    }
}
