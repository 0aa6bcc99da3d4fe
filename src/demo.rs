use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, info};

use floe_core::config::{AppConfig, NodePolicy, ShortTermMemoryConfig, ValidationMode};
use floe_core::error::Result;
use floe_core::event::EventBus;
use floe_core::traits::{JsonLlmClient, StateStore};
use floe_core::types::{FinalAnswer, Headers, LlmResponse, Message, PromptMessage};
use floe_memory::{ShortTermMemory, SqliteStateStore};
use floe_planner::{NodeSpec, PauseStore, Planner, PlannerOutcome, RunRequest, ToolCatalog};
use floe_runtime::{Context, FlowBuilder, Node, NodeOutput};

/// Offline LLM that replays canned planner decisions, then finishes.
struct CannedLlm {
    replies: Mutex<VecDeque<Value>>,
}

impl CannedLlm {
    fn new(replies: impl IntoIterator<Item = Value>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
        }
    }
}

impl JsonLlmClient for CannedLlm {
    fn generate(
        &self,
        messages: Vec<PromptMessage>,
        _schema: Option<Value>,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let next = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| json!({"thought": "nothing left to do", "args": {"answer": "done"}}));
        debug!(prompt_messages = messages.len(), "Canned LLM reply");
        Box::pin(async move { Ok(LlmResponse::text(next.to_string())) })
    }
}

fn topic_of(message: &Message) -> String {
    message
        .payload
        .as_data()
        .and_then(|v| v["topic"].as_str())
        .unwrap_or_default()
        .to_string()
}

fn validated(policy: &NodePolicy) -> NodePolicy {
    policy.clone().with_validate(ValidationMode::Both)
}

fn triage(policy: &NodePolicy) -> Result<Node> {
    Node::new("triage", |m: Message, _ctx: Context| async move {
        let topic = topic_of(&m);
        Ok(NodeOutput::Emit(m.with_data(json!({"topic": topic, "query": format!("latest {topic}")}))))
    })
    .with_description("Normalize a request into a retrieval query")
    .with_policy(validated(policy))
    .with_input_schema(json!({
        "type": "object",
        "properties": {"topic": {"type": "string"}},
        "required": ["topic"]
    }))
}

fn retrieve(policy: &NodePolicy) -> Result<Node> {
    Node::new("retrieve", |m: Message, _ctx: Context| async move {
        let topic = topic_of(&m);
        let docs = vec![format!("{topic}-doc-1"), format!("{topic}-doc-2")];
        Ok(NodeOutput::Emit(m.with_data(json!({"topic": topic, "docs": docs}))))
    })
    .with_description("Fetch documents about a topic")
    .with_policy(validated(policy))
    .with_input_schema(json!({
        "type": "object",
        "properties": {"topic": {"type": "string"}},
        "required": ["topic"]
    }))?
    .with_output_schema(json!({"type": "object", "required": ["topic", "docs"]}))
}

fn pack(policy: &NodePolicy) -> Result<Node> {
    Node::new("pack", |m: Message, _ctx: Context| async move {
        let data = m.payload.as_data().cloned().unwrap_or_default();
        let topic = data["topic"].as_str().unwrap_or_default();
        let count = data["docs"].as_array().map_or(0, |d| d.len());
        let summary = format!("[{topic}] summary of {count} docs");
        Ok(NodeOutput::Emit(m.with_data(json!({"summary": summary}))))
    })
    .with_description("Summarize retrieved documents")
    .with_policy(validated(policy))
    .with_input_schema(json!({"type": "object", "required": ["docs"]}))
}

/// Run `triage -> retrieve -> pack` for one topic and return the egress payload.
pub async fn run_pipeline(config: &AppConfig, topic: &str) -> Result<Value> {
    let policy = &config.runtime.default_policy;
    let mut flow = FlowBuilder::new()
        .config(config.runtime.clone())
        .node(triage(policy)?)
        .node(retrieve(policy)?)
        .node(pack(policy)?)
        .edge("triage", "retrieve")
        .edge("retrieve", "pack")
        .build()?
        .run();
    spawn_event_logger(flow.events());

    let message = Message::data(json!({"topic": topic}), Headers::new("demo"));
    let trace_id = message.trace_id.clone();
    flow.emit(message).await?;
    let result = flow.fetch().await;
    flow.stop().await;

    let out = result?;
    info!(trace_id = %trace_id, "Pipeline finished");
    Ok(out.payload.to_value())
}

/// Let the planner answer a question about `topic` using the pipeline
/// nodes as tools, remembering the exchange under a demo session.
pub async fn run_planner(config: &AppConfig, topic: &str) -> Result<FinalAnswer> {
    let policy = &config.runtime.default_policy;
    let catalog = ToolCatalog::new()
        .with(NodeSpec::new(retrieve(policy)?).with_tags(["read"]))?
        .with(NodeSpec::new(pack(policy)?).with_tags(["read"]))?;

    let llm = Arc::new(CannedLlm::new([
        json!({"thought": "find sources first", "next_node": "retrieve", "args": {"topic": topic}}),
        json!({
            "thought": "condense what was found",
            "next_node": "pack",
            "args": {"topic": topic, "docs": [format!("{topic}-doc-1"), format!("{topic}-doc-2")]}
        }),
        json!({"thought": "the packed summary answers it", "args": {"answer": format!("Two documents cover {topic}.")}}),
    ]));

    let events = Arc::new(EventBus::new(config.runtime.event_capacity));
    spawn_event_logger(&events);

    let memory_config = if config.memory.enabled() {
        config.memory.clone()
    } else {
        ShortTermMemoryConfig::truncation(3)
    };
    let mut memory = ShortTermMemory::new(memory_config).with_events(events.clone());
    let mut pauses = PauseStore::new();
    if let Some(store) = &config.state_store {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(Path::new(&store.path))?);
        memory = memory.with_state_store(store.clone());
        pauses = PauseStore::with_state_store(store);
    }

    let planner = Planner::new(llm, catalog, config.planner.clone())
        .with_events(events)
        .with_memory(Arc::new(memory))
        .with_pause_store(pauses);

    let request = RunRequest::new(format!("What do we know about {topic}?")).with_tool_context(json!({
        "tenant_id": "demo",
        "user_id": "cli",
        "session_id": "demo",
    }));
    match planner.run(request).await? {
        PlannerOutcome::Finish(answer) => Ok(answer),
        PlannerOutcome::Pause(pause) => {
            info!(token = %pause.token, reason = %pause.reason, "Demo run paused");
            Ok(FinalAnswer::clarification(format!("paused: {}", pause.reason)))
        }
    }
}

fn spawn_event_logger(events: &Arc<EventBus>) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            debug!(kind = event.kind(), trace_id = %event.trace_id(), "Event");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_core::types::FinishReason;

    #[tokio::test]
    async fn test_pipeline_summarizes_topic() {
        let out = run_pipeline(&AppConfig::default(), "metrics").await.unwrap();
        assert_eq!(out["summary"], "[metrics] summary of 2 docs");
    }

    #[tokio::test]
    async fn test_planner_demo_completes() {
        let answer = run_planner(&AppConfig::default(), "metrics").await.unwrap();
        assert_eq!(answer.reason, FinishReason::AnswerComplete);
        assert_eq!(answer.text, "Two documents cover metrics.");
        assert_eq!(answer.metadata["hops"], 2);
    }
}
