use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use floe_core::config::AppConfig;
use floe_core::traits::StateStore;
use floe_core::types::{FinishReason, Message};
use floe_memory::{ShortTermMemory, SqliteStateStore};
use floe_planner::{NodeSpec, PauseStore, Planner, RunRequest, ToolCatalog};
use floe_runtime::{Context, Node, NodeOutput};
use floe_test_utils::{config_file, memory_key, ScriptedLlm};

fn catalog() -> ToolCatalog {
    let inventory = Node::new("inventory", |m: Message, _ctx: Context| async move {
        Ok(NodeOutput::Emit(m.with_data(json!({"sku": "A-1", "in_stock": 3}))))
    });
    ToolCatalog::new().with(NodeSpec::new(inventory)).unwrap()
}

fn planner(llm: Arc<ScriptedLlm>, config: &AppConfig, store: Arc<dyn StateStore>) -> Planner {
    let memory = ShortTermMemory::new(config.memory.clone()).with_state_store(store.clone());
    Planner::new(llm, catalog(), config.planner.clone())
        .with_memory(Arc::new(memory))
        .with_pause_store(PauseStore::with_state_store(store))
}

#[tokio::test]
async fn test_paused_run_resumes_in_a_fresh_planner() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    let file = config_file(&format!(
        r#"
[planner]
hop_budget = 5

[memory]
strategy = "truncation"

[memory.budget]
full_zone_turns = 4

[state_store]
path = "{}"
"#,
        db.display()
    ));
    let config = AppConfig::load(file.path()).unwrap();
    let db_path = config.state_store.as_ref().unwrap().path.clone();

    let token = {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(Path::new(&db_path)).unwrap());
        let llm = Arc::new(ScriptedLlm::with_actions([
            json!({"thought": "check stock", "next_node": "inventory", "args": {"sku": "A-1"}}),
            json!({"thought": "order needs sign-off", "pause": {"reason": "approval_required", "payload": {"order": 3}}}),
        ]));
        let first = planner(llm, &config, store);
        let request = RunRequest::new("order three A-1").with_memory_key(memory_key("orders"));
        let outcome = first.run(request).await.unwrap();
        outcome.pause().unwrap().token.clone()
    };

    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(Path::new(&db_path)).unwrap());
    let llm = Arc::new(ScriptedLlm::with_actions([
        json!({"thought": "approved", "args": {"answer": "Ordered 3 x A-1"}}),
    ]));
    let second = planner(llm.clone(), &config, store.clone());

    let outcome = second.resume(&token, json!({"approved": true})).await.unwrap();
    let answer = outcome.answer().unwrap();
    assert_eq!(answer.reason, FinishReason::AnswerComplete);
    assert_eq!(answer.text, "Ordered 3 x A-1");
    assert_eq!(answer.metadata["hops"], 1);

    let prompt: serde_json::Value =
        serde_json::from_str(&llm.prompts()[0][1].content).unwrap();
    assert_eq!(prompt["steps"][0]["observation"]["in_stock"], 3);
    assert_eq!(prompt["human_inputs"][0]["approved"], true);

    assert!(second.resume(&token, json!({})).await.is_err());

    // The finished turn was persisted under the session key.
    let third = ShortTermMemory::new(config.memory.clone()).with_state_store(store);
    let ctx = third.get_llm_context(&memory_key("orders")).await.unwrap();
    assert_eq!(ctx["recent_turns"][0]["assistant"], "Ordered 3 x A-1");
}
