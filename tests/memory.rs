use std::sync::Arc;

use serde_json::json;

use floe_core::config::{AppConfig, ShortTermMemoryConfig};
use floe_core::traits::StateStore;
use floe_memory::{MemoryHealth, ShortTermMemory, SqliteStateStore};
use floe_test_utils::{memory_key, turn, FailingSummarizer, RecordingSummarizer};

#[tokio::test]
async fn test_truncation_returns_last_two_of_three_turns() {
    let memory = ShortTermMemory::new(ShortTermMemoryConfig::truncation(2));
    let key = memory_key("triage");
    for n in 1..=3 {
        memory.add_turn(&key, turn(n)).await.unwrap();
    }

    let ctx = memory.get_llm_context(&key).await.unwrap();
    let recent = ctx["recent_turns"].as_array().unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["user"], "question 2");
    assert_eq!(recent[1]["assistant"], "answer 3");
}

#[tokio::test(start_paused = true)]
async fn test_failing_summarizer_degrades_without_summary() {
    let summarizer = Arc::new(FailingSummarizer::new());
    let memory = ShortTermMemory::new(ShortTermMemoryConfig::rolling_summary(2))
        .with_summarizer(summarizer.clone());
    let key = memory_key("degraded");
    for n in 1..=3 {
        memory.add_turn(&key, turn(n)).await.unwrap();
    }
    memory.flush(&key).await;

    assert_eq!(summarizer.calls(), 3);
    assert_eq!(memory.health(&key), Some(MemoryHealth::Degraded));
    let ctx = memory.get_llm_context(&key).await.unwrap();
    assert!(ctx.get("summary").is_none());
    assert_eq!(ctx["recent_turns"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_isolation_from_tool_context_fails_closed() {
    let config = AppConfig::from_toml(
        r#"
        [memory]
        strategy = "truncation"

        [memory.budget]
        full_zone_turns = 3

        [memory.isolation]
        session_key = "conversation.id"
        "#,
    )
    .unwrap();
    let memory = ShortTermMemory::new(config.memory);

    let ctx = json!({"tenant_id": "acme", "user_id": "u-1", "conversation": {"id": "c-9"}});
    let key = memory.resolve_key(None, &ctx).unwrap();
    assert_eq!(key.composite(), "acme:u-1:c-9");

    let anonymous = json!({"tenant_id": "acme", "user_id": "u-1"});
    assert!(memory.resolve_key(None, &anonymous).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rolling_summary_persists_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let key = memory_key("durable");

    {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&path).unwrap());
        let memory = ShortTermMemory::new(ShortTermMemoryConfig::rolling_summary(1))
            .with_summarizer(Arc::new(RecordingSummarizer::new()))
            .with_state_store(store);
        memory.add_turn(&key, turn(1)).await.unwrap();
        memory.add_turn(&key, turn(2)).await.unwrap();
        memory.flush_all().await;
    }

    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&path).unwrap());
    let memory = ShortTermMemory::new(ShortTermMemoryConfig::rolling_summary(1)).with_state_store(store);
    let ctx = memory.get_llm_context(&key).await.unwrap();
    assert_eq!(ctx["summary"], "user asked: question 1");
    assert_eq!(ctx["recent_turns"][0]["user"], "question 2");
}
