use std::io::Write;

use floe_core::config::{AppConfig, MemoryStrategy, OverflowPolicy, ValidationMode};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[runtime]
queue_capacity = 16
emit_errors_to_egress = true

[runtime.default_policy]
validate = "both"
timeout_s = 2.5
max_retries = 3
backoff_base_s = 0.1
backoff_max_s = 1.0
backoff_jitter = 0.2

[planner]
hop_budget = 12
token_budget = 50000
time_budget_s = 30.0
max_parallel = 2
repair_attempts = 1
count_repairs_as_hops = true
max_observation_chars = 800

[memory]
strategy = "rolling_summary"
degraded_retry_interval_s = 10.0

[memory.budget]
full_zone_turns = 4
summary_max_tokens = 300
total_max_tokens = 2000
overflow_policy = "error"

[memory.isolation]
tenant_key = "org.id"
require_explicit_key = true

[state_store]
path = "/tmp/floe-test/state.db"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runtime.queue_capacity, 16);
    assert!(config.runtime.emit_errors_to_egress);
    let policy = &config.runtime.default_policy;
    assert_eq!(policy.validate, ValidationMode::Both);
    assert_eq!(policy.timeout_s, Some(2.5));
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.backoff_max_s, Some(1.0));

    assert_eq!(config.planner.hop_budget, Some(12));
    assert_eq!(config.planner.token_budget, Some(50000));
    assert_eq!(config.planner.max_parallel, 2);
    assert_eq!(config.planner.repair_attempts, 1);
    assert!(config.planner.count_repairs_as_hops);
    assert!(config.planner.arg_fill_enabled);

    assert_eq!(config.memory.strategy, MemoryStrategy::RollingSummary);
    assert_eq!(config.memory.budget.full_zone_turns, 4);
    assert_eq!(config.memory.budget.overflow_policy, OverflowPolicy::Error);
    assert_eq!(config.memory.isolation.tenant_key, "org.id");
    assert_eq!(config.memory.isolation.user_key, "user_id");

    let store = config.state_store.expect("state store present");
    assert_eq!(store.path, "/tmp/floe-test/state.db");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("FLOE_TEST_STATE_PATH", "/var/lib/floe/state.db");

    let toml_content = r#"
[state_store]
path = "${FLOE_TEST_STATE_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.state_store.unwrap().path, "/var/lib/floe/state.db");

    std::env::remove_var("FLOE_TEST_STATE_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[planner]\nmax_parallel = 8\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.planner.max_parallel, 8);
    assert_eq!(config.planner.hop_budget, Some(8));
    assert_eq!(config.planner.repair_attempts, 2);
    assert_eq!(config.runtime.queue_capacity, 64);
    assert_eq!(config.runtime.default_policy.max_retries, 0);
    assert_eq!(config.memory.strategy, MemoryStrategy::None);
    assert!(config.state_store.is_none());
}

#[test]
fn test_invalid_values_are_rejected() {
    for toml_content in [
        "[runtime]\nqueue_capacity = 0\n",
        "[planner]\nmax_parallel = 0\n",
        "[runtime.default_policy]\nbackoff_jitter = 1.5\n",
        "[memory]\nstrategy = \"truncation\"\n[memory.budget]\nfull_zone_turns = 0\n",
    ] {
        let err = AppConfig::from_toml(toml_content).unwrap_err();
        assert_eq!(err.kind(), "config_error", "config: {toml_content}");
    }
}

#[test]
fn test_missing_file_is_config_not_found() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, floe_core::error::FloeError::ConfigNotFound(_)));
}
