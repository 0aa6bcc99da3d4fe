use std::path::Path;

use floe_core::config::{AppConfig, MemoryStrategy, OverflowPolicy};
use floe_memory::SqliteStateStore;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print one line per check. Returns the number of failed checks.
pub fn run_checks(config: &AppConfig) -> usize {
    let checks = vec![
        check_runtime(config),
        check_planner_budgets(config),
        check_memory(config),
        check_isolation(config),
        check_state_store(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_runtime(config: &AppConfig) -> CheckResult {
    let policy = &config.runtime.default_policy;
    CheckResult {
        label: "Runtime".into(),
        ok: true,
        detail: format!(
            "queue capacity {}, default retries {}, errors to egress: {}",
            config.runtime.queue_capacity, policy.max_retries, config.runtime.emit_errors_to_egress
        ),
    }
}

fn check_planner_budgets(config: &AppConfig) -> CheckResult {
    let planner = &config.planner;
    let bounded = planner.hop_budget.is_some() || planner.token_budget.is_some() || planner.time_budget_s.is_some();
    if !bounded {
        return CheckResult {
            label: "Planner budgets".into(),
            ok: false,
            detail: "no hop, token or time budget set; runs could loop forever".into(),
        };
    }
    let fmt_opt = |v: Option<String>| v.unwrap_or_else(|| "unlimited".into());
    CheckResult {
        label: "Planner budgets".into(),
        ok: true,
        detail: format!(
            "hops {}, tokens {}, time {}, max parallel {}",
            fmt_opt(planner.hop_budget.map(|h| h.to_string())),
            fmt_opt(planner.token_budget.map(|t| t.to_string())),
            fmt_opt(planner.time_budget_s.map(|s| format!("{}s", s))),
            planner.max_parallel
        ),
    }
}

fn check_memory(config: &AppConfig) -> CheckResult {
    let memory = &config.memory;
    let detail = match memory.strategy {
        MemoryStrategy::None => "disabled".to_string(),
        MemoryStrategy::Truncation => format!("truncation, last {} turns", memory.budget.full_zone_turns),
        MemoryStrategy::RollingSummary => format!(
            "rolling summary over {} turns, summary <= {} tokens",
            memory.budget.full_zone_turns, memory.budget.summary_max_tokens
        ),
    };
    // A summary that alone fills the total budget leaves no room for turns.
    if memory.enabled()
        && memory.budget.overflow_policy != OverflowPolicy::Error
        && memory.budget.summary_max_tokens >= memory.budget.total_max_tokens
    {
        return CheckResult {
            label: "Memory".into(),
            ok: false,
            detail: format!(
                "{}; summary_max_tokens ({}) must be below total_max_tokens ({})",
                detail, memory.budget.summary_max_tokens, memory.budget.total_max_tokens
            ),
        };
    }
    CheckResult {
        label: "Memory".into(),
        ok: true,
        detail,
    }
}

fn check_isolation(config: &AppConfig) -> CheckResult {
    let isolation = &config.memory.isolation;
    let paths = format!(
        "{} / {} / {}",
        isolation.tenant_key, isolation.user_key, isolation.session_key
    );
    if config.memory.enabled() && !isolation.require_explicit_key {
        return CheckResult {
            label: "Isolation".into(),
            ok: true,
            detail: format!("{} (missing parts fall back to \"default\")", paths),
        };
    }
    CheckResult {
        label: "Isolation".into(),
        ok: true,
        detail: format!("{} (fail closed)", paths),
    }
}

fn check_state_store(config: &AppConfig) -> CheckResult {
    let Some(store) = &config.state_store else {
        return CheckResult {
            label: "State store".into(),
            ok: true,
            detail: "not configured, pauses and sessions stay in process".into(),
        };
    };
    match SqliteStateStore::open(Path::new(&store.path)) {
        Ok(_) => CheckResult {
            label: "State store".into(),
            ok: true,
            detail: format!("SQLite at {}", store.path),
        },
        Err(e) => CheckResult {
            label: "State store".into(),
            ok: false,
            detail: format!("cannot open {}: {}", store.path, e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_passes() {
        assert_eq!(run_checks(&AppConfig::default()), 0);
    }

    #[test]
    fn test_unbounded_planner_is_flagged() {
        let mut config = AppConfig::default();
        config.planner.hop_budget = None;
        assert!(!check_planner_budgets(&config).ok);
    }

    #[test]
    fn test_unopenable_store_is_flagged() {
        // The parent "directory" is a regular file.
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = AppConfig::from_toml(&format!(
            "[state_store]\npath = \"{}\"\n",
            file.path().join("state.db").display()
        ))
        .unwrap();
        assert!(!check_state_store(&config).ok);
    }
}
