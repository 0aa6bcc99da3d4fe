use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FloeError, Result};

/// Top-level floe configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub memory: ShortTermMemoryConfig,
    #[serde(default)]
    pub state_store: Option<StateStoreConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FloeError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        Self::from_toml(&expanded)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| FloeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the runtime misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.queue_capacity == 0 {
            return Err(FloeError::Config("runtime.queue_capacity must be > 0".into()));
        }
        if self.planner.max_parallel == 0 {
            return Err(FloeError::Config("planner.max_parallel must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.runtime.default_policy.backoff_jitter) {
            return Err(FloeError::Config(
                "runtime.default_policy.backoff_jitter must be within [0, 1]".into(),
            ));
        }
        if self.memory.strategy != MemoryStrategy::None && self.memory.budget.full_zone_turns == 0 {
            return Err(FloeError::Config("memory.budget.full_zone_turns must be > 0".into()));
        }
        Ok(())
    }
}

/// Flow runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Default capacity for edges declared without an explicit one.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Surface node failures as error payloads at egress instead of raising.
    #[serde(default)]
    pub emit_errors_to_egress: bool,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Policy applied to nodes that do not declare their own.
    #[serde(default)]
    pub default_policy: NodePolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            emit_errors_to_egress: false,
            event_capacity: default_event_capacity(),
            default_policy: NodePolicy::default(),
        }
    }
}

fn default_queue_capacity() -> usize { 64 }
fn default_event_capacity() -> usize { 256 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    None,
    Input,
    Output,
    Both,
}

impl ValidationMode {
    pub fn checks_input(&self) -> bool {
        matches!(self, Self::Input | Self::Both)
    }

    pub fn checks_output(&self) -> bool {
        matches!(self, Self::Output | Self::Both)
    }
}

/// Per-node execution policy. Fixed once the flow is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePolicy {
    #[serde(default)]
    pub validate: ValidationMode,
    /// Per-attempt timeout in seconds.
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_s")]
    pub backoff_base_s: f64,
    #[serde(default)]
    pub backoff_max_s: Option<f64>,
    /// Fraction in [0, 1] by which a delay may be stretched. Never shortens.
    #[serde(default)]
    pub backoff_jitter: f64,
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            validate: ValidationMode::None,
            timeout_s: None,
            max_retries: 0,
            backoff_base_s: default_backoff_base_s(),
            backoff_max_s: None,
            backoff_jitter: 0.0,
        }
    }
}

fn default_backoff_base_s() -> f64 { 0.5 }

impl NodePolicy {
    pub fn with_validate(mut self, mode: ValidationMode) -> Self {
        self.validate = mode;
        self
    }

    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        self.timeout_s = Some(timeout_s);
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base_s: f64) -> Self {
        self.max_retries = max_retries;
        self.backoff_base_s = backoff_base_s;
        self
    }

    pub fn with_backoff_max(mut self, backoff_max_s: f64) -> Self {
        self.backoff_max_s = Some(backoff_max_s);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_s
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Un-jittered delay before retry number `attempt` (0-based):
    /// `backoff_base_s * 2^attempt`, capped by `backoff_max_s`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(30) as i32);
        let mut secs = self.backoff_base_s.max(0.0) * exp;
        if let Some(max) = self.backoff_max_s {
            secs = secs.min(max.max(0.0));
        }
        Duration::from_secs_f64(secs)
    }
}

/// Autonomous planner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_hop_budget")]
    pub hop_budget: Option<usize>,
    #[serde(default)]
    pub token_budget: Option<u64>,
    /// Wall-clock budget per run, converted to an absolute deadline at start.
    #[serde(default)]
    pub time_budget_s: Option<f64>,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_repair_attempts")]
    pub repair_attempts: u32,
    #[serde(default = "default_true")]
    pub arg_fill_enabled: bool,
    /// Whether repair and arg-fill LLM calls consume hop budget.
    #[serde(default)]
    pub count_repairs_as_hops: bool,
    #[serde(default = "default_max_observation_chars")]
    pub max_observation_chars: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            hop_budget: default_hop_budget(),
            token_budget: None,
            time_budget_s: None,
            max_parallel: default_max_parallel(),
            repair_attempts: default_repair_attempts(),
            arg_fill_enabled: true,
            count_repairs_as_hops: false,
            max_observation_chars: default_max_observation_chars(),
        }
    }
}

fn default_hop_budget() -> Option<usize> { Some(8) }
fn default_max_parallel() -> usize { 4 }
fn default_repair_attempts() -> u32 { 2 }
fn default_max_observation_chars() -> usize { 4000 }
fn default_true() -> bool { true }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStrategy {
    #[default]
    None,
    Truncation,
    RollingSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    TruncateSummary,
    TruncateOldest,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBudget {
    #[serde(default = "default_full_zone_turns")]
    pub full_zone_turns: usize,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: usize,
    #[serde(default = "default_total_max_tokens")]
    pub total_max_tokens: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            full_zone_turns: default_full_zone_turns(),
            summary_max_tokens: default_summary_max_tokens(),
            total_max_tokens: default_total_max_tokens(),
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

fn default_full_zone_turns() -> usize { 5 }
fn default_summary_max_tokens() -> usize { 1000 }
fn default_total_max_tokens() -> usize { 10_000 }

/// How a memory key is derived when the caller does not pass one.
/// Paths are dotted lookups into the run's tool context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryIsolation {
    #[serde(default = "default_tenant_key")]
    pub tenant_key: String,
    #[serde(default = "default_user_key")]
    pub user_key: String,
    #[serde(default = "default_session_key")]
    pub session_key: String,
    #[serde(default = "default_true")]
    pub require_explicit_key: bool,
}

impl Default for MemoryIsolation {
    fn default() -> Self {
        Self {
            tenant_key: default_tenant_key(),
            user_key: default_user_key(),
            session_key: default_session_key(),
            require_explicit_key: true,
        }
    }
}

fn default_tenant_key() -> String { "tenant_id".into() }
fn default_user_key() -> String { "user_id".into() }
fn default_session_key() -> String { "session_id".into() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortTermMemoryConfig {
    #[serde(default)]
    pub strategy: MemoryStrategy,
    #[serde(default)]
    pub budget: MemoryBudget,
    #[serde(default)]
    pub isolation: MemoryIsolation,
    /// Attach a compact digest of tool usage to each stored turn.
    #[serde(default = "default_true")]
    pub include_trajectory_digest: bool,
    /// Maximum pending turns retained while summarization is degraded.
    #[serde(default = "default_recovery_backlog_limit")]
    pub recovery_backlog_limit: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_base_s")]
    pub retry_backoff_base_s: f64,
    #[serde(default = "default_degraded_retry_interval_s")]
    pub degraded_retry_interval_s: f64,
}

impl Default for ShortTermMemoryConfig {
    fn default() -> Self {
        Self {
            strategy: MemoryStrategy::None,
            budget: MemoryBudget::default(),
            isolation: MemoryIsolation::default(),
            include_trajectory_digest: true,
            recovery_backlog_limit: default_recovery_backlog_limit(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_base_s: default_retry_backoff_base_s(),
            degraded_retry_interval_s: default_degraded_retry_interval_s(),
        }
    }
}

impl ShortTermMemoryConfig {
    pub fn truncation(full_zone_turns: usize) -> Self {
        Self {
            strategy: MemoryStrategy::Truncation,
            budget: MemoryBudget {
                full_zone_turns,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn rolling_summary(full_zone_turns: usize) -> Self {
        Self {
            strategy: MemoryStrategy::RollingSummary,
            budget: MemoryBudget {
                full_zone_turns,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.strategy != MemoryStrategy::None
    }
}

fn default_recovery_backlog_limit() -> usize { 20 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_backoff_base_s() -> f64 { 2.0 }
fn default_degraded_retry_interval_s() -> f64 { 30.0 }

/// SQLite-backed state store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreConfig {
    pub path: String,
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}
