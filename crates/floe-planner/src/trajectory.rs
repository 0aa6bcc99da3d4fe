use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use floe_core::tokens::compact_text;
use floe_core::types::TrajectoryDigest;

use crate::action::{ActionKind, PlannerAction};

/// One executed action and what came of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub action: PlannerAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub hop: usize,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of a planner run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub query: String,
    #[serde(default)]
    pub llm_context: Value,
    #[serde(default)]
    pub tool_context: Value,
    #[serde(default)]
    pub steps: Vec<TrajectoryStep>,
    /// Inputs supplied on each resume, oldest first.
    #[serde(default)]
    pub human_inputs: Vec<Value>,
}

impl Trajectory {
    pub fn new(query: impl Into<String>, llm_context: Value, tool_context: Value) -> Self {
        Self {
            query: query.into(),
            llm_context,
            tool_context,
            steps: Vec::new(),
            human_inputs: Vec::new(),
        }
    }

    pub fn record(&mut self, step: TrajectoryStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last_observation(&self) -> Option<&Value> {
        self.steps.iter().rev().find_map(|s| s.observation.as_ref())
    }

    /// Steps rendered for the planner prompt.
    pub fn to_prompt(&self) -> Value {
        Value::Array(
            self.steps
                .iter()
                .map(|step| {
                    let mut entry = json!({
                        "hop": step.hop,
                        "action": step.action,
                    });
                    if let Some(observation) = &step.observation {
                        entry["observation"] = observation.clone();
                    }
                    if let Some(error) = &step.error {
                        entry["error"] = Value::String(error.clone());
                    }
                    entry
                })
                .collect(),
        )
    }

    /// Compact account of the run, stored with the conversation turn.
    pub fn digest(&self, max_chars: usize) -> TrajectoryDigest {
        let mut tools_invoked = Vec::new();
        for step in &self.steps {
            match step.action.kind() {
                ActionKind::Tool { node, .. } => tools_invoked.push(node.to_string()),
                ActionKind::Parallel { steps, .. } => {
                    tools_invoked.extend(steps.iter().map(|s| s.node.clone()));
                }
                ActionKind::Pause(_) | ActionKind::Finish => {}
            }
        }
        tools_invoked.dedup();

        let observations: Vec<String> = self
            .steps
            .iter()
            .filter_map(|s| s.observation.as_ref())
            .map(|o| match o {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        let thoughts: Vec<&str> = self
            .steps
            .iter()
            .map(|s| s.action.thought.as_str())
            .filter(|t| !t.is_empty())
            .collect();

        TrajectoryDigest {
            tools_invoked,
            observations_summary: compact_text(&observations.join("\n"), max_chars),
            reasoning_summary: (!thoughts.is_empty()).then(|| compact_text(&thoughts.join(" "), max_chars)),
            failed_steps: self.steps.iter().filter(|s| s.error.is_some()).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(action: PlannerAction, observation: Option<Value>, error: Option<&str>, hop: usize) -> TrajectoryStep {
        TrajectoryStep {
            action,
            observation,
            error: error.map(str::to_string),
            latency_ms: 5,
            hop,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_digest_counts_tools_and_failures() {
        let mut trajectory = Trajectory::new("metrics?", Value::Null, Value::Null);
        let mut search = PlannerAction::tool("search", json!({"q": "metrics"}));
        search.thought = "find docs".into();
        trajectory.record(step(search, Some(json!("2 docs")), None, 1));
        trajectory.record(step(PlannerAction::tool("fetch", json!({})), None, Some("timeout"), 2));

        let digest = trajectory.digest(200);
        assert_eq!(digest.tools_invoked, vec!["search", "fetch"]);
        assert_eq!(digest.observations_summary, "2 docs");
        assert_eq!(digest.reasoning_summary.as_deref(), Some("find docs"));
        assert_eq!(digest.failed_steps, 1);
        assert_eq!(trajectory.last_observation(), Some(&json!("2 docs")));
    }

    #[test]
    fn test_prompt_rendering() {
        let mut trajectory = Trajectory::new("q", Value::Null, Value::Null);
        trajectory.record(step(PlannerAction::tool("fetch", json!({})), None, Some("boom"), 1));
        let rendered = trajectory.to_prompt();
        assert_eq!(rendered[0]["action"]["next_node"], "fetch");
        assert_eq!(rendered[0]["error"], "boom");
        assert!(rendered[0].get("observation").is_none());
    }
}
