use serde::{Deserialize, Serialize};
use serde_json::Value;

use floe_core::error::{FloeError, Result};
use floe_core::types::PauseReason;

/// One decision returned by the LLM.
///
/// Exactly one shape applies: `pause`, a parallel `plan`, a single tool via
/// `next_node`, or, when none of those are set, a final answer taken from
/// `args.answer` (falling back to `thought`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerAction {
    #[serde(default)]
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<PlanStep>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub node: String,
    #[serde(default)]
    pub args: Value,
}

/// How parallel branch results are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// All successful branch results, in plan order.
    #[default]
    Append,
    /// Only the last successful branch result.
    Replace,
    /// Hold the results for a human before continuing.
    Human,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    #[serde(default)]
    pub strategy: JoinStrategy,
    /// Node that receives the merged results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseSpec {
    pub reason: PauseReason,
    #[serde(default)]
    pub payload: Value,
}

/// Borrowed view of what an action asks for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionKind<'a> {
    Tool { node: &'a str, args: &'a Value },
    Parallel { steps: &'a [PlanStep], join: Option<&'a JoinSpec> },
    Pause(&'a PauseSpec),
    Finish,
}

impl PlannerAction {
    pub fn tool(node: impl Into<String>, args: Value) -> Self {
        Self {
            thought: String::new(),
            next_node: Some(node.into()),
            args,
            plan: None,
            join: None,
            pause: None,
        }
    }

    pub fn finish(answer: impl Into<String>) -> Self {
        Self {
            thought: String::new(),
            next_node: None,
            args: serde_json::json!({"answer": answer.into()}),
            plan: None,
            join: None,
            pause: None,
        }
    }

    pub fn kind(&self) -> ActionKind<'_> {
        if let Some(pause) = &self.pause {
            return ActionKind::Pause(pause);
        }
        if let Some(steps) = self.plan.as_deref().filter(|s| !s.is_empty()) {
            return ActionKind::Parallel {
                steps,
                join: self.join.as_ref(),
            };
        }
        match self.next_node.as_deref() {
            Some(node) => ActionKind::Tool {
                node,
                args: &self.args,
            },
            None => ActionKind::Finish,
        }
    }

    /// Text of a finishing action.
    pub fn answer_text(&self) -> String {
        match self.args.get("answer") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => self.thought.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Structured payload of a finishing action, from `args.payload`.
    pub fn answer_payload(&self) -> Option<Value> {
        self.args.get("payload").filter(|v| !v.is_null()).cloned()
    }

    /// Short label for logs and events.
    pub fn label(&self) -> String {
        match self.kind() {
            ActionKind::Tool { node, .. } => node.to_string(),
            ActionKind::Parallel { steps, .. } => {
                let nodes: Vec<&str> = steps.iter().map(|s| s.node.as_str()).collect();
                format!("plan[{}]", nodes.join(","))
            }
            ActionKind::Pause(_) => "pause".into(),
            ActionKind::Finish => "finish".into(),
        }
    }
}

/// Parse an LLM response into an action.
///
/// Tolerates markdown fences and text around the JSON object. Anything that
/// is not an object of the expected shape is a `MalformedAction`.
pub fn parse_action(content: &str) -> Result<PlannerAction> {
    let value = parse_object(content)?;
    let mut action: PlannerAction =
        serde_json::from_value(value).map_err(|e| FloeError::MalformedAction(e.to_string()))?;

    if action.next_node.as_deref().is_some_and(|n| n.trim().is_empty()) {
        action.next_node = None;
    }
    if action.plan.as_ref().is_some_and(|p| p.is_empty()) {
        return Err(FloeError::MalformedAction("plan has no steps".into()));
    }
    if action.next_node.is_some() && action.plan.is_some() {
        return Err(FloeError::MalformedAction(
            "set either next_node or plan, not both".into(),
        ));
    }
    Ok(action)
}

/// Extract the JSON object embedded in an LLM response.
pub(crate) fn parse_object(content: &str) -> Result<Value> {
    let body = strip_code_fences(content);
    let json = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => return Err(FloeError::MalformedAction("response contains no JSON object".into())),
    };
    serde_json::from_str(json).map_err(|e| FloeError::MalformedAction(format!("invalid JSON: {}", e)))
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // Skip an optional language tag on the fence line.
    let content_start = after.find('\n').map_or(0, |p| p + 1);
    let after = &after[content_start..];
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_tool_action() {
        let action = parse_action(r#"{"thought": "look it up", "next_node": "search", "args": {"query": "rust"}}"#)
            .unwrap();
        assert_eq!(
            action.kind(),
            ActionKind::Tool {
                node: "search",
                args: &json!({"query": "rust"})
            }
        );
        assert_eq!(action.label(), "search");
    }

    #[test]
    fn test_parse_fenced_plan() {
        let content = "Here is my plan:\n```json\n{\"plan\": [{\"node\": \"a\"}, {\"node\": \"b\", \"args\": {\"x\": 1}}], \"join\": {\"strategy\": \"replace\"}}\n```";
        let action = parse_action(content).unwrap();
        match action.kind() {
            ActionKind::Parallel { steps, join } => {
                assert_eq!(steps.len(), 2);
                assert_eq!(join.map(|j| j.strategy), Some(JoinStrategy::Replace));
            }
            other => panic!("expected plan, got {other:?}"),
        }
        assert_eq!(action.label(), "plan[a,b]");
    }

    #[test]
    fn test_finish_answer_sources() {
        let action = parse_action(r#"{"thought": "done", "args": {"answer": "42"}}"#).unwrap();
        assert_eq!(action.kind(), ActionKind::Finish);
        assert_eq!(action.answer_text(), "42");

        let action = parse_action(r#"{"thought": "nothing else to do", "next_node": ""}"#).unwrap();
        assert_eq!(action.kind(), ActionKind::Finish);
        assert_eq!(action.answer_text(), "nothing else to do");
    }

    #[test]
    fn test_pause_takes_precedence() {
        let action = parse_action(
            r#"{"next_node": "deploy", "pause": {"reason": "approval_required", "payload": {"env": "prod"}}}"#,
        )
        .unwrap();
        match action.kind() {
            ActionKind::Pause(spec) => {
                assert_eq!(spec.reason, PauseReason::ApprovalRequired);
                assert_eq!(spec.payload["env"], "prod");
            }
            other => panic!("expected pause, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_actions() {
        for content in [
            "I think we should search",
            "{\"next_node\": ",
            "[1, 2]",
            r#"{"plan": []}"#,
            r#"{"next_node": "a", "plan": [{"node": "b"}]}"#,
            r#"{"plan": [{"args": {}}]}"#,
        ] {
            let err = parse_action(content).unwrap_err();
            assert_eq!(err.kind(), "malformed_action", "content: {content}");
        }
    }
}
