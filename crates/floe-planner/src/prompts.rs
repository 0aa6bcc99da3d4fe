use serde_json::{json, Value};

use floe_core::types::{PromptMessage, WorkingMemory};

use crate::catalog::{ArgsError, ToolCatalog};
use crate::trajectory::Trajectory;

const SYSTEM_PREAMBLE: &str = "You are the planner of an autonomous agent. \
At each step choose exactly one action and reply with a single JSON object.

Actions:
- call one tool: {\"thought\": \"...\", \"next_node\": \"<tool>\", \"args\": {...}}
- run tools in parallel: {\"thought\": \"...\", \"plan\": [{\"node\": \"<tool>\", \"args\": {...}}], \"join\": {\"strategy\": \"append|replace|human\", \"node\": \"<optional tool>\"}}
- ask a human: {\"thought\": \"...\", \"pause\": {\"reason\": \"approval_required|await_input|external_event|constraints_conflict\", \"payload\": {...}}}
- finish: {\"thought\": \"...\", \"args\": {\"answer\": \"...\"}}

Arguments must satisfy the tool's args_schema.";

/// JSON schema of a planner action, passed to the LLM client.
pub fn action_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "thought": {"type": "string"},
            "next_node": {"type": ["string", "null"]},
            "args": {"type": ["object", "null"]},
            "plan": {
                "type": ["array", "null"],
                "items": {
                    "type": "object",
                    "properties": {"node": {"type": "string"}, "args": {"type": "object"}},
                    "required": ["node"],
                },
            },
            "join": {"type": ["object", "null"]},
            "pause": {"type": ["object", "null"]},
        },
    })
}

pub fn system_prompt(catalog: &ToolCatalog, extra: Option<&str>) -> String {
    let tools = serde_json::to_string_pretty(&catalog.describe()).unwrap_or_default();
    let mut prompt = format!("{}\n\nTools:\n{}", SYSTEM_PREAMBLE, tools);
    if let Some(extra) = extra {
        prompt.push_str("\n\n");
        prompt.push_str(extra);
    }
    prompt
}

/// User message for one THINK step.
pub fn step_prompt(wm: &WorkingMemory, trajectory: &Trajectory, memory: &Value) -> String {
    let mut payload = json!({
        "query": wm.query,
        "hops_used": wm.hops,
        "steps": trajectory.to_prompt(),
    });
    if let Some(budget) = wm.budget_hops {
        payload["hop_budget"] = json!(budget);
    }
    if !is_empty(&trajectory.llm_context) {
        payload["context"] = trajectory.llm_context.clone();
    }
    if !is_empty(memory) {
        payload["conversation_memory"] = memory.clone();
    }
    if !trajectory.human_inputs.is_empty() {
        payload["human_inputs"] = Value::Array(trajectory.human_inputs.clone());
    }
    serde_json::to_string_pretty(&payload).unwrap_or_default()
}

pub fn initial_messages(system: &str, wm: &WorkingMemory, trajectory: &Trajectory, memory: &Value) -> Vec<PromptMessage> {
    vec![
        PromptMessage::system(system),
        PromptMessage::user(step_prompt(wm, trajectory, memory)),
    ]
}

pub fn repair_prompt(problem: &str) -> String {
    format!(
        "Your previous reply could not be used: {}\n\
         Reply again with a single JSON object describing one valid action.",
        problem
    )
}

/// Narrow prompt asking only for the missing or invalid argument fields.
pub fn arg_fill_prompt(error: &ArgsError, args: &Value, schema: Option<&Value>) -> String {
    let fields = if error.missing.is_empty() {
        "the invalid fields".to_string()
    } else {
        error.missing.join(", ")
    };
    let mut text = format!(
        "The tool '{}' is the right choice, but its arguments are incomplete ({}).\n\
         Current args: {}\n",
        error.node, error.message, args
    );
    if let Some(schema) = schema {
        text.push_str(&format!("Args schema: {}\n", schema));
    }
    text.push_str(&format!(
        "Reply with a JSON object containing only these fields: {}.",
        fields
    ));
    text
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
