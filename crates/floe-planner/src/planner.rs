use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use floe_core::config::PlannerConfig;
use floe_core::error::{FloeError, Result};
use floe_core::event::{EventBus, FlowEvent};
use floe_core::tokens::{compact_text, estimate_tokens};
use floe_core::traits::JsonLlmClient;
use floe_core::types::{
    now_s, ConversationTurn, ExhaustionReason, FinalAnswer, FinishReason, Headers, MemoryKey, Message,
    PauseReason, PauseRequest, PromptMessage, TraceId, WorkingMemory,
};
use floe_memory::ShortTermMemory;
use floe_runtime::{Context, NodeOutput, TraceRegistry};

use crate::action::{parse_action, parse_object, ActionKind, JoinSpec, JoinStrategy, PlanStep, PlannerAction};
use crate::catalog::{ArgsError, ToolCatalog, ToolPolicy};
use crate::pause::{PauseStore, PlannerPause, PlannerSnapshot};
use crate::prompts;
use crate::trajectory::{Trajectory, TrajectoryStep};

/// Input of a planner run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub query: String,
    /// Caller data available to tools and to memory key resolution.
    pub tool_context: Value,
    /// Extra context shown to the LLM.
    pub llm_context: Value,
    pub memory_key: Option<MemoryKey>,
    pub headers: Headers,
    pub trace_id: Option<TraceId>,
    /// Absolute unix deadline in seconds.
    pub deadline_s: Option<f64>,
}

impl RunRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tool_context: Value::Object(Default::default()),
            llm_context: Value::Object(Default::default()),
            memory_key: None,
            headers: Headers::new("default"),
            trace_id: None,
            deadline_s: None,
        }
    }

    pub fn with_tool_context(mut self, tool_context: Value) -> Self {
        self.tool_context = tool_context;
        self
    }

    pub fn with_llm_context(mut self, llm_context: Value) -> Self {
        self.llm_context = llm_context;
        self
    }

    pub fn with_memory_key(mut self, key: MemoryKey) -> Self {
        self.memory_key = Some(key);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    pub fn with_deadline(mut self, deadline_s: f64) -> Self {
        self.deadline_s = Some(deadline_s);
        self
    }
}

/// How a run (or resumed run) ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannerOutcome {
    Finish(FinalAnswer),
    Pause(PlannerPause),
}

impl PlannerOutcome {
    pub fn answer(&self) -> Option<&FinalAnswer> {
        match self {
            Self::Finish(answer) => Some(answer),
            Self::Pause(_) => None,
        }
    }

    pub fn pause(&self) -> Option<&PlannerPause> {
        match self {
            Self::Pause(pause) => Some(pause),
            Self::Finish(_) => None,
        }
    }
}

/// Live state of one run. Only the serializable part survives a pause.
struct RunState {
    trace_id: TraceId,
    headers: Headers,
    wm: WorkingMemory,
    trajectory: Trajectory,
    memory_key: Option<MemoryKey>,
    memory_context: Value,
    deadline_s: Option<f64>,
    cancel: CancellationToken,
}

enum Decision {
    Act(PlannerAction),
    Clarify(String),
    Exhausted(ExhaustionReason),
}

/// Why a chosen action cannot run as given.
enum Invalid {
    UnknownTool { name: String, available: String },
    Args(ArgsError),
}

impl fmt::Display for Invalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTool { name, available } => {
                write!(f, "unknown tool '{}'; available tools: {}", name, available)
            }
            Self::Args(err) => write!(f, "{}", err),
        }
    }
}

/// Autonomous think/act/observe loop over a tool catalog.
pub struct Planner {
    llm: Arc<dyn JsonLlmClient>,
    catalog: ToolCatalog,
    config: PlannerConfig,
    events: Arc<EventBus>,
    registry: Arc<TraceRegistry>,
    memory: Option<Arc<ShortTermMemory>>,
    pauses: PauseStore,
    instructions: Option<String>,
}

impl Planner {
    pub fn new(llm: Arc<dyn JsonLlmClient>, catalog: ToolCatalog, config: PlannerConfig) -> Self {
        Self {
            llm,
            catalog,
            config,
            events: Arc::new(EventBus::default()),
            registry: Arc::new(TraceRegistry::new(CancellationToken::new())),
            memory: None,
            pauses: PauseStore::new(),
            instructions: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn with_memory(mut self, memory: Arc<ShortTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_pause_store(mut self, pauses: PauseStore) -> Self {
        self.pauses = pauses;
        self
    }

    /// Restrict the visible tools.
    pub fn with_policy(mut self, policy: &ToolPolicy) -> Self {
        self.catalog = self.catalog.filtered(policy);
        self
    }

    /// Extra text appended to the system prompt.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub async fn pending_pauses(&self) -> Vec<String> {
        self.pauses.pending_tokens().await
    }

    /// Start a run.
    pub async fn run(&self, request: RunRequest) -> Result<PlannerOutcome> {
        let trace_id = request.trace_id.unwrap_or_default();
        let memory_key = self
            .memory
            .as_ref()
            .and_then(|m| m.resolve_key(request.memory_key.as_ref(), &request.tool_context));
        let memory_context = match (&self.memory, &memory_key) {
            (Some(memory), Some(key)) => memory.get_llm_context(key).await?,
            _ => Value::Null,
        };

        let mut wm = WorkingMemory::new(request.query.clone());
        wm.budget_hops = self.config.hop_budget;
        wm.budget_tokens = self.config.token_budget;

        let time_deadline = self.config.time_budget_s.map(|s| now_s() + s);
        let deadline_s = match (request.deadline_s, time_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        info!(
            trace_id = %trace_id,
            tools = self.catalog.len(),
            memory = memory_key.is_some(),
            "Planner run started"
        );
        let state = RunState {
            trace_id,
            headers: request.headers,
            wm,
            trajectory: Trajectory::new(request.query, request.llm_context, request.tool_context),
            memory_key,
            memory_context,
            deadline_s,
            cancel: CancellationToken::new(),
        };
        self.drive(state).await
    }

    /// Continue a paused run. The token is consumed.
    pub async fn resume(&self, token: &str, human_input: Value) -> Result<PlannerOutcome> {
        let snapshot = self.pauses.take(token).await?;
        let mut trajectory = snapshot.trajectory;
        trajectory.human_inputs.push(human_input);
        info!(trace_id = %snapshot.trace_id, hops = snapshot.wm.hops, "Planner run resumed");

        let state = RunState {
            trace_id: snapshot.trace_id,
            headers: snapshot.headers,
            wm: snapshot.wm,
            trajectory,
            memory_key: snapshot.memory_key,
            memory_context: snapshot.memory_context,
            deadline_s: snapshot.deadline_s,
            cancel: CancellationToken::new(),
        };
        self.drive(state).await
    }

    /// Cancel the run carrying `trace_id`, including tools and playbooks it
    /// started. Returns `false` if no such run is active.
    pub async fn cancel(&self, trace_id: &TraceId) -> bool {
        self.registry.cancel(trace_id, &self.events).await
    }

    async fn drive(&self, mut state: RunState) -> Result<PlannerOutcome> {
        let guard = self.registry.enter(&state.trace_id).ok_or(FloeError::Cancelled)?;
        state.cancel = guard.token().clone();
        let result = self.run_loop(&mut state).await;
        if matches!(result, Err(FloeError::Cancelled)) {
            warn!(trace_id = %state.trace_id, hops = state.wm.hops, "Planner run cancelled");
        }
        drop(guard);
        result
    }

    async fn run_loop(&self, state: &mut RunState) -> Result<PlannerOutcome> {
        let system = prompts::system_prompt(&self.catalog, self.instructions.as_deref());
        loop {
            if state.cancel.is_cancelled() {
                return Err(FloeError::Cancelled);
            }
            // THINK only when every budget still allows another action.
            if let Some(reason) = self.exhaustion(state) {
                return self.finish(state, self.exhausted_answer(state, reason)).await;
            }

            let cancel = state.cancel.clone();
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FloeError::Cancelled),
                decision = self.decide(&system, state) => decision?,
            };
            let action = match decision {
                Decision::Act(action) => action,
                Decision::Clarify(text) => {
                    return self.finish(state, FinalAnswer::clarification(text)).await;
                }
                Decision::Exhausted(reason) => {
                    return self.finish(state, self.exhausted_answer(state, reason)).await;
                }
            };

            let pause = match action.kind() {
                ActionKind::Finish => {
                    let mut answer = FinalAnswer::complete(action.answer_text());
                    if let Some(payload) = action.answer_payload() {
                        answer = answer.with_payload(payload);
                    }
                    return self.finish(state, answer).await;
                }
                ActionKind::Pause(spec) => {
                    let request = PauseRequest {
                        reason: spec.reason,
                        payload: spec.payload.clone(),
                    };
                    let hop = state.wm.hops;
                    self.record(state, action.clone(), None, None, 0, hop);
                    Some(request)
                }
                ActionKind::Tool { node, args } => {
                    let (node, args) = (node.to_string(), args.clone());
                    self.act_tool(state, &action, &node, args).await?
                }
                ActionKind::Parallel { steps, join } => {
                    let (steps, join) = (steps.to_vec(), join.cloned());
                    self.act_parallel(state, &action, &steps, join.as_ref()).await?
                }
            };

            if let Some(request) = pause {
                return self.pause(state, request).await;
            }
        }
    }

    fn exhaustion(&self, state: &RunState) -> Option<ExhaustionReason> {
        state.wm.exhaustion().or_else(|| {
            state
                .deadline_s
                .filter(|deadline| now_s() >= *deadline)
                .map(|_| ExhaustionReason::Deadline)
        })
    }

    fn exhausted_answer(&self, state: &RunState, reason: ExhaustionReason) -> FinalAnswer {
        let answer = FinalAnswer::exhausted(reason);
        match state.trajectory.last_observation() {
            Some(observation) => answer.with_payload(json!({"last_observation": observation})),
            None => answer,
        }
    }

    /// THINK and VALIDATE: ask for an action until one is usable, using at
    /// most one arg-fill turn and `repair_attempts` repair prompts.
    async fn decide(&self, system: &str, state: &mut RunState) -> Result<Decision> {
        let mut messages = prompts::initial_messages(system, &state.wm, &state.trajectory, &state.memory_context);
        let mut content = self.call_llm(state, messages.clone(), Some(prompts::action_schema())).await?;
        let mut repairs_left = self.config.repair_attempts;
        let mut arg_fill_used = !self.config.arg_fill_enabled;

        loop {
            let problem = match parse_action(&content) {
                Err(e) => e.to_string(),
                Ok(mut action) => match self.validate(&action) {
                    Ok(()) => return Ok(Decision::Act(action)),
                    Err(Invalid::Args(err))
                        if !arg_fill_used && matches!(action.kind(), ActionKind::Tool { .. }) =>
                    {
                        arg_fill_used = true;
                        if let Some(reason) = self.charge_repair(state) {
                            return Ok(Decision::Exhausted(reason));
                        }
                        if self.arg_fill(state, &mut action, &err).await? {
                            return Ok(Decision::Act(action));
                        }
                        err.to_string()
                    }
                    Err(invalid) => invalid.to_string(),
                },
            };

            if repairs_left == 0 {
                warn!(trace_id = %state.trace_id, problem = %problem, "No usable action after repairs");
                return Ok(Decision::Clarify(format!(
                    "I could not determine a valid next step: {}. Could you clarify the request?",
                    problem
                )));
            }
            repairs_left -= 1;
            if let Some(reason) = self.charge_repair(state) {
                return Ok(Decision::Exhausted(reason));
            }
            warn!(trace_id = %state.trace_id, problem = %problem, repairs_left, "Planner action rejected, requesting repair");
            messages.push(PromptMessage::assistant(content));
            messages.push(PromptMessage::user(prompts::repair_prompt(&problem)));
            content = self.call_llm(state, messages.clone(), Some(prompts::action_schema())).await?;
        }
    }

    /// Count a repair or arg-fill turn as a hop when configured to, and
    /// report exhaustion if that used up the budget.
    fn charge_repair(&self, state: &mut RunState) -> Option<ExhaustionReason> {
        if !self.config.count_repairs_as_hops {
            return None;
        }
        state.wm.hops += 1;
        state.wm.exhaustion()
    }

    fn validate(&self, action: &PlannerAction) -> std::result::Result<(), Invalid> {
        match action.kind() {
            ActionKind::Finish | ActionKind::Pause(_) => Ok(()),
            ActionKind::Tool { node, args } => self.validate_call(node, args),
            ActionKind::Parallel { steps, join } => {
                for step in steps {
                    self.validate_call(&step.node, &step.args)?;
                }
                match join.and_then(|j| j.node.as_deref()) {
                    Some(node) if !self.catalog.contains(node) => Err(self.unknown_tool(node)),
                    _ => Ok(()),
                }
            }
        }
    }

    fn validate_call(&self, node: &str, args: &Value) -> std::result::Result<(), Invalid> {
        let spec = self.catalog.get(node).ok_or_else(|| self.unknown_tool(node))?;
        spec.validate_args(args).map_err(Invalid::Args)
    }

    fn unknown_tool(&self, name: &str) -> Invalid {
        Invalid::UnknownTool {
            name: name.to_string(),
            available: self.catalog.names().join(", "),
        }
    }

    /// Ask only for the missing fields, keeping the chosen tool. Returns
    /// whether the merged args now validate.
    async fn arg_fill(&self, state: &mut RunState, action: &mut PlannerAction, err: &ArgsError) -> Result<bool> {
        let Some(spec) = self.catalog.get(&err.node) else {
            return Ok(false);
        };
        debug!(trace_id = %state.trace_id, node = %err.node, missing = ?err.missing, "Requesting missing args");
        let messages = vec![
            PromptMessage::system("You fill in missing tool arguments. Reply with a JSON object only."),
            PromptMessage::user(prompts::arg_fill_prompt(err, &action.args, spec.args_schema())),
        ];
        let content = self.call_llm(state, messages, None).await?;
        let Ok(Value::Object(fields)) = parse_object(&content) else {
            return Ok(false);
        };

        let mut args = action.args.as_object().cloned().unwrap_or_default();
        args.extend(fields);
        let args = Value::Object(args);
        if spec.validate_args(&args).is_err() {
            return Ok(false);
        }
        info!(trace_id = %state.trace_id, node = %err.node, "Arguments completed by arg-fill");
        action.args = args;
        Ok(true)
    }

    async fn call_llm(
        &self,
        state: &mut RunState,
        messages: Vec<PromptMessage>,
        schema: Option<Value>,
    ) -> Result<String> {
        let prompt_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        let response = self.llm.generate(messages, schema).await?;
        let used = match response.usage {
            Some(usage) => usage.total(),
            None => (prompt_tokens + estimate_tokens(&response.content)) as u64,
        };
        state.wm.tokens_used += used;
        debug!(trace_id = %state.trace_id, tokens = used, total = state.wm.tokens_used, "LLM call");
        Ok(response.content)
    }

    /// Run one catalog node for this trace and return its output payload.
    async fn invoke_tool(&self, state: &RunState, node: &str, args: Value) -> Result<Value> {
        let spec = self
            .catalog
            .get(node)
            .ok_or_else(|| FloeError::UnknownNode(node.to_string()))?;
        let mut message = Message::data(args, state.headers.clone()).with_trace(state.trace_id.clone());
        if let Some(deadline) = state.deadline_s {
            message = message.with_deadline(deadline);
        }
        let ctx = Context::detached_with(node, Arc::clone(&self.events), Arc::clone(&self.registry));
        let output = tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return Err(FloeError::Cancelled),
            output = spec.node().invoke(message, &ctx) => output?,
        };
        Ok(match output {
            NodeOutput::Emit(message) | NodeOutput::Route { message, .. } => message.payload.to_value(),
            NodeOutput::Skip | NodeOutput::Stop => Value::Null,
        })
    }

    /// ACT + OBSERVE for a single tool.
    async fn act_tool(
        &self,
        state: &mut RunState,
        action: &PlannerAction,
        node: &str,
        args: Value,
    ) -> Result<Option<PauseRequest>> {
        let hop = state.wm.hops + 1;
        let started = Instant::now();
        let result = self.invoke_tool(state, node, args).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        state.wm.hops = hop;

        match result {
            Ok(observation) => {
                let observation = self.compact(observation);
                state.wm.facts.push(observation.clone());
                self.record(state, action.clone(), Some(observation), None, latency_ms, hop);
                Ok(None)
            }
            Err(FloeError::PauseRequested(request)) => {
                let observation = json!({"pause": request.reason});
                self.record(state, action.clone(), Some(observation), None, latency_ms, hop);
                Ok(Some(request))
            }
            Err(FloeError::Cancelled) => Err(FloeError::Cancelled),
            Err(e) => {
                warn!(trace_id = %state.trace_id, node, error = %e, "Tool failed");
                self.record(state, action.clone(), None, Some(format!("{}: {}", e.kind(), e)), latency_ms, hop);
                Ok(None)
            }
        }
    }

    /// ACT + OBSERVE for a parallel plan. Branches run concurrently, at most
    /// `max_parallel` at a time; results are merged by the join strategy.
    async fn act_parallel(
        &self,
        state: &mut RunState,
        action: &PlannerAction,
        steps: &[PlanStep],
        join: Option<&JoinSpec>,
    ) -> Result<Option<PauseRequest>> {
        let hop = state.wm.hops + 1;
        let started = Instant::now();
        let semaphore = Semaphore::new(self.config.max_parallel.max(1));

        let branches = {
            let state = &*state;
            let semaphore = &semaphore;
            join_all(steps.iter().map(|step| async move {
                let result = match semaphore.acquire().await {
                    Ok(_permit) => self.invoke_tool(state, &step.node, step.args.clone()).await,
                    Err(_) => Err(FloeError::Cancelled),
                };
                (step.node.as_str(), result)
            }))
            .await
        };

        let mut results = Vec::new();
        let mut reports = Vec::new();
        let mut pause = None;
        let mut failures = 0;
        for (node, result) in branches {
            match result {
                Ok(observation) => {
                    let observation = self.compact(observation);
                    reports.push(json!({"node": node, "observation": observation}));
                    results.push(observation);
                }
                Err(FloeError::Cancelled) => return Err(FloeError::Cancelled),
                Err(FloeError::PauseRequested(request)) => {
                    reports.push(json!({"node": node, "pause": request.reason}));
                    pause.get_or_insert(request);
                }
                Err(e) => {
                    failures += 1;
                    warn!(trace_id = %state.trace_id, node, error = %e, "Parallel branch failed");
                    reports.push(json!({"node": node, "error": format!("{}: {}", e.kind(), e)}));
                }
            }
        }

        let strategy = join.map(|j| j.strategy).unwrap_or_default();
        let merged = match strategy {
            JoinStrategy::Append | JoinStrategy::Human => Value::Array(results),
            JoinStrategy::Replace => results.pop().unwrap_or(Value::Null),
        };
        let mut observation = json!({"branches": reports, "results": merged});
        let mut error = (failures == steps.len()).then(|| "all branches failed".to_string());

        if pause.is_none() {
            if strategy == JoinStrategy::Human {
                pause = Some(PauseRequest {
                    reason: PauseReason::ApprovalRequired,
                    payload: json!({"join": "human", "results": observation["results"].clone()}),
                });
            } else if let Some(join_node) = join.and_then(|j| j.node.as_deref()) {
                let input = json!({"results": observation["results"].clone(), "branches": observation["branches"].clone()});
                match self.invoke_tool(state, join_node, input).await {
                    Ok(joined) => observation["joined"] = self.compact(joined),
                    Err(FloeError::Cancelled) => return Err(FloeError::Cancelled),
                    Err(FloeError::PauseRequested(request)) => pause = Some(request),
                    Err(e) => error = Some(format!("join node {} failed: {}", join_node, e)),
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        state.wm.hops = hop;
        state.wm.facts.push(observation.clone());
        debug!(trace_id = %state.trace_id, branches = steps.len(), failures, ?strategy, "Parallel plan joined");
        self.record(state, action.clone(), Some(observation), error, latency_ms, hop);
        Ok(pause)
    }

    fn compact(&self, observation: Value) -> Value {
        let max = self.config.max_observation_chars;
        let text = match &observation {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if text.chars().count() > max {
            Value::String(compact_text(&text, max))
        } else {
            observation
        }
    }

    fn record(
        &self,
        state: &mut RunState,
        action: PlannerAction,
        observation: Option<Value>,
        error: Option<String>,
        latency_ms: u64,
        hop: usize,
    ) {
        self.events.publish(FlowEvent::PlannerStep {
            trace_id: state.trace_id.clone(),
            hop,
            action: action.label(),
            latency_ms,
            error: error.clone(),
        });
        debug!(trace_id = %state.trace_id, hop, action = %action.label(), latency_ms, failed = error.is_some(), "Planner step");
        state.trajectory.record(TrajectoryStep {
            action,
            observation,
            error,
            latency_ms,
            hop,
            timestamp: Utc::now(),
        });
    }

    async fn pause(&self, state: &mut RunState, request: PauseRequest) -> Result<PlannerOutcome> {
        let snapshot = PlannerSnapshot {
            trace_id: state.trace_id.clone(),
            headers: state.headers.clone(),
            wm: state.wm.clone(),
            trajectory: state.trajectory.clone(),
            memory_key: state.memory_key.clone(),
            memory_context: state.memory_context.clone(),
            deadline_s: state.deadline_s,
            reason: request.reason,
            payload: request.payload.clone(),
            created_at: Utc::now(),
        };
        let token = self.pauses.put(snapshot).await?;
        self.events.publish(FlowEvent::PlannerPause {
            trace_id: state.trace_id.clone(),
            token: token.clone(),
            reason: request.reason,
        });
        info!(trace_id = %state.trace_id, reason = %request.reason, hops = state.wm.hops, "Planner paused");
        Ok(PlannerOutcome::Pause(PlannerPause {
            token,
            trace_id: state.trace_id.clone(),
            reason: request.reason,
            payload: request.payload,
        }))
    }

    async fn finish(&self, state: &mut RunState, answer: FinalAnswer) -> Result<PlannerOutcome> {
        let answer = answer
            .with_metadata("hops", json!(state.wm.hops))
            .with_metadata("tokens_used", json!(state.wm.tokens_used))
            .with_metadata("steps", json!(state.trajectory.len()));

        if let (Some(memory), Some(key)) = (&self.memory, &state.memory_key) {
            let digest = state.trajectory.digest(self.config.max_observation_chars);
            let turn = ConversationTurn::new(state.trajectory.query.clone(), answer.text.clone()).with_digest(digest);
            memory.add_turn(key, turn).await?;
        }

        let reason = finish_label(&answer.reason);
        self.events.publish(FlowEvent::PlannerFinish {
            trace_id: state.trace_id.clone(),
            reason: reason.clone(),
            hops: state.wm.hops,
            tokens_used: state.wm.tokens_used,
        });
        info!(
            trace_id = %state.trace_id,
            reason = %reason,
            hops = state.wm.hops,
            tokens_used = state.wm.tokens_used,
            "Planner run finished"
        );
        Ok(PlannerOutcome::Finish(answer))
    }
}

fn finish_label(reason: &FinishReason) -> String {
    match reason {
        FinishReason::AnswerComplete => "answer_complete".into(),
        FinishReason::Clarification => "clarification".into(),
        FinishReason::Exhausted { reason } => match reason {
            ExhaustionReason::HopBudget => "hop_budget".into(),
            ExhaustionReason::TokenBudget => "token_budget".into(),
            ExhaustionReason::Deadline => "deadline".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_labels() {
        assert_eq!(finish_label(&FinishReason::AnswerComplete), "answer_complete");
        assert_eq!(
            finish_label(&FinishReason::Exhausted {
                reason: ExhaustionReason::TokenBudget
            }),
            "token_budget"
        );
    }

    #[test]
    fn test_run_request_defaults() {
        let request = RunRequest::new("q").with_memory_key(MemoryKey::new("t", "u", "s"));
        assert_eq!(request.tool_context, json!({}));
        assert_eq!(request.headers.tenant, "default");
        assert!(request.trace_id.is_none());
    }
}
