use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier grouping every message of one causal request, including
/// messages produced inside nested playbooks.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing and tenancy metadata, propagated verbatim downstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Headers {
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// Current wall-clock time as fractional unix seconds.
pub fn now_s() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Content carried by a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    /// Opaque application data.
    Data(serde_json::Value),
    /// Controller-loop state travelling over a self edge.
    Working(WorkingMemory),
    /// Terminal answer.
    Final(FinalAnswer),
    /// Ordered partial output for streaming consumers.
    Chunk(StreamChunk),
    /// Node failure surfaced as data.
    Error(FlowErrorPayload),
}

impl Payload {
    /// Render the payload as JSON for validation and observation.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Data(v) => v.clone(),
            Self::Working(wm) => serde_json::to_value(wm).unwrap_or_default(),
            Self::Final(answer) => serde_json::to_value(answer).unwrap_or_default(),
            Self::Chunk(chunk) => serde_json::to_value(chunk).unwrap_or_default(),
            Self::Error(err) => serde_json::to_value(err).unwrap_or_default(),
        }
    }

    pub fn as_data(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Data(v) => Some(v),
            _ => None,
        }
    }
}

/// Envelope flowing across edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
    pub headers: Headers,
    pub trace_id: TraceId,
    /// Absolute wall-clock deadline in unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_s: Option<f64>,
    /// Side-channel data; never interpreted by the runtime.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message with a fresh trace id.
    pub fn new(payload: Payload, headers: Headers) -> Self {
        Self {
            payload,
            headers,
            trace_id: TraceId::new(),
            deadline_s: None,
            meta: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create a data message with a fresh trace id.
    pub fn data(value: serde_json::Value, headers: Headers) -> Self {
        Self::new(Payload::Data(value), headers)
    }

    /// Use an existing trace id instead of the generated one.
    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_deadline(mut self, deadline_s: f64) -> Self {
        self.deadline_s = Some(deadline_s);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Derive a downstream message carrying a new payload. Trace, headers,
    /// deadline and meta are preserved.
    pub fn with_payload(&self, payload: Payload) -> Self {
        Self {
            payload,
            headers: self.headers.clone(),
            trace_id: self.trace_id.clone(),
            deadline_s: self.deadline_s,
            meta: self.meta.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(&self, value: serde_json::Value) -> Self {
        self.with_payload(Payload::Data(value))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline_s.is_some_and(|d| now_s() >= d)
    }

    /// The structured error carried by this message, if it is an error payload.
    pub fn flow_error(&self) -> Option<&FlowErrorPayload> {
        match &self.payload {
            Payload::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn final_answer(&self) -> Option<&FinalAnswer> {
        match &self.payload {
            Payload::Final(answer) => Some(answer),
            _ => None,
        }
    }
}

/// One ordered piece of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: String,
    pub seq: u64,
    pub text: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, serde_json::Value>,
}

/// Node failure wrapped as a terminal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowErrorPayload {
    pub code: String,
    pub node_name: String,
    pub trace_id: TraceId,
    pub message: String,
    pub attempts: u32,
}

/// Why a run stopped without a natural answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionReason {
    HopBudget,
    TokenBudget,
    Deadline,
}

impl ExhaustionReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::HopBudget => "Hop budget exhausted",
            Self::TokenBudget => "Token budget exhausted",
            Self::Deadline => "Deadline exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FinishReason {
    AnswerComplete,
    /// The run could not proceed without more information from the user.
    Clarification,
    Exhausted { reason: ExhaustionReason },
}

/// Terminal answer of a controller loop or planner run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,
    pub reason: FinishReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl FinalAnswer {
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reason: FinishReason::AnswerComplete,
            payload: None,
            metadata: HashMap::new(),
        }
    }

    pub fn clarification(text: impl Into<String>) -> Self {
        Self {
            reason: FinishReason::Clarification,
            ..Self::complete(text)
        }
    }

    pub fn exhausted(reason: ExhaustionReason) -> Self {
        Self {
            reason: FinishReason::Exhausted { reason },
            ..Self::complete(reason.describe())
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn exhaustion(&self) -> Option<ExhaustionReason> {
        match self.reason {
            FinishReason::Exhausted { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Hop budget applied when a working memory does not set its own.
pub const DEFAULT_BUDGET_HOPS: usize = 8;

/// Per-run working memory: budgets and accumulated facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub query: String,
    #[serde(default)]
    pub facts: Vec<serde_json::Value>,
    #[serde(default)]
    pub hops: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_hops: Option<usize>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl WorkingMemory {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            facts: Vec::new(),
            hops: 0,
            budget_hops: Some(DEFAULT_BUDGET_HOPS),
            tokens_used: 0,
            budget_tokens: None,
            confidence: None,
        }
    }

    pub fn with_budget_hops(mut self, hops: usize) -> Self {
        self.budget_hops = Some(hops);
        self
    }

    pub fn with_budget_tokens(mut self, tokens: u64) -> Self {
        self.budget_tokens = Some(tokens);
        self
    }

    /// Check hop and token budgets before issuing the next action.
    pub fn exhaustion(&self) -> Option<ExhaustionReason> {
        if self.budget_hops.is_some_and(|b| self.hops >= b) {
            return Some(ExhaustionReason::HopBudget);
        }
        if self.budget_tokens.is_some_and(|b| self.tokens_used >= b) {
            return Some(ExhaustionReason::TokenBudget);
        }
        None
    }
}

/// Why a run asked for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    ApprovalRequired,
    AwaitInput,
    ExternalEvent,
    ConstraintsConflict,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ApprovalRequired => "approval_required",
            Self::AwaitInput => "await_input",
            Self::ExternalEvent => "external_event",
            Self::ConstraintsConflict => "constraints_conflict",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseRequest {
    pub reason: PauseReason,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Role in an LLM prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single prompt message sent to the structured LLM client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Raw structured response. The content is expected to be JSON but is not
/// trusted; callers parse and validate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

/// Composite key isolating short-term memory.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct MemoryKey {
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
}

impl MemoryKey {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Stable string form used for store keys and logs. `%` and `:` inside a
    /// part are percent-escaped, so distinct keys never share a composite.
    pub fn composite(&self) -> String {
        format!(
            "{}:{}:{}",
            escape_key_part(&self.tenant_id),
            escape_key_part(&self.user_id),
            escape_key_part(&self.session_id)
        )
    }
}

fn escape_key_part(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A")
}

impl fmt::Display for MemoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.composite())
    }
}

/// Compressed account of the tools used during one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryDigest {
    pub tools_invoked: Vec<String>,
    pub observations_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    #[serde(default)]
    pub failed_steps: usize,
}

/// One completed user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_message: String,
    pub assistant_response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trajectory_digest: Option<TrajectoryDigest>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifacts_shown: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts_hidden_refs: Vec<String>,
    pub ts: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(user_message: impl Into<String>, assistant_response: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            assistant_response: assistant_response.into(),
            trajectory_digest: None,
            artifacts_shown: HashMap::new(),
            artifacts_hidden_refs: Vec::new(),
            ts: Utc::now(),
        }
    }

    pub fn with_digest(mut self, digest: TrajectoryDigest) -> Self {
        self.trajectory_digest = Some(digest);
        self
    }
}
