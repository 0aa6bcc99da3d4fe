use thiserror::Error;

use crate::types::{PauseRequest, TraceId};

#[derive(Debug, Error)]
pub enum FloeError {
    // Node execution errors
    #[error("Input validation failed for node {node}: {message}")]
    Validation { node: String, message: String },

    #[error("Output validation failed for node {node}: {message}")]
    OutputValidation { node: String, message: String },

    #[error("Node {node} timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Transient tool error: {0}")]
    Transient(String),

    #[error("Node {node} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        node: String,
        attempts: u32,
        last: Box<FloeError>,
    },

    #[error("Node {node} failed for trace {trace_id}: {source}")]
    NodeFailed {
        node: String,
        trace_id: TraceId,
        #[source]
        source: Box<FloeError>,
    },

    // Graph construction errors
    #[error("Unintended cycle through nodes: {0}")]
    Cycle(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid schema: {0}")]
    Schema(String),

    // Runtime errors
    #[error("Edge closed: {0}")]
    EdgeClosed(String),

    #[error("Node {node} cannot route to {target}")]
    UnknownRoute { node: String, target: String },

    #[error("Cancelled")]
    Cancelled,

    #[error("Playbook timed out after {timeout_ms}ms")]
    PlaybookTimeout { timeout_ms: u64 },

    #[error("Stream {stream_id} out of order: expected seq {expected}, got {got}")]
    StreamGap {
        stream_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Pause requested: {}", .0.reason)]
    PauseRequested(PauseRequest),

    // Planner errors
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Malformed planner action: {0}")]
    MalformedAction(String),

    #[error("Unknown or expired resume token: {0}")]
    PauseNotFound(String),

    #[error("LLM request failed: {0}")]
    Llm(String),

    // Memory errors
    #[error("Memory budget exceeded: {tokens} tokens > limit {limit}")]
    MemoryBudgetExceeded { tokens: usize, limit: usize },

    #[error("Summarizer failed: {0}")]
    Summarizer(String),

    // Storage errors
    #[error("State store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FloeError {
    /// Stable machine-readable code for this error, used in structured
    /// error payloads and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::OutputValidation { .. } => "output_validation_error",
            Self::NodeTimeout { .. } => "timeout",
            Self::Transient(_) => "transient_tool_error",
            Self::RetriesExhausted { last, .. } => last.kind(),
            Self::NodeFailed { source, .. } => source.kind(),
            Self::Cycle(_) | Self::UnknownNode(_) | Self::DuplicateNode(_) | Self::InvalidGraph(_) => {
                "invalid_graph"
            }
            Self::Schema(_) => "schema_error",
            Self::EdgeClosed(_) => "edge_closed",
            Self::UnknownRoute { .. } => "unknown_route",
            Self::Cancelled => "cancelled",
            Self::PlaybookTimeout { .. } => "playbook_timeout",
            Self::StreamGap { .. } => "stream_gap",
            Self::PauseRequested(_) => "pause_requested",
            Self::BudgetExceeded(_) => "budget_exceeded",
            Self::MalformedAction(_) => "malformed_action",
            Self::PauseNotFound(_) => "pause_not_found",
            Self::Llm(_) => "llm_error",
            Self::MemoryBudgetExceeded { .. } => "memory_budget_exceeded",
            Self::Summarizer(_) => "summarizer_error",
            Self::Store(_) | Self::Database(_) => "store_error",
            Self::Config(_) | Self::ConfigNotFound(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Whether a node attempt that failed with this error may be retried.
    ///
    /// Input validation, pause requests and cancellation are terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Validation { .. }
                | Self::Cancelled
                | Self::PauseRequested(_)
                | Self::RetriesExhausted { .. }
                | Self::NodeFailed { .. }
        )
    }

    /// Number of attempts recorded on a retries-exhausted error, 1 otherwise.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::RetriesExhausted { attempts, .. } => *attempts,
            Self::NodeFailed { source, .. } => source.attempts(),
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, FloeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_unwraps_retries() {
        let err = FloeError::RetriesExhausted {
            node: "retrieve".into(),
            attempts: 3,
            last: Box::new(FloeError::NodeTimeout {
                node: "retrieve".into(),
                timeout_ms: 50,
            }),
        };
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.attempts(), 3);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_is_terminal() {
        let err = FloeError::Validation {
            node: "triage".into(),
            message: "missing topic".into(),
        };
        assert!(!err.is_retryable());
        assert!(FloeError::Transient("flaky".into()).is_retryable());
        assert!(FloeError::OutputValidation {
            node: "pack".into(),
            message: "bad".into()
        }
        .is_retryable());
    }
}
