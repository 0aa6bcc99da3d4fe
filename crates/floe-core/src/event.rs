use serde::{Deserialize, Serialize};

use crate::types::{PauseReason, TraceId};

/// Structured lifecycle event. Every variant carries the trace it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    NodeStart {
        trace_id: TraceId,
        node: String,
        attempt: u32,
    },
    NodeRetry {
        trace_id: TraceId,
        node: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    NodeTimeout {
        trace_id: TraceId,
        node: String,
        attempt: u32,
        latency_ms: u64,
    },
    NodeSuccess {
        trace_id: TraceId,
        node: String,
        attempt: u32,
        latency_ms: u64,
    },
    NodeFailed {
        trace_id: TraceId,
        node: String,
        attempt: u32,
        latency_ms: u64,
        code: String,
        error: String,
    },
    /// A message was dropped because its deadline passed.
    MessageExpired {
        trace_id: TraceId,
        node: String,
    },
    TraceCancelled {
        trace_id: TraceId,
    },
    StreamChunk {
        trace_id: TraceId,
        node: String,
        stream_id: String,
        seq: u64,
        done: bool,
    },
    PlannerStep {
        trace_id: TraceId,
        hop: usize,
        action: String,
        latency_ms: u64,
        error: Option<String>,
    },
    PlannerPause {
        trace_id: TraceId,
        token: String,
        reason: PauseReason,
    },
    PlannerFinish {
        trace_id: TraceId,
        reason: String,
        hops: usize,
        tokens_used: u64,
    },
    MemoryHealthChanged {
        trace_id: TraceId,
        session: String,
        from: String,
        to: String,
    },
}

impl FlowEvent {
    pub fn trace_id(&self) -> &TraceId {
        match self {
            Self::NodeStart { trace_id, .. }
            | Self::NodeRetry { trace_id, .. }
            | Self::NodeTimeout { trace_id, .. }
            | Self::NodeSuccess { trace_id, .. }
            | Self::NodeFailed { trace_id, .. }
            | Self::MessageExpired { trace_id, .. }
            | Self::TraceCancelled { trace_id }
            | Self::StreamChunk { trace_id, .. }
            | Self::PlannerStep { trace_id, .. }
            | Self::PlannerPause { trace_id, .. }
            | Self::PlannerFinish { trace_id, .. }
            | Self::MemoryHealthChanged { trace_id, .. } => trace_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NodeStart { .. } => "node_start",
            Self::NodeRetry { .. } => "node_retry",
            Self::NodeTimeout { .. } => "node_timeout",
            Self::NodeSuccess { .. } => "node_success",
            Self::NodeFailed { .. } => "node_failed",
            Self::MessageExpired { .. } => "message_expired",
            Self::TraceCancelled { .. } => "trace_cancelled",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::PlannerStep { .. } => "planner_step",
            Self::PlannerPause { .. } => "planner_pause",
            Self::PlannerFinish { .. } => "planner_finish",
            Self::MemoryHealthChanged { .. } => "memory_health_changed",
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; publishing never blocks.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<FlowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: FlowEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(FlowEvent::TraceCancelled {
            trace_id: TraceId::from_str("t1"),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(FlowEvent::NodeStart {
            trace_id: TraceId::from_str("t1"),
            node: "triage".into(),
            attempt: 0,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "node_start");
        assert_eq!(event.trace_id().as_str(), "t1");
    }
}
