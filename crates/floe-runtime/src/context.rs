use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use floe_core::error::{FloeError, Result};
use floe_core::event::{EventBus, FlowEvent};
use floe_core::types::{Message, Payload, PauseReason, PauseRequest, StreamChunk};

use crate::edge::Floe;
use crate::graph::FlowBuilder;
use crate::scope::TraceRegistry;
use crate::stream::StreamSequencer;

/// Name of the egress sentinel as seen from an exit node.
pub const EGRESS: &str = "__egress__";

pub(crate) struct Outlet {
    pub(crate) target: String,
    pub(crate) floe: Arc<Floe<Message>>,
    /// Declared `ExplicitCycle`; only working state travels back along it.
    pub(crate) cycle: bool,
}

struct ContextInner {
    node: String,
    outgoing: Vec<Outlet>,
    incoming: Vec<Arc<Floe<Message>>>,
    events: Arc<EventBus>,
    registry: Arc<TraceRegistry>,
    streams: Arc<StreamSequencer>,
}

/// Handle a running node uses to talk to its neighbours.
///
/// Cheap to clone. A context built with [`Context::detached`] has no edges;
/// the planner uses those to invoke catalog nodes directly.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn wired(
        node: String,
        outgoing: Vec<Outlet>,
        incoming: Vec<Arc<Floe<Message>>>,
        events: Arc<EventBus>,
        registry: Arc<TraceRegistry>,
        streams: Arc<StreamSequencer>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                node,
                outgoing,
                incoming,
                events,
                registry,
                streams,
            }),
        }
    }

    /// A context with no edges and its own event bus.
    pub fn detached(node: impl Into<String>) -> Self {
        let registry = Arc::new(TraceRegistry::new(CancellationToken::new()));
        Self::detached_with(node, Arc::new(EventBus::default()), registry)
    }

    /// A context with no edges that shares the caller's event bus and trace
    /// scopes, so cancelling a trace also reaches playbooks started from it.
    pub fn detached_with(
        node: impl Into<String>,
        events: Arc<EventBus>,
        registry: Arc<TraceRegistry>,
    ) -> Self {
        Self::wired(
            node.into(),
            Vec::new(),
            Vec::new(),
            events,
            registry,
            Arc::new(StreamSequencer::default()),
        )
    }

    pub fn node_name(&self) -> &str {
        &self.inner.node
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub(crate) fn registry(&self) -> &Arc<TraceRegistry> {
        &self.inner.registry
    }

    /// Names of the successors this node can emit to.
    pub fn successors(&self) -> Vec<&str> {
        self.inner.outgoing.iter().map(|o| o.target.as_str()).collect()
    }

    /// Whether this node closes a controller loop.
    pub fn closes_cycle(&self) -> bool {
        self.inner.outgoing.iter().any(|o| o.cycle)
    }

    pub(crate) fn outlets(&self) -> &[Outlet] {
        &self.inner.outgoing
    }

    pub(crate) fn outlet(&self, target: &str) -> Option<&Outlet> {
        self.inner.outgoing.iter().find(|o| o.target == target)
    }

    /// Broadcast to every downstream edge except cycle edges. Suspends while
    /// any of them is full.
    pub async fn emit(&self, message: Message) -> Result<()> {
        let targets: Vec<&Outlet> = self.inner.outgoing.iter().filter(|o| !o.cycle).collect();
        if targets.is_empty() {
            return Err(FloeError::EdgeClosed(format!(
                "{} has no downstream edges",
                self.inner.node
            )));
        }
        let root = self.inner.registry.root();
        for outlet in targets {
            outlet.floe.emit_or_cancel(message.clone(), root).await?;
        }
        Ok(())
    }

    /// Emit to one named successor.
    pub async fn emit_to(&self, message: Message, target: &str) -> Result<()> {
        let outlet = self.outlet(target).ok_or_else(|| FloeError::UnknownRoute {
            node: self.inner.node.clone(),
            target: target.to_string(),
        })?;
        outlet.floe.emit_or_cancel(message, self.inner.registry.root()).await
    }

    /// Fetch from the first upstream edge.
    pub async fn fetch(&self) -> Result<Message> {
        let first = self.inner.incoming.first().ok_or_else(|| {
            FloeError::EdgeClosed(format!("{} has no upstream edges", self.inner.node))
        })?;
        first.fetch_or_cancel(self.inner.registry.root()).await
    }

    /// Fetch from whichever upstream edge is ready first.
    pub async fn fetch_any(&self) -> Result<Message> {
        let floes: Vec<&Floe<Message>> = self.inner.incoming.iter().map(|f| f.as_ref()).collect();
        Floe::fetch_any_or_cancel(&floes, self.inner.registry.root())
            .await
            .map(|(_, m)| m)
    }

    /// Emit one ordered piece of a streamed response. The sequence number is
    /// assigned here, per `stream_id`, starting at 0. A context without
    /// downstream edges only publishes the chunk event.
    pub async fn emit_chunk(
        &self,
        parent: &Message,
        stream_id: &str,
        text: impl Into<String>,
        done: bool,
    ) -> Result<StreamChunk> {
        let seq = self.inner.streams.next(stream_id, done);
        let chunk = StreamChunk {
            stream_id: stream_id.to_string(),
            seq,
            text: text.into(),
            done,
            meta: HashMap::new(),
        };
        self.inner.events.publish(FlowEvent::StreamChunk {
            trace_id: parent.trace_id.clone(),
            node: self.inner.node.clone(),
            stream_id: chunk.stream_id.clone(),
            seq,
            done,
        });
        if self.inner.outgoing.iter().any(|o| !o.cycle) {
            self.emit(parent.with_payload(Payload::Chunk(chunk.clone())))
                .await?;
        }
        Ok(chunk)
    }

    /// Run a freshly built sub-flow for `parent` and return its first egress
    /// message.
    ///
    /// The sub-flow sees the parent's trace id and headers. Its workers are
    /// tracked under the parent trace, so cancelling that trace stops them.
    pub async fn call_playbook<F>(
        &self,
        factory: F,
        parent: &Message,
        timeout: Option<Duration>,
    ) -> Result<Message>
    where
        F: FnOnce() -> Result<FlowBuilder>,
    {
        let guard = self
            .inner
            .registry
            .enter(&parent.trace_id)
            .ok_or(FloeError::Cancelled)?;
        let graph = factory()?.event_bus(self.inner.events.clone()).build()?;
        let mut flow = graph.run_nested(guard.token().child_token(), guard.tracker().clone());
        let started = Instant::now();
        debug!(node = %self.inner.node, trace_id = %parent.trace_id, "Starting playbook");

        let run = async {
            flow.emit(parent.clone()).await?;
            flow.fetch().await
        };
        let result = tokio::select! {
            biased;
            _ = guard.token().cancelled() => Err(FloeError::Cancelled),
            res = with_deadline(timeout, run) => res,
        };
        flow.stop().await;

        info!(
            node = %self.inner.node,
            trace_id = %parent.trace_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Playbook finished"
        );
        result
    }

    /// Build the error a handler returns to ask for human input. Nodes
    /// never retry it; the planner turns it into a pause.
    pub fn request_pause(&self, reason: PauseReason, payload: serde_json::Value) -> FloeError {
        FloeError::PauseRequested(PauseRequest { reason, payload })
    }
}

async fn with_deadline<F>(timeout: Option<Duration>, fut: F) -> Result<Message>
where
    F: std::future::Future<Output = Result<Message>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| FloeError::PlaybookTimeout {
                timeout_ms: limit.as_millis() as u64,
            })?,
        None => fut.await,
    }
}
