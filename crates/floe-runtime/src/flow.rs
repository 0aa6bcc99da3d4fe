use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use floe_core::error::{FloeError, Result};
use floe_core::event::{EventBus, FlowEvent};
use floe_core::types::{
    ExhaustionReason, FinalAnswer, FlowErrorPayload, Message, Payload, TraceId, WorkingMemory,
};

use crate::context::{Context, Outlet, EGRESS};
use crate::edge::Floe;
use crate::graph::{EdgeKind, Graph};
use crate::node::{Node, NodeOutput};
use crate::scope::{TraceGuard, TraceRegistry};
use crate::stream::StreamSequencer;

impl Graph {
    /// Start one worker per node and return the running flow.
    pub fn run(self) -> Flow {
        let registry = Arc::new(TraceRegistry::new(CancellationToken::new()));
        self.start(registry, None)
    }

    /// Start as a sub-flow: cancelled with `root`, workers tracked by `tracker`.
    pub(crate) fn run_nested(self, root: CancellationToken, tracker: TaskTracker) -> Flow {
        let registry = Arc::new(TraceRegistry::nested(root, tracker.clone()));
        self.start(registry, Some(tracker))
    }

    fn start(self, registry: Arc<TraceRegistry>, tracker: Option<TaskTracker>) -> Flow {
        let default_capacity = self.config.queue_capacity;
        let egress = Arc::new(Floe::new("egress", default_capacity));
        let errors = Arc::new(Floe::new("errors", default_capacity));
        let streams = Arc::new(StreamSequencer::default());

        let mut inbound: HashMap<String, Vec<Arc<Floe<Message>>>> = HashMap::new();
        let mut outbound: HashMap<String, Vec<Outlet>> = HashMap::new();
        let mut ingress = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let floe = Arc::new(Floe::new(format!("ingress->{entry}"), default_capacity));
            inbound.entry(entry.clone()).or_default().push(floe.clone());
            ingress.push((entry.clone(), floe));
        }
        for edge in &self.edges {
            let floe = Arc::new(Floe::new(
                format!("{}->{}", edge.from, edge.to),
                edge.capacity.unwrap_or(default_capacity),
            ));
            inbound.entry(edge.to.clone()).or_default().push(floe.clone());
            outbound.entry(edge.from.clone()).or_default().push(Outlet {
                target: edge.to.clone(),
                floe,
                cycle: edge.kind == EdgeKind::ExplicitCycle,
            });
        }
        for exit in &self.exits {
            outbound.entry(exit.clone()).or_default().push(Outlet {
                target: EGRESS.to_string(),
                floe: egress.clone(),
                cycle: false,
            });
        }

        let mut handles = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            let name = node.name().to_string();
            let ctx = Context::wired(
                name.clone(),
                outbound.remove(&name).unwrap_or_default(),
                inbound.remove(&name).unwrap_or_default(),
                self.events.clone(),
                registry.clone(),
                streams.clone(),
            );
            let worker = Worker {
                node: Arc::new(node),
                ctx,
                egress: egress.clone(),
                errors: errors.clone(),
                registry: registry.clone(),
                emit_errors: self.config.emit_errors_to_egress,
            };
            let handle = match &tracker {
                Some(tracker) => tracker.spawn(worker.run()),
                None => tokio::spawn(worker.run()),
            };
            handles.push(handle);
        }
        debug!(nodes = handles.len(), entries = ?self.entries, exits = ?self.exits, "Flow started");

        Flow {
            ingress,
            egress,
            errors,
            registry,
            events: self.events,
            handles,
        }
    }
}

/// A running flow. Dropping it cancels every worker; [`Flow::stop`] also
/// waits for them.
pub struct Flow {
    ingress: Vec<(String, Arc<Floe<Message>>)>,
    egress: Arc<Floe<Message>>,
    errors: Arc<Floe<FloeError>>,
    registry: Arc<TraceRegistry>,
    events: Arc<EventBus>,
    handles: Vec<JoinHandle<()>>,
}

impl Flow {
    /// Send a message to every entry node.
    pub async fn emit(&self, message: Message) -> Result<()> {
        let root = self.registry.root();
        for (_, floe) in &self.ingress {
            floe.emit_or_cancel(message.clone(), root).await?;
        }
        Ok(())
    }

    /// Send a message to one entry node.
    pub async fn emit_to(&self, message: Message, entry: &str) -> Result<()> {
        let (_, floe) = self
            .ingress
            .iter()
            .find(|(name, _)| name == entry)
            .ok_or_else(|| FloeError::UnknownNode(entry.to_string()))?;
        floe.emit_or_cancel(message, self.registry.root()).await
    }

    /// Next message at egress.
    ///
    /// A node failure that survived its retries is returned as
    /// `Err(FloeError::NodeFailed)`, unless the flow surfaces errors as
    /// `Payload::Error` messages.
    pub async fn fetch(&self) -> Result<Message> {
        let root = self.registry.root();
        tokio::select! {
            biased;
            err = self.errors.fetch_or_cancel(root) => Err(match err {
                Ok(e) | Err(e) => e,
            }),
            msg = self.egress.fetch_or_cancel(root) => msg,
        }
    }

    /// Cancel all work carrying `trace` (including playbooks) and wait for it
    /// to finish.
    pub async fn cancel(&self, trace: &TraceId) -> bool {
        self.registry.cancel(trace, &self.events).await
    }

    pub fn outstanding_tasks(&self, trace: &TraceId) -> usize {
        self.registry.outstanding_tasks(trace)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn egress_depth(&self) -> usize {
        self.egress.depth()
    }

    pub fn entries(&self) -> Vec<&str> {
        self.ingress.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Cancel every worker and wait for all of them to exit.
    pub async fn stop(&mut self) {
        self.registry.root().cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Flow worker ended abnormally");
            }
        }
        debug!("Flow stopped");
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.registry.root().cancel();
    }
}

struct Worker {
    node: Arc<Node>,
    ctx: Context,
    egress: Arc<Floe<Message>>,
    errors: Arc<Floe<FloeError>>,
    registry: Arc<TraceRegistry>,
    emit_errors: bool,
}

impl Worker {
    async fn run(self) {
        loop {
            let message = match self.ctx.fetch_any().await {
                Ok(m) => m,
                Err(FloeError::Cancelled) => break,
                Err(e) => {
                    warn!(node = %self.node.name(), error = %e, "Worker input closed");
                    break;
                }
            };
            if !self.process(message).await {
                info!(node = %self.node.name(), "Node requested stop");
                break;
            }
        }
        debug!(node = %self.node.name(), "Worker exited");
    }

    /// Handle one message. Returns `false` when the node asked to stop.
    async fn process(&self, message: Message) -> bool {
        let Some(guard) = self.registry.enter(&message.trace_id) else {
            debug!(node = %self.node.name(), trace_id = %message.trace_id, "Dropping message for cancelled trace");
            return true;
        };

        if message.is_expired() {
            self.expire(message, &guard).await;
            return true;
        }

        let node = self.node.clone();
        let ctx = self.ctx.clone();
        let token = guard.token().clone();
        let input = message.clone();
        let handle = guard.tracker().spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(FloeError::Cancelled),
                res = node.invoke(input, &ctx) => res,
            }
        });
        let result = match handle.await {
            Ok(res) => res,
            Err(e) => Err(FloeError::Transient(format!("node task failed: {e}"))),
        };

        let dispatched = match result {
            Ok(NodeOutput::Emit(out)) => self.dispatch(out, None, &guard).await,
            Ok(NodeOutput::Route { message: out, targets }) => {
                self.dispatch(out, Some(targets), &guard).await
            }
            Ok(NodeOutput::Skip) => Ok(()),
            Ok(NodeOutput::Stop) => return false,
            Err(e) => Err(e),
        };
        match dispatched {
            Ok(()) => {}
            Err(FloeError::Cancelled) => {
                debug!(node = %self.node.name(), trace_id = %message.trace_id, "Invocation cancelled");
            }
            Err(err) => self.fail(&message, err, &guard).await,
        }
        true
    }

    async fn dispatch(&self, out: Message, targets: Option<Vec<String>>, guard: &TraceGuard) -> Result<()> {
        let token = guard.token();
        if let Some(targets) = targets {
            for target in &targets {
                let outlet = self.ctx.outlet(target).ok_or_else(|| FloeError::UnknownRoute {
                    node: self.node.name().to_string(),
                    target: target.clone(),
                })?;
                outlet.floe.emit_or_cancel(out.clone(), token).await?;
            }
            if targets.is_empty() {
                debug!(node = %self.node.name(), trace_id = %out.trace_id, "Router dropped message");
            }
            return Ok(());
        }

        if self.ctx.closes_cycle() {
            if let Payload::Working(wm) = &out.payload {
                let wm = wm.clone();
                return self.controller_step(out, wm, token).await;
            }
        }

        for outlet in self.ctx.outlets().iter().filter(|o| !o.cycle) {
            outlet.floe.emit_or_cancel(out.clone(), token).await?;
        }
        Ok(())
    }

    /// Count the hop and either send the working state back along the cycle
    /// edges or finish at egress with an exhaustion answer.
    async fn controller_step(
        &self,
        out: Message,
        mut wm: WorkingMemory,
        token: &CancellationToken,
    ) -> Result<()> {
        wm.hops += 1;
        let exhausted = if out.is_expired() {
            Some(ExhaustionReason::Deadline)
        } else {
            wm.exhaustion()
        };

        match exhausted {
            Some(reason) => {
                info!(
                    node = %self.node.name(),
                    trace_id = %out.trace_id,
                    hops = wm.hops,
                    reason = reason.describe(),
                    "Controller loop finished"
                );
                let answer = FinalAnswer::exhausted(reason).with_payload(json!({
                    "query": wm.query,
                    "facts": wm.facts,
                    "hops": wm.hops,
                }));
                self.egress
                    .emit_or_cancel(out.with_payload(Payload::Final(answer)), token)
                    .await
            }
            None => {
                let next = out.with_payload(Payload::Working(wm));
                for outlet in self.ctx.outlets().iter().filter(|o| o.cycle) {
                    outlet.floe.emit_or_cancel(next.clone(), token).await?;
                }
                Ok(())
            }
        }
    }

    async fn expire(&self, message: Message, guard: &TraceGuard) {
        warn!(node = %self.node.name(), trace_id = %message.trace_id, "Message deadline passed, dropping");
        self.ctx.events().publish(FlowEvent::MessageExpired {
            trace_id: message.trace_id.clone(),
            node: self.node.name().to_string(),
        });
        let answer = FinalAnswer::exhausted(ExhaustionReason::Deadline)
            .with_metadata("expired_at", json!(self.node.name()));
        if let Err(e) = self
            .egress
            .emit_or_cancel(message.with_payload(Payload::Final(answer)), guard.token())
            .await
        {
            debug!(error = %e, "Could not deliver expiry notice");
        }
    }

    async fn fail(&self, message: &Message, err: FloeError, guard: &TraceGuard) {
        error!(
            node = %self.node.name(),
            trace_id = %message.trace_id,
            code = err.kind(),
            attempts = err.attempts(),
            error = %err,
            "Message failed"
        );
        let delivered = if self.emit_errors {
            let detail = match &err {
                FloeError::RetriesExhausted { last, .. } => last.to_string(),
                other => other.to_string(),
            };
            let payload = FlowErrorPayload {
                code: err.kind().to_string(),
                node_name: self.node.name().to_string(),
                trace_id: message.trace_id.clone(),
                message: detail,
                attempts: err.attempts(),
            };
            self.egress
                .emit_or_cancel(message.with_payload(Payload::Error(payload)), guard.token())
                .await
        } else {
            let failure = FloeError::NodeFailed {
                node: self.node.name().to_string(),
                trace_id: message.trace_id.clone(),
                source: Box::new(err),
            };
            self.errors.emit_or_cancel(failure, guard.token()).await
        };
        if let Err(e) = delivered {
            debug!(error = %e, "Could not deliver node failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FlowBuilder;
    use floe_core::types::Headers;
    use std::time::Duration;

    fn echo(name: &str) -> Node {
        Node::new(name, |m: Message, _ctx: Context| async move { Ok(NodeOutput::Emit(m)) })
    }

    #[tokio::test]
    async fn test_round_trip_preserves_trace() {
        let mut flow = FlowBuilder::new()
            .node(echo("a"))
            .node(echo("b"))
            .edge("a", "b")
            .build()
            .unwrap()
            .run();
        let msg = Message::data(json!({"q": 1}), Headers::new("acme"));
        let trace = msg.trace_id.clone();
        flow.emit(msg).await.unwrap();
        let out = flow.fetch().await.unwrap();
        assert_eq!(out.trace_id, trace);
        assert_eq!(out.payload.as_data(), Some(&json!({"q": 1})));
        flow.stop().await;
    }

    #[tokio::test]
    async fn test_expired_message_becomes_final() {
        let flow = FlowBuilder::new().node(echo("a")).build().unwrap().run();
        let msg = Message::data(json!(1), Headers::new("acme")).with_deadline(0.0);
        flow.emit(msg).await.unwrap();
        let out = flow.fetch().await.unwrap();
        let answer = out.final_answer().unwrap();
        assert_eq!(answer.exhaustion(), Some(ExhaustionReason::Deadline));
    }

    #[tokio::test]
    async fn test_unknown_route_is_a_failure() {
        let router = Node::new("router", |m: Message, _ctx: Context| async move {
            Ok(NodeOutput::Route {
                message: m,
                targets: vec!["nowhere".into()],
            })
        });
        let flow = FlowBuilder::new()
            .node(router)
            .node(echo("sink"))
            .edge("router", "sink")
            .build()
            .unwrap()
            .run();
        flow.emit(Message::data(json!(1), Headers::new("acme"))).await.unwrap();
        let err = flow.fetch().await.unwrap_err();
        assert_eq!(err.kind(), "unknown_route");
    }

    #[tokio::test]
    async fn test_stop_joins_workers() {
        let mut flow = FlowBuilder::new().node(echo("a")).build().unwrap().run();
        tokio::time::timeout(Duration::from_secs(1), flow.stop()).await.unwrap();
        let err = flow.emit(Message::data(json!(1), Headers::new("acme"))).await.unwrap_err();
        assert!(matches!(err, FloeError::Cancelled));
    }
}
