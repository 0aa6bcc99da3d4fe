use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rand::Rng;
use tracing::{debug, error, warn};

use floe_core::config::NodePolicy;
use floe_core::error::{FloeError, Result};
use floe_core::event::FlowEvent;
use floe_core::types::Message;

use crate::context::Context;
use crate::schema::SchemaValidator;

/// What a node produced for one input message.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Broadcast to every downstream edge.
    Emit(Message),
    /// Send only to the named successors.
    Route { message: Message, targets: Vec<String> },
    /// Consume the input without emitting anything.
    Skip,
    /// Consume the input and stop this node's worker.
    Stop,
}

impl NodeOutput {
    fn message(&self) -> Option<&Message> {
        match self {
            Self::Emit(m) | Self::Route { message: m, .. } => Some(m),
            Self::Skip | Self::Stop => None,
        }
    }
}

/// The computation wrapped by a [`Node`].
pub trait NodeHandler: Send + Sync + 'static {
    fn call(&self, message: Message, ctx: Context) -> BoxFuture<'static, Result<NodeOutput>>;
}

impl<F, Fut> NodeHandler for F
where
    F: Fn(Message, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
{
    fn call(&self, message: Message, ctx: Context) -> BoxFuture<'static, Result<NodeOutput>> {
        Box::pin(self(message, ctx))
    }
}

/// A named unit of computation with a fixed execution policy.
#[derive(Clone)]
pub struct Node {
    name: String,
    description: String,
    handler: Arc<dyn NodeHandler>,
    policy: NodePolicy,
    input_schema: Option<Arc<SchemaValidator>>,
    output_schema: Option<Arc<SchemaValidator>>,
}

impl Node {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Message, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
    {
        Self::from_handler(name, Arc::new(handler))
    }

    /// Wrap a handler implemented as its own type.
    pub fn from_handler(name: impl Into<String>, handler: Arc<dyn NodeHandler>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            handler,
            policy: NodePolicy::default(),
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_policy(mut self, policy: NodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Result<Self> {
        self.input_schema = Some(Arc::new(SchemaValidator::compile(schema)?));
        Ok(self)
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Result<Self> {
        self.output_schema = Some(Arc::new(SchemaValidator::compile(schema)?));
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn policy(&self) -> &NodePolicy {
        &self.policy
    }

    pub fn input_schema(&self) -> Option<&SchemaValidator> {
        self.input_schema.as_deref()
    }

    pub fn output_schema(&self) -> Option<&SchemaValidator> {
        self.output_schema.as_deref()
    }

    /// Run the handler under this node's policy.
    ///
    /// Input validation failures are returned immediately. Timeouts, handler
    /// errors and output validation failures are retried up to
    /// `max_retries` times with exponential backoff.
    pub async fn invoke(&self, message: Message, ctx: &Context) -> Result<NodeOutput> {
        if self.policy.validate.checks_input() {
            if let Some(schema) = &self.input_schema {
                if let Err(e) = schema.validate(&message.payload.to_value()) {
                    warn!(node = %self.name, trace_id = %message.trace_id, error = %e, "Input validation failed");
                    return Err(FloeError::Validation {
                        node: self.name.clone(),
                        message: e,
                    });
                }
            }
        }

        let trace_id = message.trace_id.clone();
        let events = ctx.events();
        let mut attempt: u32 = 0;
        loop {
            events.publish(FlowEvent::NodeStart {
                trace_id: trace_id.clone(),
                node: self.name.clone(),
                attempt,
            });
            let started = Instant::now();
            let outcome = self.attempt(message.clone(), ctx).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(output) => {
                    debug!(node = %self.name, trace_id = %trace_id, attempt, latency_ms, "Node succeeded");
                    events.publish(FlowEvent::NodeSuccess {
                        trace_id,
                        node: self.name.clone(),
                        attempt,
                        latency_ms,
                    });
                    return Ok(output);
                }
                Err(err) => err,
            };

            if matches!(err, FloeError::NodeTimeout { .. }) {
                events.publish(FlowEvent::NodeTimeout {
                    trace_id: trace_id.clone(),
                    node: self.name.clone(),
                    attempt,
                    latency_ms,
                });
            }

            if !err.is_retryable() || attempt >= self.policy.max_retries {
                error!(node = %self.name, trace_id = %trace_id, attempt, latency_ms, error = %err, "Node failed");
                events.publish(FlowEvent::NodeFailed {
                    trace_id: trace_id.clone(),
                    node: self.name.clone(),
                    attempt,
                    latency_ms,
                    code: err.kind().to_string(),
                    error: err.to_string(),
                });
                if !err.is_retryable() {
                    return Err(err);
                }
                return Err(FloeError::RetriesExhausted {
                    node: self.name.clone(),
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = retry_delay(&self.policy, attempt);
            warn!(
                node = %self.name,
                trace_id = %trace_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Node attempt failed, retrying"
            );
            events.publish(FlowEvent::NodeRetry {
                trace_id: trace_id.clone(),
                node: self.name.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// One attempt: handler call under the per-attempt timeout, then output
    /// validation.
    async fn attempt(&self, message: Message, ctx: &Context) -> Result<NodeOutput> {
        let fut = self.handler.call(message, ctx.clone());
        let output = match self.policy.timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(res) => res?,
                Err(_) => {
                    return Err(FloeError::NodeTimeout {
                        node: self.name.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    })
                }
            },
            None => fut.await?,
        };

        if self.policy.validate.checks_output() {
            if let (Some(schema), Some(out)) = (&self.output_schema, output.message()) {
                schema
                    .validate(&out.payload.to_value())
                    .map_err(|e| FloeError::OutputValidation {
                        node: self.name.clone(),
                        message: e,
                    })?;
            }
        }
        Ok(output)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Delay before the retry following failed attempt `attempt`.
/// Jitter only stretches the base delay.
pub fn retry_delay(policy: &NodePolicy, attempt: u32) -> Duration {
    let base = policy.base_delay(attempt);
    if policy.backoff_jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let stretch = rand::thread_rng().gen_range(0.0..=policy.backoff_jitter.min(1.0));
    base.mul_f64(1.0 + stretch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_core::config::ValidationMode;
    use floe_core::types::Headers;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn msg(value: serde_json::Value) -> Message {
        Message::data(value, Headers::new("acme"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds_with_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));
        let node = {
            let calls = calls.clone();
            let stamps = stamps.clone();
            Node::new("flaky", move |m: Message, _ctx: Context| {
                let calls = calls.clone();
                let stamps = stamps.clone();
                async move {
                    stamps.lock().unwrap().push(tokio::time::Instant::now());
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(FloeError::Transient("upstream 503".into()));
                    }
                    Ok(NodeOutput::Emit(m))
                }
            })
            .with_policy(NodePolicy::default().with_retries(2, 0.1))
        };

        let ctx = Context::detached("test");
        let out = node.invoke(msg(json!(1)), &ctx).await.unwrap();
        assert!(matches!(out, NodeOutput::Emit(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stamps = stamps.lock().unwrap();
        assert!(stamps[1] - stamps[0] >= Duration::from_millis(100));
        assert!(stamps[2] - stamps[1] >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = {
            let calls = calls.clone();
            Node::new("slow", move |m: Message, _ctx: Context| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(NodeOutput::Emit(m))
                }
            })
            .with_policy(NodePolicy::default().with_timeout(0.05).with_retries(1, 0.01))
        };

        let err = node.invoke(msg(json!(1)), &Context::detached("test")).await.unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.kind(), "timeout");
        assert_eq!(err.attempts(), 2);
    }

    #[tokio::test]
    async fn test_invalid_input_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = {
            let calls = calls.clone();
            Node::new("triage", move |m: Message, _ctx: Context| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(NodeOutput::Emit(m)) }
            })
            .with_policy(
                NodePolicy::default()
                    .with_validate(ValidationMode::Input)
                    .with_retries(3, 0.0),
            )
            .with_input_schema(json!({"type": "object", "required": ["topic"]}))
            .unwrap()
        };

        let err = node.invoke(msg(json!({"other": 1})), &Context::detached("test")).await.unwrap_err();
        assert!(matches!(err, FloeError::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_output_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let node = {
            let calls = calls.clone();
            Node::new("pack", move |m: Message, _ctx: Context| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(NodeOutput::Emit(m.with_data(json!({"wrong": true}))))
                    } else {
                        Ok(NodeOutput::Emit(m.with_data(json!({"summary": "ok"}))))
                    }
                }
            })
            .with_policy(
                NodePolicy::default()
                    .with_validate(ValidationMode::Output)
                    .with_retries(1, 0.0),
            )
            .with_output_schema(json!({"type": "object", "required": ["summary"]}))
            .unwrap()
        };

        let out = node.invoke(msg(json!({})), &Context::detached("test")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match out {
            NodeOutput::Emit(m) => assert_eq!(m.payload.as_data(), Some(&json!({"summary": "ok"}))),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let ctx = Context::detached("test");
        let mut rx = ctx.events().subscribe();
        let node = Node::new("echo", |m: Message, _ctx: Context| async move { Ok(NodeOutput::Emit(m)) });
        node.invoke(msg(json!(1)), &ctx).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().kind(), "node_start");
        assert_eq!(rx.recv().await.unwrap().kind(), "node_success");
    }

    #[test]
    fn test_jitter_only_lengthens() {
        let policy = NodePolicy::default().with_retries(3, 0.5).with_jitter(0.5);
        for attempt in 0..3 {
            let base = policy.base_delay(attempt);
            let delay = retry_delay(&policy, attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.5));
        }
    }
}
