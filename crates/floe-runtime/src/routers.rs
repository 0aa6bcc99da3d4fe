use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use floe_core::types::{Message, TraceId};

use crate::context::Context;
use crate::node::{Node, NodeOutput};

/// Routing decision made by a predicate router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    To(String),
    Many(Vec<String>),
    Drop,
}

impl Route {
    fn into_targets(self) -> Vec<String> {
        match self {
            Self::To(target) => vec![target],
            Self::Many(targets) => targets,
            Self::Drop => Vec::new(),
        }
    }
}

/// A node that forwards each message to the successors chosen by `predicate`.
///
/// The decision is a pure function of the message. Targets are resolved
/// against the node's static successors; an unknown target fails the message.
pub fn predicate_router<F>(name: impl Into<String>, predicate: F) -> Node
where
    F: Fn(&Message) -> Route + Send + Sync + 'static,
{
    let predicate = Arc::new(predicate);
    Node::new(name, move |message: Message, _ctx: Context| {
        let targets = predicate(&message).into_targets();
        async move {
            if targets.is_empty() {
                return Ok(NodeOutput::Skip);
            }
            Ok(NodeOutput::Route { message, targets })
        }
    })
}

/// Partial joins kept per `join_k` node; the oldest is evicted past this.
pub const JOIN_PENDING_LIMIT: usize = 1024;

struct JoinBucket {
    opened: u64,
    values: Vec<serde_json::Value>,
}

#[derive(Default)]
struct JoinState {
    next: u64,
    buckets: HashMap<TraceId, JoinBucket>,
}

/// A node that waits for `k` messages of the same trace, then emits one
/// message whose data payload is the array of their payloads in arrival
/// order. Fewer than `k` messages never trigger an emission.
///
/// Buckets of cancelled traces are dropped, and at most
/// [`JOIN_PENDING_LIMIT`] partial joins are held at once.
pub fn join_k(name: impl Into<String>, k: usize) -> Node {
    let name = name.into();
    let state: Arc<Mutex<JoinState>> = Arc::default();
    let node_name = name.clone();
    Node::new(name, move |message: Message, ctx: Context| {
        let joined = {
            let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
            let registry = ctx.registry();
            state.buckets.retain(|trace, _| !registry.is_cancelled(trace));
            if registry.is_cancelled(&message.trace_id) {
                None
            } else {
                collect(&mut state, &node_name, &message, k)
            }
        };
        async move {
            match joined {
                Some(values) => Ok(NodeOutput::Emit(message.with_data(serde_json::Value::Array(values)))),
                None => Ok(NodeOutput::Skip),
            }
        }
    })
}

fn collect(state: &mut JoinState, node: &str, message: &Message, k: usize) -> Option<Vec<serde_json::Value>> {
    if !state.buckets.contains_key(&message.trace_id) && state.buckets.len() >= JOIN_PENDING_LIMIT {
        let oldest = state
            .buckets
            .iter()
            .min_by_key(|(_, b)| b.opened)
            .map(|(t, _)| t.clone());
        if let Some(oldest) = oldest {
            warn!(node = %node, trace_id = %oldest, "Join buffer full, dropping oldest partial join");
            state.buckets.remove(&oldest);
        }
    }
    let opened = state.next;
    let bucket = state.buckets.entry(message.trace_id.clone()).or_insert_with(|| JoinBucket {
        opened,
        values: Vec::new(),
    });
    if bucket.opened == opened {
        state.next += 1;
    }
    bucket.values.push(message.payload.to_value());
    if bucket.values.len() >= k.max(1) {
        return state.buckets.remove(&message.trace_id).map(|b| b.values);
    }
    debug!(node = %node, trace_id = %message.trace_id, have = bucket.values.len(), want = k, "Join waiting");
    None
}
