//! Per-trace cancellation scopes.
//!
//! Every trace that has work in flight owns a cancellation token (a child of
//! the flow's root token) and a task tracker. Node invocations and playbook
//! workers for that trace are spawned on the tracker, so cancelling the trace
//! can wait until nothing for it is still running.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use floe_core::event::{EventBus, FlowEvent};
use floe_core::types::TraceId;

struct TraceEntry {
    token: CancellationToken,
    tracker: TaskTracker,
    active: usize,
}

/// Cancelled trace ids remembered so late messages are dropped; the oldest
/// are forgotten past this many.
pub const CANCELLED_RETAINED: usize = 1024;

#[derive(Default)]
struct RegistryState {
    traces: HashMap<TraceId, TraceEntry>,
    cancelled: HashSet<TraceId>,
    cancel_order: VecDeque<TraceId>,
}

impl RegistryState {
    fn mark_cancelled(&mut self, trace: &TraceId) {
        if !self.cancelled.insert(trace.clone()) {
            return;
        }
        self.cancel_order.push_back(trace.clone());
        while self.cancel_order.len() > CANCELLED_RETAINED {
            if let Some(oldest) = self.cancel_order.pop_front() {
                self.cancelled.remove(&oldest);
            }
        }
    }
}

pub struct TraceRegistry {
    root: CancellationToken,
    /// Set for nested flows: all their trace work is accounted to the
    /// enclosing trace's tracker.
    inherited_tracker: Option<TaskTracker>,
    state: Mutex<RegistryState>,
}

impl TraceRegistry {
    pub fn new(root: CancellationToken) -> Self {
        Self {
            root,
            inherited_tracker: None,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn nested(root: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            root,
            inherited_tracker: Some(tracker),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // A poisoned map is still structurally valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enter the scope of `trace`. Returns `None` if the trace was cancelled.
    /// The scope stays alive while any guard for it exists.
    pub fn enter(self: &Arc<Self>, trace: &TraceId) -> Option<TraceGuard> {
        let mut state = self.lock();
        if state.cancelled.contains(trace) || self.root.is_cancelled() {
            return None;
        }
        let entry = state.traces.entry(trace.clone()).or_insert_with(|| TraceEntry {
            token: self.root.child_token(),
            tracker: self.inherited_tracker.clone().unwrap_or_default(),
            active: 0,
        });
        entry.active += 1;
        Some(TraceGuard {
            registry: self.clone(),
            trace: trace.clone(),
            token: entry.token.clone(),
            tracker: entry.tracker.clone(),
        })
    }

    pub fn is_cancelled(&self, trace: &TraceId) -> bool {
        self.root.is_cancelled() || self.lock().cancelled.contains(trace)
    }

    /// Tasks still running on behalf of `trace`.
    pub fn outstanding_tasks(&self, trace: &TraceId) -> usize {
        self.lock().traces.get(trace).map_or(0, |e| e.tracker.len())
    }

    /// Cancel every task carrying `trace` and wait for all of them to exit.
    /// Later messages for the trace are dropped. Returns `false` if nothing
    /// was running for it.
    pub async fn cancel(&self, trace: &TraceId, events: &EventBus) -> bool {
        let entry = {
            let mut state = self.lock();
            state.mark_cancelled(trace);
            state.traces.remove(trace)
        };
        events.publish(FlowEvent::TraceCancelled {
            trace_id: trace.clone(),
        });
        let Some(entry) = entry else {
            debug!(trace_id = %trace, "Cancel requested for idle trace");
            return false;
        };
        entry.token.cancel();
        entry.tracker.close();
        entry.tracker.wait().await;
        info!(trace_id = %trace, "Trace cancelled");
        true
    }

    fn release(&self, trace: &TraceId) {
        let mut state = self.lock();
        let remove = match state.traces.get_mut(trace) {
            Some(entry) => {
                entry.active = entry.active.saturating_sub(1);
                entry.active == 0
            }
            None => false,
        };
        if remove {
            state.traces.remove(trace);
        }
    }
}

/// Live membership in a trace scope.
pub struct TraceGuard {
    registry: Arc<TraceRegistry>,
    trace: TraceId,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl TraceGuard {
    pub fn trace_id(&self) -> &TraceId {
        &self.trace
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }
}

impl Drop for TraceGuard {
    fn drop(&mut self) {
        self.registry.release(&self.trace);
    }
}
