//! Flow graph declaration and build-time validation.
//!
//! A graph must be acyclic unless an edge is explicitly declared as a cycle
//! (a controller loop). Entries and exits are derived from the acyclic edges
//! alone, so every node, and with it every explicit cycle, is entered from
//! ingress and reaches egress.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use floe_core::config::RuntimeConfig;
use floe_core::error::{FloeError, Result};
use floe_core::event::EventBus;

use crate::node::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Acyclic,
    /// Opt-in back edge; a self edge makes the node a controller loop.
    ExplicitCycle,
}

#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    pub capacity: Option<usize>,
}

/// Declarative graph builder.
#[derive(Default)]
pub struct FlowBuilder {
    nodes: Vec<Node>,
    edges: Vec<EdgeSpec>,
    config: RuntimeConfig,
    events: Option<Arc<EventBus>>,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.push_edge(from.into(), to.into(), EdgeKind::Acyclic, None)
    }

    pub fn edge_with_capacity(
        self,
        from: impl Into<String>,
        to: impl Into<String>,
        capacity: usize,
    ) -> Self {
        self.push_edge(from.into(), to.into(), EdgeKind::Acyclic, Some(capacity))
    }

    pub fn cycle_edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.push_edge(from.into(), to.into(), EdgeKind::ExplicitCycle, None)
    }

    /// Wire `node` to itself so it can re-emit working state.
    pub fn controller_loop(self, node: impl Into<String>) -> Self {
        let name = node.into();
        self.push_edge(name.clone(), name, EdgeKind::ExplicitCycle, None)
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn emit_errors_to_egress(mut self, enabled: bool) -> Self {
        self.config.emit_errors_to_egress = enabled;
        self
    }

    pub fn event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn push_edge(mut self, from: String, to: String, kind: EdgeKind, capacity: Option<usize>) -> Self {
        self.edges.push(EdgeSpec {
            from,
            to,
            kind,
            capacity,
        });
        self
    }

    pub fn build(self) -> Result<Graph> {
        if self.nodes.is_empty() {
            return Err(FloeError::InvalidGraph("graph has no nodes".into()));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name().to_string()) {
                return Err(FloeError::DuplicateNode(node.name().to_string()));
            }
        }

        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !names.contains(end.as_str()) {
                    return Err(FloeError::UnknownNode(end.clone()));
                }
            }
            if !seen_edges.insert((edge.from.as_str(), edge.to.as_str())) {
                return Err(FloeError::InvalidGraph(format!(
                    "duplicate edge {} -> {}",
                    edge.from, edge.to
                )));
            }
            if edge.capacity == Some(0) {
                return Err(FloeError::InvalidGraph(format!(
                    "edge {} -> {} has zero capacity",
                    edge.from, edge.to
                )));
            }
        }

        let order: Vec<&str> = self.nodes.iter().map(|n| n.name()).collect();
        check_acyclic(&order, &self.edges)?;

        let entries: Vec<String> = order
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.to == **n && e.kind == EdgeKind::Acyclic))
            .map(|n| n.to_string())
            .collect();
        let exits: Vec<String> = order
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.from == **n && e.kind == EdgeKind::Acyclic))
            .map(|n| n.to_string())
            .collect();
        if entries.is_empty() {
            return Err(FloeError::InvalidGraph("no entry node reachable from ingress".into()));
        }
        if exits.is_empty() {
            return Err(FloeError::InvalidGraph("no exit node reaching egress".into()));
        }

        let events = match self.events {
            Some(events) => events,
            None => Arc::new(EventBus::new(self.config.event_capacity)),
        };
        Ok(Graph {
            nodes: self.nodes,
            edges: self.edges,
            entries,
            exits,
            config: self.config,
            events,
        })
    }
}

/// Kahn's algorithm over the acyclic edges only.
fn check_acyclic(order: &[&str], edges: &[EdgeSpec]) -> Result<()> {
    let mut indegree: HashMap<&str, usize> = order.iter().map(|n| (*n, 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges.iter().filter(|e| e.kind == EdgeKind::Acyclic) {
        adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        *indegree.entry(edge.to.as_str()).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = order.iter().copied().filter(|n| indegree[n] == 0).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for next in adjacency.get(node).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(next) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if visited == order.len() {
        return Ok(());
    }
    let stuck: Vec<&str> = order.iter().copied().filter(|n| indegree[n] > 0).collect();
    Err(FloeError::Cycle(stuck.join(", ")))
}

/// A validated graph, ready to run.
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) edges: Vec<EdgeSpec>,
    pub(crate) entries: Vec<String>,
    pub(crate) exits: Vec<String>,
    pub(crate) config: RuntimeConfig,
    pub(crate) events: Arc<EventBus>,
}

impl Graph {
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn exits(&self) -> &[String] {
        &self.exits
    }

    pub fn edges(&self) -> &[EdgeSpec] {
        &self.edges
    }

    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name()).collect()
    }

    pub fn successors(&self, node: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == node)
            .map(|e| e.to.as_str())
            .collect()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::node::NodeOutput;
    use floe_core::types::Message;

    fn passthrough(name: &str) -> Node {
        Node::new(name, |m: Message, _ctx: Context| async move { Ok(NodeOutput::Emit(m)) })
    }

    #[test]
    fn test_linear_graph_entries_and_exits() {
        let graph = FlowBuilder::new()
            .node(passthrough("triage"))
            .node(passthrough("retrieve"))
            .node(passthrough("pack"))
            .edge("triage", "retrieve")
            .edge("retrieve", "pack")
            .build()
            .unwrap();
        assert_eq!(graph.entries(), ["triage"]);
        assert_eq!(graph.exits(), ["pack"]);
        assert_eq!(graph.successors("triage"), vec!["retrieve"]);
    }

    #[test]
    fn test_rejects_empty_and_duplicates() {
        assert!(matches!(FlowBuilder::new().build(), Err(FloeError::InvalidGraph(_))));
        let err = FlowBuilder::new()
            .node(passthrough("a"))
            .node(passthrough("a"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FloeError::DuplicateNode(n) if n == "a"));
    }

    #[test]
    fn test_rejects_unknown_node() {
        let err = FlowBuilder::new()
            .node(passthrough("a"))
            .edge("a", "ghost")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FloeError::UnknownNode(n) if n == "ghost"));
    }

    #[test]
    fn test_rejects_unflagged_cycles() {
        let err = FlowBuilder::new()
            .node(passthrough("a"))
            .node(passthrough("b"))
            .node(passthrough("c"))
            .edge("a", "b")
            .edge("b", "c")
            .edge("c", "b")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FloeError::Cycle(ref nodes) if nodes.contains('b') && nodes.contains('c')));

        let err = FlowBuilder::new()
            .node(passthrough("a"))
            .edge("a", "a")
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FloeError::Cycle(_)));
    }

    #[test]
    fn test_controller_loop_is_entry_and_exit() {
        let graph = FlowBuilder::new()
            .node(passthrough("controller"))
            .controller_loop("controller")
            .build()
            .unwrap();
        assert_eq!(graph.entries(), ["controller"]);
        assert_eq!(graph.exits(), ["controller"]);
    }

    #[test]
    fn test_explicit_cycle_keeps_downstream_exit() {
        let graph = FlowBuilder::new()
            .node(passthrough("a"))
            .node(passthrough("b"))
            .node(passthrough("c"))
            .node(passthrough("out"))
            .edge("a", "b")
            .edge("b", "c")
            .cycle_edge("c", "b")
            .edge("c", "out")
            .build()
            .unwrap();
        assert_eq!(graph.entries(), ["a"]);
        assert_eq!(graph.exits(), ["out"]);
    }

    #[test]
    fn test_mutual_controller_loop_builds() {
        let graph = FlowBuilder::new()
            .node(passthrough("plan"))
            .node(passthrough("act"))
            .edge("plan", "act")
            .cycle_edge("act", "plan")
            .build()
            .unwrap();
        assert_eq!(graph.entries(), ["plan"]);
        assert_eq!(graph.exits(), ["act"]);

        // A cycle-only tail still drains to egress.
        let graph = FlowBuilder::new()
            .node(passthrough("a"))
            .node(passthrough("b"))
            .node(passthrough("c"))
            .edge("a", "b")
            .edge("b", "c")
            .cycle_edge("c", "b")
            .build()
            .unwrap();
        assert_eq!(graph.exits(), ["c"]);
    }

    #[test]
    fn test_rejects_zero_capacity_edge() {
        let err = FlowBuilder::new()
            .node(passthrough("a"))
            .node(passthrough("b"))
            .edge_with_capacity("a", "b", 0)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, FloeError::InvalidGraph(_)));
    }
}
