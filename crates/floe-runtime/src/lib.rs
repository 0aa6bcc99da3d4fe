//! Flow runtime: nodes connected by bounded edges, run as one worker task
//! per node.
//!
//! A [`FlowBuilder`] declares nodes and edges and validates the wiring.
//! [`Graph::run`] wires ingress and egress and returns a [`Flow`] that
//! callers feed with [`Flow::emit`] and drain with [`Flow::fetch`].

pub mod context;
pub mod edge;
pub mod flow;
pub mod graph;
pub mod node;
pub mod routers;
pub mod schema;
pub mod scope;
pub mod stream;

pub use context::{Context, EGRESS};
pub use edge::Floe;
pub use flow::Flow;
pub use graph::{EdgeKind, EdgeSpec, FlowBuilder, Graph};
pub use node::{Node, NodeHandler, NodeOutput};
pub use routers::{join_k, predicate_router, Route};
pub use schema::SchemaValidator;
pub use scope::{TraceGuard, TraceRegistry};
pub use stream::ChunkAssembler;
