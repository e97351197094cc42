//! Agent graphs: what the editor saves and what the engine runs.
//!
//! A saved flow is a list of `Node`s (block instances) and `Edge`s. Edges may
//! be legacy data connections or execution edges; `normalize` folds the data
//! connections into per-node `input_sources` and keeps only execution edges.
//! `build_connected_model` indexes the canonical result into an `AgentGraph`
//! that the executor and subscription manager share.
//!
//! `validate_connection` is the single connection predicate used both by the
//! editor (to refuse a drag) and by the normalizer (to filter saved wiring).

pub mod edge;
pub mod flow;
pub mod model;
pub mod node;
pub mod normalize;
pub mod validator;

pub use edge::{Edge, EXEC_IN, EXEC_OUT};
pub use flow::FlowDocument;
pub use model::{build_connected_model, AgentGraph};
pub use node::{InputSource, Node, Position};
pub use normalize::{normalize, normalize_document};
pub use validator::{validate_connection, validate_edge, ConnectionVerdict};
