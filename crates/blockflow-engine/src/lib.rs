pub mod executor;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod subscription;

pub use executor::{effective_inputs, GraphExecutor, NodeResult, NodeStatus, RunOptions, RunReport};
pub use graph::{
    build_connected_model, normalize, normalize_document, validate_connection, validate_edge,
    AgentGraph, ConnectionVerdict, Edge, FlowDocument, InputSource, Node, EXEC_IN, EXEC_OUT,
};
pub use registry::BlockRegistry;
pub use resolver::{resolve, OutputCache};
pub use subscription::{AgentSubscription, SubscriptionManager};
