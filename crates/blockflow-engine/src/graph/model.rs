use std::collections::{HashMap, HashSet, VecDeque};

use crate::registry::BlockRegistry;

use super::edge::Edge;
use super::normalize::normalize;
use super::node::Node;

/// Canonical, immutable agent graph ready for execution.
///
/// Built from scratch on every edit by [`build_connected_model`]. Holds only
/// execution edges, with adjacency precomputed in edge order.
#[derive(Debug, Clone, Default)]
pub struct AgentGraph {
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    edges: Vec<Edge>,
    successors: HashMap<String, Vec<String>>,
    predecessors: HashMap<String, Vec<String>>,
}

/// Normalize `nodes`/`edges` and index the result.
pub fn build_connected_model(registry: &BlockRegistry, nodes: &[Node], edges: &[Edge]) -> AgentGraph {
    let (nodes, edges) = normalize(registry, nodes, edges);
    AgentGraph::from_canonical(nodes, edges)
}

impl AgentGraph {
    /// Index already-normalized nodes and edges.
    pub(crate) fn from_canonical(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let order: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let nodes: HashMap<String, Node> = nodes.into_iter().map(|n| (n.id.clone(), n)).collect();

        let mut successors: HashMap<String, Vec<String>> = HashMap::new();
        let mut predecessors: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &edges {
            successors
                .entry(edge.source.clone())
                .or_default()
                .push(edge.target.clone());
            predecessors
                .entry(edge.target.clone())
                .or_default()
                .push(edge.source.clone());
        }

        Self {
            nodes,
            order,
            edges,
            successors,
            predecessors,
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in their saved order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct execution successors, in edge order.
    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct execution predecessors, in edge order.
    pub fn predecessors(&self, id: &str) -> &[String] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes reachable from `start`, excluding `start`, breadth-first.
    pub fn reachable_from(&self, start: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        seen.insert(start);
        queue.push_back(start);

        while let Some(id) = queue.pop_front() {
            for next in self.successors(id) {
                if seen.insert(next.as_str()) {
                    out.push(next.clone());
                    queue.push_back(next.as_str());
                }
            }
        }
        out
    }
}
