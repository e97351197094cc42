use std::collections::{HashMap, HashSet};

use tracing::debug;

use blockflow_core::types::BlockDefinition;

use crate::registry::BlockRegistry;

use super::edge::{Edge, EXEC_OUT};
use super::flow::FlowDocument;
use super::node::{InputSource, Node};
use super::validator::{bound_output, validate_connection};

/// Rebuild editor state into the canonical model.
///
/// - nodes are deduplicated by id, first occurrence wins;
/// - edges with unknown endpoints, and self-loops, are dropped;
/// - every other edge is kept or dropped by `validate_connection`;
/// - legacy data edges become `input_sources` bindings plus an execution edge;
/// - only `EXEC_OUT` → `EXEC_IN` edges into non-trigger nodes survive.
///
/// Never fails and never mutates its input. Running it on its own output
/// returns the same graph.
pub fn normalize(registry: &BlockRegistry, nodes: &[Node], edges: &[Edge]) -> (Vec<Node>, Vec<Edge>) {
    let mut out_nodes: Vec<Node> = Vec::with_capacity(nodes.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(nodes.len());

    for node in nodes {
        if node.id.is_empty() {
            debug!("Dropping node without id");
            continue;
        }
        if index.contains_key(&node.id) {
            debug!(node_id = %node.id, "Dropping duplicate node");
            continue;
        }
        index.insert(node.id.clone(), out_nodes.len());
        out_nodes.push(node.clone());
    }

    // Bindings must point at another node that still exists.
    for node in &mut out_nodes {
        let own_id = node.id.clone();
        node.input_sources.retain(|field, src| {
            let keep = src.source_node_id != own_id
                && !src.output_name.is_empty()
                && index.contains_key(&src.source_node_id);
            if !keep {
                debug!(node_id = %own_id, field = %field, "Dropping dangling input source");
            }
            keep
        });
    }

    let mut out_edges: Vec<Edge> = Vec::with_capacity(edges.len());
    let mut pairs: HashSet<(String, String)> = HashSet::new();
    let mut ids: HashSet<String> = HashSet::new();

    for edge in edges {
        if edge.source == edge.target {
            debug!(edge_id = %edge.id, "Dropping self-loop");
            continue;
        }
        let (Some(&si), Some(&ti)) = (index.get(&edge.source), index.get(&edge.target)) else {
            debug!(edge_id = %edge.id, "Dropping edge with unknown endpoint");
            continue;
        };

        let verdict = validate_connection(
            registry,
            Some(&out_nodes[si]),
            Some(&out_nodes[ti]),
            edge.source_handle.as_deref(),
            edge.target_handle.as_deref(),
        );
        if !verdict.valid {
            debug!(
                edge_id = %edge.id,
                reason = verdict.reason.as_deref().unwrap_or_default(),
                "Dropping rejected edge"
            );
            continue;
        }

        if let Some(field) = edge.data_field() {
            let source_def = registry.definition(&out_nodes[si].block_type);
            if let Some(output) = migrated_output(source_def, edge.source_handle.as_deref()) {
                let source_id = out_nodes[si].id.clone();
                out_nodes[ti]
                    .input_sources
                    .entry(field.to_string())
                    .or_insert_with(|| InputSource::new(source_id, output));
            }
        }

        if registry.is_trigger(&out_nodes[ti].block_type) {
            debug!(edge_id = %edge.id, target = %edge.target, "Dropping edge into trigger");
            continue;
        }

        if !pairs.insert((edge.source.clone(), edge.target.clone())) {
            continue;
        }

        let id = unique_edge_id(&edge.id, &edge.source, &edge.target, &ids);
        ids.insert(id.clone());
        out_edges.push(Edge::execution(id, edge.source.clone(), edge.target.clone()));
    }

    (out_nodes, out_edges)
}

/// Normalize a whole saved flow.
pub fn normalize_document(registry: &BlockRegistry, doc: &FlowDocument) -> FlowDocument {
    let (nodes, edges) = normalize(registry, &doc.nodes, &doc.edges);
    FlowDocument::new(nodes, edges)
}

/// Output a legacy data edge binds to. An unregistered source keeps the
/// saved name.
fn migrated_output(source_def: Option<&BlockDefinition>, handle: Option<&str>) -> Option<String> {
    match source_def {
        Some(def) => bound_output(def, handle).map(|o| o.name.clone()),
        None => handle
            .filter(|h| !h.is_empty() && *h != EXEC_OUT)
            .map(str::to_string),
    }
}

fn unique_edge_id(current: &str, source: &str, target: &str, taken: &HashSet<String>) -> String {
    if !current.is_empty() && !taken.contains(current) {
        return current.to_string();
    }
    let base = format!("e-{}-{}", source, target);
    let mut candidate = base.clone();
    let mut n = 2;
    while taken.contains(&candidate) {
        candidate = format!("{}-{}", base, n);
        n += 1;
    }
    candidate
}
