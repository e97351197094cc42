use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};

use super::edge::Edge;
use super::node::{InputSource, Node, Position};

/// A saved flow: `{ nodes: [{id, blockType, data}], edges: [...] }`.
///
/// Parsing is lenient. Entries that cannot be understood are dropped and
/// malformed fields fall back to defaults, so a partially corrupt save still
/// loads. Only text that is not a JSON object at all is an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowDocument {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

#[derive(Serialize)]
struct NodeRecord<'a> {
    id: &'a str,
    #[serde(rename = "blockType")]
    block_type: &'a str,
    data: NodeData<'a>,
    position: Position,
}

#[derive(Serialize)]
struct NodeData<'a> {
    inputs: &'a BTreeMap<String, String>,
    #[serde(rename = "inputSources")]
    input_sources: &'a BTreeMap<String, InputSource>,
}

#[derive(Serialize)]
struct DocumentRecord<'a> {
    nodes: Vec<NodeRecord<'a>>,
    edges: &'a [Edge],
}

impl FlowDocument {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| BlockflowError::InvalidFlow("expected a JSON object".into()))?;

        let nodes = array_field(obj, "nodes")
            .iter()
            .filter_map(|v| {
                let parsed = parse_node(v);
                if parsed.is_none() {
                    debug!("Skipping unreadable node entry");
                }
                parsed
            })
            .collect();

        let edges = array_field(obj, "edges")
            .iter()
            .filter_map(|v| {
                let parsed = parse_edge(v);
                if parsed.is_none() {
                    debug!("Skipping unreadable edge entry");
                }
                parsed
            })
            .collect();

        Ok(Self { nodes, edges })
    }

    pub fn to_value(&self) -> Value {
        let record = DocumentRecord {
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeRecord {
                    id: &n.id,
                    block_type: &n.block_type,
                    data: NodeData {
                        inputs: &n.inputs,
                        input_sources: &n.input_sources,
                    },
                    position: n.position,
                })
                .collect(),
            edges: &self.edges,
        };
        serde_json::to_value(record).unwrap_or(Value::Null)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }
}

fn array_field<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    obj.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Ids and handles may have been saved as numbers.
fn as_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Input values are strings at runtime; other scalars keep their JSON text.
fn as_input_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn parse_node(value: &Value) -> Option<Node> {
    let obj = value.as_object()?;
    let id = obj.get("id").and_then(as_key)?;
    let data = obj.get("data").and_then(Value::as_object);

    let block_type = obj
        .get("blockType")
        .or_else(|| data.and_then(|d| d.get("blockType")))
        .or_else(|| obj.get("type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let inputs = data
        .and_then(|d| d.get("inputs"))
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| as_input_value(v).map(|s| (k.clone(), s)))
                .collect()
        })
        .unwrap_or_default();

    let input_sources = data
        .and_then(|d| d.get("inputSources"))
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(field, v)| {
                    let src = v.as_object()?;
                    let node = src.get("sourceNodeId").and_then(as_key)?;
                    let output = src.get("outputName").and_then(as_key)?;
                    Some((field.clone(), InputSource::new(node, output)))
                })
                .collect()
        })
        .unwrap_or_default();

    let position = obj
        .get("position")
        .and_then(Value::as_object)
        .map(|p| {
            Position::coerced(
                p.get("x").and_then(Value::as_f64),
                p.get("y").and_then(Value::as_f64),
            )
        })
        .unwrap_or_default();

    Some(Node {
        id,
        block_type,
        inputs,
        input_sources,
        position,
    })
}

fn parse_edge(value: &Value) -> Option<Edge> {
    let obj = value.as_object()?;
    Some(Edge {
        id: obj.get("id").and_then(as_key).unwrap_or_default(),
        source: obj.get("source").and_then(as_key)?,
        target: obj.get("target").and_then(as_key)?,
        source_handle: obj.get("sourceHandle").and_then(as_key),
        target_handle: obj.get("targetHandle").and_then(as_key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::{EXEC_IN, EXEC_OUT};

    #[test]
    fn test_parse_saved_flow() {
        let doc = FlowDocument::from_json(
            r#"{
                "nodes": [
                    {"id": "t1", "blockType": "price_watch", "data": {"inputs": {"token": "ETH"}}},
                    {"id": "a1", "type": "swap", "position": {"x": 10, "y": 20},
                     "data": {"inputs": {"amount": 5, "note": null},
                              "inputSources": {"token": {"sourceNodeId": "t1", "outputName": "token"}}}}
                ],
                "edges": [
                    {"id": "e1", "source": "t1", "target": "a1", "sourceHandle": "exec-out", "targetHandle": "exec-in"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[0].block_type, "price_watch");
        assert_eq!(doc.nodes[1].block_type, "swap");
        assert_eq!(doc.nodes[1].inputs.get("amount").map(String::as_str), Some("5"));
        assert!(!doc.nodes[1].inputs.contains_key("note"));
        assert_eq!(doc.nodes[1].input_sources["token"], InputSource::new("t1", "token"));
        assert_eq!(doc.nodes[1].position, Position { x: 10.0, y: 20.0 });
        assert!(doc.edges[0].is_execution());
    }

    #[test]
    fn test_corrupt_entries_are_dropped() {
        let doc = FlowDocument::from_json(
            r#"{
                "nodes": [
                    {"blockType": "no_id"},
                    "garbage",
                    {"id": "ok", "blockType": "x", "position": {"x": "left", "y": null},
                     "data": {"inputs": [1, 2], "inputSources": {"f": {"sourceNodeId": "a"}}}}
                ],
                "edges": [
                    {"id": "e1", "source": "ok"},
                    {"source": "ok", "target": "ok", "sourceHandle": null}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(doc.nodes.len(), 1);
        let node = &doc.nodes[0];
        assert!(node.inputs.is_empty());
        assert!(node.input_sources.is_empty());
        assert_eq!(node.position, Position::default());

        assert_eq!(doc.edges.len(), 1);
        assert_eq!(doc.edges[0].id, "");
        assert!(doc.edges[0].source_handle.is_none());
    }

    #[test]
    fn test_missing_sections_load_empty() {
        let doc = FlowDocument::from_json("{}").unwrap();
        assert!(doc.nodes.is_empty());
        assert!(doc.edges.is_empty());
    }

    #[test]
    fn test_non_object_is_error() {
        assert!(matches!(
            FlowDocument::from_json("[1, 2]"),
            Err(BlockflowError::InvalidFlow(_))
        ));
        assert!(matches!(
            FlowDocument::from_json("not json"),
            Err(BlockflowError::Json(_))
        ));
    }

    #[test]
    fn test_to_value_reloads_identically() {
        let doc = FlowDocument::new(
            vec![
                Node::new("t1", "price_watch").with_input("token", "ETH"),
                Node::new("a1", "swap").with_source("amount", "t1", "price").at(5.0, 6.0),
            ],
            vec![Edge::execution("e1", "t1", "a1")],
        );

        let value = doc.to_value();
        assert_eq!(value["nodes"][1]["data"]["inputSources"]["amount"]["outputName"], "price");
        assert_eq!(value["edges"][0]["sourceHandle"], EXEC_OUT);
        assert_eq!(value["edges"][0]["targetHandle"], EXEC_IN);

        let reloaded = FlowDocument::from_value(&value).unwrap();
        assert_eq!(reloaded, doc);
    }
}
