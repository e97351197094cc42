use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Explicit binding from one of a node's inputs to an upstream output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputSource {
    #[serde(rename = "sourceNodeId")]
    pub source_node_id: String,
    #[serde(rename = "outputName")]
    pub output_name: String,
}

impl InputSource {
    pub fn new(source_node_id: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            output_name: output_name.into(),
        }
    }
}

/// Canvas position. Only carried through so saved flows round-trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Build a position, coercing non-finite coordinates to 0.
    pub fn coerced(x: Option<f64>, y: Option<f64>) -> Self {
        let finite = |v: Option<f64>| v.filter(|f| f.is_finite()).unwrap_or(0.0);
        Self {
            x: finite(x),
            y: finite(y),
        }
    }
}

/// A block instance placed in an agent graph.
///
/// `inputs` holds what the user typed (literals or `{{node.output}}`
/// placeholders). `input_sources` holds wired bindings, which take precedence
/// over the literal at run time.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier within the graph.
    pub id: String,
    /// Registry key of the block this node instantiates.
    pub block_type: String,
    pub inputs: BTreeMap<String, String>,
    pub input_sources: BTreeMap<String, InputSource>,
    pub position: Position,
}

impl Node {
    /// Create a node with no inputs.
    pub fn new(id: impl Into<String>, block_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            block_type: block_type.into(),
            inputs: BTreeMap::new(),
            input_sources: BTreeMap::new(),
            position: Position::default(),
        }
    }

    /// Set a literal input value.
    pub fn with_input(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(field.into(), value.into());
        self
    }

    /// Bind an input to an upstream node's output.
    pub fn with_source(
        mut self,
        field: impl Into<String>,
        source_node_id: impl Into<String>,
        output_name: impl Into<String>,
    ) -> Self {
        self.input_sources
            .insert(field.into(), InputSource::new(source_node_id, output_name));
        self
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position::coerced(Some(x), Some(y));
        self
    }
}
