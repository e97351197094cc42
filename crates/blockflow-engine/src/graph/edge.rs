use serde::{Deserialize, Serialize};

/// Source handle marking an execution output.
pub const EXEC_OUT: &str = "exec-out";
/// Target handle marking an execution input.
pub const EXEC_IN: &str = "exec-in";

/// An edge as drawn in the editor.
///
/// After normalization every edge is an execution edge
/// (`EXEC_OUT` → `EXEC_IN`). Before that, an edge may be a legacy data
/// connection whose handles name block outputs and inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl Edge {
    /// Create a canonical execution edge.
    pub fn execution(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: Some(EXEC_OUT.to_string()),
            target_handle: Some(EXEC_IN.to_string()),
        }
    }

    /// Create an edge with arbitrary handles (legacy data wiring).
    pub fn wired(
        id: impl Into<String>,
        source: impl Into<String>,
        source_handle: Option<&str>,
        target: impl Into<String>,
        target_handle: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: source_handle.map(str::to_string),
            target_handle: target_handle.map(str::to_string),
        }
    }

    /// Both handles are the canonical execution markers.
    pub fn is_execution(&self) -> bool {
        self.source_handle.as_deref() == Some(EXEC_OUT)
            && self.target_handle.as_deref() == Some(EXEC_IN)
    }

    /// Legacy heuristic: anything not landing on `EXEC_IN` carried data.
    pub fn is_data(&self) -> bool {
        self.target_handle.as_deref() != Some(EXEC_IN)
    }

    /// Target input named by a data edge, if any.
    pub fn data_field(&self) -> Option<&str> {
        self.target_handle
            .as_deref()
            .filter(|h| *h != EXEC_IN && !h.is_empty())
    }
}
