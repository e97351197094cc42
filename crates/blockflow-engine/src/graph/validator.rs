use serde::Serialize;

use blockflow_core::types::{BlockDefinition, OutputField};

use crate::registry::BlockRegistry;

use super::edge::{Edge, EXEC_IN};
use super::node::Node;

/// Outcome of a connection check. `reason` is user-facing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionVerdict {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConnectionVerdict {
    pub fn allow() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Decide whether `source_handle` on `source` may connect to `target_handle`
/// on `target`.
///
/// The editor calls this to refuse a drag and the normalizer calls it to
/// filter saved wiring; both must go through this one function.
///
/// A target handle of `EXEC_IN` (or none) is an execution connection; any
/// other target handle names a data input. Unknown endpoints or unregistered
/// block types are allowed so graphs saved before type tags existed keep
/// loading. Missing type metadata on either side is never a mismatch.
pub fn validate_connection(
    registry: &BlockRegistry,
    source: Option<&Node>,
    target: Option<&Node>,
    source_handle: Option<&str>,
    target_handle: Option<&str>,
) -> ConnectionVerdict {
    let (Some(source), Some(target)) = (source, target) else {
        return ConnectionVerdict::allow();
    };
    let (Some(source_def), Some(target_def)) = (
        registry.definition(&source.block_type),
        registry.definition(&target.block_type),
    ) else {
        return ConnectionVerdict::allow();
    };

    let Some(field_name) = target_handle.filter(|h| !h.is_empty() && *h != EXEC_IN) else {
        if target_def.is_trigger() {
            return ConnectionVerdict::reject(format!(
                "'{}' is a trigger and cannot be run by another block",
                target_def.block_type
            ));
        }
        return ConnectionVerdict::allow();
    };

    let Some(field) = target_def.input(field_name) else {
        return ConnectionVerdict::reject(format!(
            "'{}' has no input named '{}'",
            target_def.block_type, field_name
        ));
    };

    if field.is_wallet_address() {
        return ConnectionVerdict::reject(format!(
            "'{}' always uses the connected wallet address",
            field.name
        ));
    }

    let output = bound_output(source_def, source_handle);
    let output_type = output.and_then(|o| o.value_type.as_deref());

    if let (Some(output_type), Some(accepts)) = (output_type, field.accepts.as_ref()) {
        if !accepts.iter().any(|a| a == output_type) {
            return ConnectionVerdict::reject(format!(
                "'{}' expects {} but '{}' produces {}",
                field.name,
                accepts.join(" or "),
                output.map(|o| o.name.as_str()).unwrap_or_default(),
                output_type
            ));
        }
    }

    ConnectionVerdict::allow()
}

/// Output a data connection reads: the named output when the source declares
/// it, otherwise the source's first declared output.
pub(crate) fn bound_output<'a>(
    source_def: &'a BlockDefinition,
    source_handle: Option<&str>,
) -> Option<&'a OutputField> {
    source_handle
        .and_then(|h| source_def.output(h))
        .or_else(|| source_def.first_output())
}

/// Check an existing edge, looking its endpoints up in `nodes`.
pub fn validate_edge(registry: &BlockRegistry, nodes: &[Node], edge: &Edge) -> ConnectionVerdict {
    let find = |id: &str| nodes.iter().find(|n| n.id == id);
    validate_connection(
        registry,
        find(&edge.source),
        find(&edge.target),
        edge.source_handle.as_deref(),
        edge.target_handle.as_deref(),
    )
}
