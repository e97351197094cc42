use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use blockflow_core::types::Outputs;

/// Per-run memo of node outputs, keyed by node id.
///
/// A node id appears at most once: the executor inserts each node's outputs
/// when it completes and never runs a node twice.
#[derive(Debug, Clone, Default)]
pub struct OutputCache {
    payload: Option<Outputs>,
    entries: HashMap<String, Outputs>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache seeded with a run's trigger payload under the start node.
    pub fn seeded(start_node: impl Into<String>, outputs: Outputs) -> Self {
        let mut entries = HashMap::new();
        entries.insert(start_node.into(), outputs.clone());
        Self {
            payload: Some(outputs),
            entries,
        }
    }

    pub fn get(&self, node_id: &str, output: &str) -> Option<&str> {
        self.entries
            .get(node_id)
            .and_then(|o| o.get(output))
            .map(String::as_str)
    }

    pub fn outputs(&self, node_id: &str) -> Option<&Outputs> {
        self.entries.get(node_id)
    }

    /// The trigger payload the run was seeded with. Kept even when a
    /// non-trigger start node later replaces its own entry.
    pub fn payload(&self) -> Option<&Outputs> {
        self.payload.as_ref()
    }

    pub fn insert(&mut self, node_id: impl Into<String>, outputs: Outputs) {
        self.entries.insert(node_id.into(), outputs);
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.entries.contains_key(node_id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn reference_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\{\{\s*([^{}]+?)\s*\}\}$").ok())
        .as_ref()
}

/// The token inside `value` when the whole value is a `{{...}}` reference.
pub fn reference_token(value: &str) -> Option<&str> {
    reference_pattern()?
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Resolve a field value against the cache.
///
/// Only a value that is entirely `{{token}}` is a reference; anything else is
/// returned as-is. `token` is `nodeId.outputName` or a bare output name read
/// from the run's trigger payload. A miss returns the literal placeholder.
pub fn resolve(value: &str, cache: &OutputCache) -> String {
    let Some(token) = reference_token(value) else {
        return value.to_string();
    };

    if let Some(hit) = lookup(token, cache) {
        return hit.to_string();
    }

    debug!(reference = %token, "Unresolved variable, keeping literal");
    value.to_string()
}

fn lookup<'a>(token: &str, cache: &'a OutputCache) -> Option<&'a str> {
    // Node ids may contain dots; prefer the shortest id, then the longest.
    let splits = [token.split_once('.'), token.rsplit_once('.')];
    for (node, output) in splits.into_iter().flatten() {
        if let Some(v) = cache.get(node, output) {
            return Some(v);
        }
    }

    if !token.contains('.') {
        return cache
            .payload()
            .and_then(|o| o.get(token))
            .map(String::as_str);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_test_utils::outputs;

    fn cache() -> OutputCache {
        let mut c = OutputCache::seeded("t1", outputs(&[("value", "42"), ("symbol", "ETH")]));
        c.insert("A", outputs(&[("x", "5")]));
        c.insert("swap.v2", outputs(&[("tx_hash", "0xabc")]));
        c
    }

    #[test]
    fn test_round_trip() {
        let c = cache();
        assert_eq!(resolve("{{A.x}}", &c), "5");
        assert_eq!(resolve("{{A.y}}", &c), "{{A.y}}");
        assert_eq!(resolve("{{B.x}}", &c), "{{B.x}}");
    }

    #[test]
    fn test_only_whole_value_is_a_reference() {
        let c = cache();
        assert_eq!(resolve("price is {{A.x}}", &c), "price is {{A.x}}");
        assert_eq!(resolve("{{A.x}} and {{A.x}}", &c), "{{A.x}} and {{A.x}}");
        assert_eq!(resolve("plain", &c), "plain");
        assert_eq!(resolve("", &c), "");
    }

    #[test]
    fn test_whitespace_inside_braces() {
        assert_eq!(resolve("{{ A.x }}", &cache()), "5");
    }

    #[test]
    fn test_dotted_node_id() {
        assert_eq!(resolve("{{swap.v2.tx_hash}}", &cache()), "0xabc");
    }

    #[test]
    fn test_bare_name_reads_trigger_payload() {
        let c = cache();
        assert_eq!(resolve("{{value}}", &c), "42");
        assert_eq!(resolve("{{missing}}", &c), "{{missing}}");
        assert_eq!(resolve("{{value}}", &OutputCache::new()), "{{value}}");
    }

    #[test]
    fn test_payload_survives_start_node_overwrite() {
        let mut c = cache();
        c.insert("t1", outputs(&[("value", "replaced")]));
        assert_eq!(resolve("{{value}}", &c), "42");
        assert_eq!(resolve("{{t1.value}}", &c), "replaced");
    }

    #[test]
    fn test_reference_token() {
        assert_eq!(reference_token("{{ a.b }}"), Some("a.b"));
        assert_eq!(reference_token("{{}}"), None);
        assert_eq!(reference_token("x{{a.b}}"), None);
    }
}
