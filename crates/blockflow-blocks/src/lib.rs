//! Generic built-in blocks.
//!
//! Protocol integrations (swaps, messaging, wallet signing) live with the
//! embedding application and are registered next to these.

pub mod builtin;

use blockflow_engine::registry::BlockRegistry;

/// Register every built-in block.
pub fn register_builtins(registry: &mut BlockRegistry) {
    registry.register(builtin::ManualTrigger::new());
    registry.register(builtin::IntervalTrigger::new());
    registry.register(builtin::CompareFilter::new());
    registry.register(builtin::JoinText::new());
    registry.register(builtin::WalletInfo::new());
    registry.register(builtin::LogDisplay::new());
}

/// A registry holding only the built-in blocks.
pub fn builtin_registry() -> BlockRegistry {
    let mut registry = BlockRegistry::new();
    register_builtins(&mut registry);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        assert_eq!(
            registry.list(),
            vec!["compare", "interval_trigger", "join_text", "log", "manual_trigger", "wallet_info"]
        );
        assert!(registry.is_trigger("interval_trigger"));
        assert!(registry.get("interval_trigger").unwrap().subscribes());
        assert!(!registry.get("manual_trigger").unwrap().subscribes());
    }
}
