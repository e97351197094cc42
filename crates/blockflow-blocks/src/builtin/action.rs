use futures::future::BoxFuture;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::Block;
use blockflow_core::types::*;

// ── JoinText ────────────────────────────────────────────────────

pub struct JoinText {
    definition: BlockDefinition,
}

impl JoinText {
    pub fn new() -> Self {
        Self {
            definition: BlockDefinition::new("join_text", BlockCategory::Action)
                .with_input(InputField::text("first"))
                .with_input(InputField::text("separator").with_default(" "))
                .with_input(InputField::text("second"))
                .with_output(OutputField::typed("text", "string")),
        }
    }
}

impl Default for JoinText {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for JoinText {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, inputs: Inputs, _ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let get = |k: &str| inputs.get(k).map(String::as_str).unwrap_or("");
            let text = format!("{}{}{}", get("first"), get("separator"), get("second"));
            let mut out = Outputs::new();
            out.insert("text".into(), text);
            Ok(out)
        })
    }
}

// ── WalletInfo ──────────────────────────────────────────────────

/// Exposes the connected wallet address to downstream blocks.
pub struct WalletInfo {
    definition: BlockDefinition,
}

impl WalletInfo {
    pub fn new() -> Self {
        Self {
            definition: BlockDefinition::new("wallet_info", BlockCategory::Action)
                .with_input(InputField::wallet_address("address"))
                .with_output(OutputField::typed("address", "address")),
        }
    }
}

impl Default for WalletInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for WalletInfo {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, inputs: Inputs, _ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let address = inputs
                .get("address")
                .filter(|a| !a.is_empty())
                .cloned()
                .ok_or_else(|| BlockflowError::SignerUnavailable("wallet_info".into()))?;
            let mut out = Outputs::new();
            out.insert("address".into(), address);
            Ok(out)
        })
    }
}
