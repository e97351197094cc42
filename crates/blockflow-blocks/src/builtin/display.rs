use futures::future::BoxFuture;
use tracing::info;

use blockflow_core::error::Result;
use blockflow_core::traits::Block;
use blockflow_core::types::*;

/// Writes `message` to the log and echoes it for live displays.
pub struct LogDisplay {
    definition: BlockDefinition,
}

impl LogDisplay {
    pub fn new() -> Self {
        Self {
            definition: BlockDefinition::new("log", BlockCategory::Display)
                .with_input(InputField::text("message"))
                .with_output(OutputField::typed("message", "string")),
        }
    }
}

impl Default for LogDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for LogDisplay {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, inputs: Inputs, _ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let message = inputs.get("message").cloned().unwrap_or_default();
            info!(message = %message, "Agent log");
            let mut out = Outputs::new();
            out.insert("message".into(), message);
            Ok(out)
        })
    }
}
