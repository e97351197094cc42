use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{BlockflowError, Result};
use crate::trigger::TriggerSink;
use crate::types::*;

/// A typed unit of behavior placed on the canvas.
pub trait Block: Send + Sync + 'static {
    /// Block type, category, and declared fields.
    fn definition(&self) -> &BlockDefinition;

    /// Run once with fully resolved inputs.
    fn run(&self, inputs: Inputs, ctx: RunContext) -> BoxFuture<'_, Result<Outputs>>;

    /// Whether this block can hold a long-lived listener.
    fn subscribes(&self) -> bool {
        false
    }

    /// Listen for external events, pushing each one into `sink`.
    ///
    /// Must return `Ok(())` once `cancel` fires. Returning an error before
    /// that counts as a listener failure and may be retried by the caller.
    fn subscribe(
        &self,
        inputs: Inputs,
        sink: TriggerSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        let _ = (inputs, sink, cancel);
        let block_type = self.definition().block_type.clone();
        Box::pin(async move { Err(BlockflowError::NotSubscribable(block_type)) })
    }

    /// Per-block timeout override in seconds.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }
}

/// Wallet capabilities supplied by the caller.
pub trait Signer: Send + Sync + 'static {
    /// Submit a transaction and return its hash.
    fn send_transaction(&self, tx: TransactionRequest) -> BoxFuture<'_, Result<String>>;

    /// Sign typed data and return the signature.
    fn sign_typed_data(&self, typed_data: serde_json::Value) -> BoxFuture<'_, Result<String>>;
}
