//! Fake blocks and fixtures shared by Blockflow tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::{Block, Signer};
use blockflow_core::trigger::TriggerSink;
use blockflow_core::types::*;

/// Build an output map from pairs.
pub fn outputs(pairs: &[(&str, &str)]) -> Outputs {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Build an input map from pairs.
pub fn inputs(pairs: &[(&str, &str)]) -> Inputs {
    outputs(pairs)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[derive(Clone)]
enum Behavior {
    /// Every declared output gets `"<type>.<output>"`.
    Default,
    Fixed(Outputs),
    Fail(String),
    Halt(String),
}

/// Shared record of the inputs a fake block was run with.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Inputs>>>,
}

impl CallLog {
    fn push(&self, inputs: Inputs) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(inputs);
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inputs of the `index`-th call.
    pub fn call(&self, index: usize) -> Option<Inputs> {
        self.calls.lock().ok().and_then(|c| c.get(index).cloned())
    }

    /// Value of `field` in the most recent call.
    pub fn last_input(&self, field: &str) -> Option<String> {
        self.calls
            .lock()
            .ok()
            .and_then(|c| c.last().and_then(|i| i.get(field).cloned()))
    }
}

#[derive(Default)]
struct TapState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    failures_left: AtomicU32,
    sink: Mutex<Option<TriggerSink>>,
    inputs: Mutex<Option<Inputs>>,
}

/// Observes a fake block's subscriptions and fires its trigger.
#[derive(Clone, Default)]
pub struct ListenerTap {
    state: Arc<TapState>,
}

impl ListenerTap {
    /// Number of times `subscribe` was entered.
    pub fn opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Number of listeners that observed cancellation and returned.
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Inputs the most recent `subscribe` call received.
    pub fn inputs(&self) -> Option<Inputs> {
        self.state.inputs.lock().ok().and_then(|i| i.clone())
    }

    /// Fire through the most recent sink. `false` if none or dropped.
    pub fn fire(&self, outputs: Outputs) -> bool {
        let sink = self.state.sink.lock().ok().and_then(|s| s.clone());
        sink.map(|s| s.fire(outputs)).unwrap_or(false)
    }

    pub async fn wait_opened(&self, n: usize) -> bool {
        wait_until(|| self.opened() >= n).await
    }

    pub async fn wait_closed(&self, n: usize) -> bool {
        wait_until(|| self.closed() >= n).await
    }
}

/// Configurable block double.
pub struct FakeBlock {
    definition: BlockDefinition,
    behavior: Behavior,
    delay: Option<Duration>,
    calls: CallLog,
    tap: Option<ListenerTap>,
}

impl FakeBlock {
    pub fn new(definition: BlockDefinition) -> Self {
        Self {
            definition,
            behavior: Behavior::Default,
            delay: None,
            calls: CallLog::default(),
            tap: None,
        }
    }

    fn with_fields(
        block_type: &str,
        category: BlockCategory,
        input_names: &[&str],
        output_names: &[&str],
    ) -> Self {
        let mut def = BlockDefinition::new(block_type, category);
        for name in input_names {
            def = def.with_input(InputField::text(*name));
        }
        for name in output_names {
            def = def.with_output(OutputField::new(*name));
        }
        Self::new(def)
    }

    pub fn trigger(block_type: &str, output_names: &[&str]) -> Self {
        Self::with_fields(block_type, BlockCategory::Trigger, &[], output_names)
    }

    pub fn action(block_type: &str, input_names: &[&str], output_names: &[&str]) -> Self {
        Self::with_fields(block_type, BlockCategory::Action, input_names, output_names)
    }

    pub fn filter(block_type: &str, input_names: &[&str], output_names: &[&str]) -> Self {
        Self::with_fields(block_type, BlockCategory::Filter, input_names, output_names)
    }

    pub fn display(block_type: &str, input_names: &[&str]) -> Self {
        Self::with_fields(block_type, BlockCategory::Display, input_names, &[])
    }

    pub fn with_input(mut self, field: InputField) -> Self {
        self.definition.inputs.push(field);
        self
    }

    pub fn with_output(mut self, field: OutputField) -> Self {
        self.definition.outputs.push(field);
        self
    }

    /// Always return these outputs.
    pub fn returning(mut self, pairs: &[(&str, &str)]) -> Self {
        self.behavior = Behavior::Fixed(outputs(pairs));
        self
    }

    /// Always fail with `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.behavior = Behavior::Fail(message.to_string());
        self
    }

    /// Always halt the branch with `reason`.
    pub fn halting(mut self, reason: &str) -> Self {
        self.behavior = Behavior::Halt(reason.to_string());
        self
    }

    /// Sleep before resolving each run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Handle to the recorded run inputs.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    /// Make this block subscribable and return a tap on its listener.
    pub fn subscribable(&mut self) -> ListenerTap {
        let tap = ListenerTap::default();
        self.tap = Some(tap.clone());
        tap
    }

    /// Make the first `n` subscribe attempts fail.
    pub fn failing_subscriptions(self, n: u32) -> Self {
        if let Some(ref tap) = self.tap {
            tap.state.failures_left.store(n, Ordering::SeqCst);
        }
        self
    }

    fn default_outputs(&self) -> Outputs {
        self.definition
            .outputs
            .iter()
            .map(|o| {
                (
                    o.name.clone(),
                    format!("{}.{}", self.definition.block_type, o.name),
                )
            })
            .collect()
    }
}

impl Block for FakeBlock {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, inputs: Inputs, _ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            self.calls.push(inputs);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.behavior {
                Behavior::Default => Ok(self.default_outputs()),
                Behavior::Fixed(out) => Ok(out.clone()),
                Behavior::Fail(msg) => Err(BlockflowError::block(
                    self.definition.block_type.clone(),
                    msg.clone(),
                )),
                Behavior::Halt(reason) => Err(BlockflowError::Halted(reason.clone())),
            }
        })
    }

    fn subscribes(&self) -> bool {
        self.tap.is_some()
    }

    fn subscribe(
        &self,
        inputs: Inputs,
        sink: TriggerSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let Some(ref tap) = self.tap else {
                return Err(BlockflowError::NotSubscribable(
                    self.definition.block_type.clone(),
                ));
            };
            let state = &tap.state;
            state.opened.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut slot) = state.inputs.lock() {
                *slot = Some(inputs);
            }

            let failing = state
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BlockflowError::Subscription {
                    node: sink.node_id().to_string(),
                    message: "listener dropped".into(),
                });
            }

            if let Ok(mut slot) = state.sink.lock() {
                *slot = Some(sink);
            }
            cancel.cancelled().await;
            state.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Signer that returns canned values and counts requests.
#[derive(Default)]
pub struct FakeSigner {
    pub sent: AtomicUsize,
    pub signed: AtomicUsize,
}

impl Signer for FakeSigner {
    fn send_transaction(&self, tx: TransactionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(format!("0xtx-{}", tx.to))
        })
    }

    fn sign_typed_data(&self, _typed_data: serde_json::Value) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.signed.fetch_add(1, Ordering::SeqCst);
            Ok("0xsig".to_string())
        })
    }
}
