use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::traits::Block;
use blockflow_core::trigger::TriggerSink;
use blockflow_core::types::*;

// ── ManualTrigger ───────────────────────────────────────────────

/// Started by hand ("run once"). Passes `value` through.
pub struct ManualTrigger {
    definition: BlockDefinition,
}

impl ManualTrigger {
    pub fn new() -> Self {
        Self {
            definition: BlockDefinition::new("manual_trigger", BlockCategory::Trigger)
                .with_input(InputField::text("value"))
                .with_output(OutputField::typed("value", "string")),
        }
    }
}

impl Default for ManualTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Block for ManualTrigger {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, inputs: Inputs, _ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let mut out = Outputs::new();
            out.insert(
                "value".into(),
                inputs.get("value").cloned().unwrap_or_default(),
            );
            Ok(out)
        })
    }
}

// ── IntervalTrigger ─────────────────────────────────────────────

/// Fires every `interval_secs` while subscribed.
pub struct IntervalTrigger {
    definition: BlockDefinition,
}

impl IntervalTrigger {
    pub fn new() -> Self {
        Self {
            definition: BlockDefinition::new("interval_trigger", BlockCategory::Trigger)
                .with_input(InputField::number("interval_secs").with_default("60"))
                .with_output(OutputField::typed("tick", "number"))
                .with_output(OutputField::typed("timestamp", "string")),
        }
    }
}

impl Default for IntervalTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Rejects values that round to zero or do not fit in a `Duration`.
fn parse_interval(inputs: &Inputs) -> Result<Duration> {
    let raw = inputs.get("interval_secs").map(String::as_str).unwrap_or("");
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|period| !period.is_zero())
        .ok_or_else(|| {
            BlockflowError::block(
                "interval_trigger",
                format!("interval_secs must be a positive number, got '{}'", raw),
            )
        })
}

fn tick_outputs(tick: u64) -> Outputs {
    let mut out = Outputs::new();
    out.insert("tick".into(), tick.to_string());
    out.insert("timestamp".into(), Utc::now().to_rfc3339());
    out
}

impl Block for IntervalTrigger {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, _inputs: Inputs, _ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move { Ok(tick_outputs(0)) })
    }

    fn subscribes(&self) -> bool {
        true
    }

    fn subscribe(
        &self,
        inputs: Inputs,
        sink: TriggerSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let period = parse_interval(&inputs)?;
            let start = tokio::time::Instant::now()
                .checked_add(period)
                .filter(|first| first.checked_add(period).is_some())
                .ok_or_else(|| {
                    BlockflowError::block(
                        "interval_trigger",
                        format!("interval_secs of {}s is too large", period.as_secs()),
                    )
                })?;
            let mut ticker = tokio::time::interval_at(start, period);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        tick += 1;
                        if !sink.fire(tick_outputs(tick)) {
                            debug!(node_id = %sink.node_id(), tick, "Interval tick not delivered");
                        }
                    }
                }
            }
        })
    }
}
