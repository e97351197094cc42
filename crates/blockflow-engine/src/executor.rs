use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use blockflow_core::config::EngineConfig;
use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::event::EventBus;
use blockflow_core::traits::Block;
use blockflow_core::types::{
    BlockCategory, BlockDefinition, FlowEvent, Inputs, Outputs, RunContext, RunId,
};

use crate::graph::{AgentGraph, Node};
use crate::registry::BlockRegistry;
use crate::resolver::{resolve, OutputCache};

/// How a node ended up in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// The block ran and produced outputs.
    Completed,
    /// Trigger start node; its outputs are the run's payload.
    Seeded,
    /// The block failed or timed out. Its subtree does not run.
    Failed,
    /// A filter stopped the branch.
    Halted,
    /// No predecessor completed.
    Skipped,
    /// Block type is not registered.
    Inert,
    /// The owning subscription was torn down before the node started.
    Cancelled,
}

/// Result of one node in a run.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    /// Error or halt reason, if any.
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl NodeResult {
    fn new(node_id: impl Into<String>, status: NodeStatus) -> Self {
        Self {
            node_id: node_id.into(),
            status,
            error: None,
            elapsed_ms: 0,
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub start_node: String,
    /// Per-node results in settle order.
    pub node_results: Vec<NodeResult>,
    /// Final output cache, including the seeded payload.
    pub outputs: OutputCache,
    pub total_elapsed_ms: u64,
    /// No node failed.
    pub succeeded: bool,
}

impl RunReport {
    pub fn status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_results
            .iter()
            .find(|r| r.node_id == node_id)
            .map(|r| r.status)
    }

    /// Nodes whose block actually ran to completion.
    pub fn executed(&self) -> usize {
        self.count(NodeStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(NodeStatus::Failed)
    }

    fn count(&self, status: NodeStatus) -> usize {
        self.node_results.iter().filter(|r| r.status == status).count()
    }
}

/// Per-run knobs supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub event_bus: Option<Arc<EventBus>>,
    /// Once cancelled, no `NodeOutput` events are published and no further
    /// nodes start. In-flight blocks still finish.
    pub teardown: Option<CancellationToken>,
    pub run_id: Option<RunId>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_teardown(mut self, token: CancellationToken) -> Self {
        self.teardown = Some(token);
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    fn torn_down(&self) -> bool {
        self.teardown
            .as_ref()
            .map(CancellationToken::is_cancelled)
            .unwrap_or(false)
    }
}

/// Compute the inputs a node's block is run (or subscribed) with.
///
/// For every declared field, in order of precedence:
/// 1. wallet-address fields take the context's wallet address;
/// 2. an `input_sources` binding reads the producer's output from the cache;
/// 3. the node's literal (or the field default), variable-resolved.
///
/// A binding whose producer has no output yet falls back to step 3. Fields
/// with no value at all are passed as empty strings.
pub fn effective_inputs(
    definition: &BlockDefinition,
    node: &Node,
    cache: &OutputCache,
    ctx: &RunContext,
) -> Inputs {
    let mut inputs = Inputs::new();
    for field in &definition.inputs {
        if field.is_wallet_address() {
            if let Some(ref address) = ctx.wallet_address {
                inputs.insert(field.name.clone(), address.clone());
                continue;
            }
        }

        let literal = node
            .inputs
            .get(&field.name)
            .or(field.default.as_ref())
            .map(|v| resolve(v, cache));

        let bound = node
            .input_sources
            .get(&field.name)
            .and_then(|src| cache.get(&src.source_node_id, &src.output_name))
            .map(str::to_string);

        let value = bound.or(literal).unwrap_or_default();
        inputs.insert(field.name.clone(), value);
    }
    inputs
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Running,
    Settled,
}

struct Slot {
    /// Reachable predecessors that have not settled.
    waiting: usize,
    /// At least one predecessor completed.
    live: bool,
    phase: Phase,
}

type NodeRun = BoxFuture<'static, (String, Result<Outputs>, u64)>;

/// Walks an agent graph downstream from a start node.
///
/// Nodes run once all their reachable predecessors have settled; siblings
/// run concurrently up to `max_concurrent_nodes`. Failures stay local to the
/// failing branch.
pub struct GraphExecutor {
    registry: Arc<BlockRegistry>,
    config: EngineConfig,
}

impl GraphExecutor {
    pub fn new(registry: Arc<BlockRegistry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    /// Run everything downstream of `start`.
    ///
    /// `trigger_outputs` seed the output cache under `start`. Returns an
    /// error only when `start` is missing, unregistered, or its own block
    /// fails; downstream failures are reported in the `RunReport` and on the
    /// event bus.
    pub async fn run_downstream(
        &self,
        graph: &AgentGraph,
        start: &str,
        trigger_outputs: Outputs,
        ctx: &RunContext,
        options: &RunOptions,
    ) -> Result<RunReport> {
        let started = Instant::now();
        let run_id = options.run_id.clone().unwrap_or_default();

        let start_node = graph
            .node(start)
            .ok_or_else(|| BlockflowError::NodeNotFound(start.to_string()))?;
        let start_block = self.registry.require(&start_node.block_type)?;

        info!(run_id = %run_id, start_node = %start, "Run started");
        self.emit(
            options,
            FlowEvent::RunStarted {
                run_id: run_id.clone(),
                start_node: start.to_string(),
                at: Utc::now(),
            },
        );

        let mut cache = OutputCache::seeded(start, trigger_outputs);
        let mut results: Vec<NodeResult> = Vec::new();

        let start_def = start_block.definition();
        if start_def.is_trigger() {
            if let Some(outputs) = cache.outputs(start) {
                self.emit_outputs(options, &run_id, start, start_def.category, outputs);
            }
            results.push(NodeResult::new(start, NodeStatus::Seeded));
        } else {
            let inputs = effective_inputs(start_def, start_node, &cache, ctx);
            self.emit(
                options,
                FlowEvent::NodeStarted {
                    run_id: run_id.clone(),
                    node_id: start.to_string(),
                },
            );
            let node_started = Instant::now();
            let result = invoke(
                start_block.clone(),
                start.to_string(),
                inputs,
                ctx.clone(),
                self.timeout_for(start_block.as_ref()),
            )
            .await;
            let elapsed_ms = node_started.elapsed().as_millis() as u64;

            match result {
                Ok(outputs) => {
                    self.emit_outputs(options, &run_id, start, start_def.category, &outputs);
                    cache.insert(start, outputs);
                    results.push(NodeResult {
                        elapsed_ms,
                        ..NodeResult::new(start, NodeStatus::Completed)
                    });
                }
                Err(e) if e.is_halt() => {
                    info!(run_id = %run_id, node_id = %start, reason = %e, "Start node halted");
                    self.emit(
                        options,
                        FlowEvent::NodeHalted {
                            run_id: run_id.clone(),
                            node_id: start.to_string(),
                            reason: e.to_string(),
                        },
                    );
                    results.push(NodeResult {
                        error: Some(e.to_string()),
                        elapsed_ms,
                        ..NodeResult::new(start, NodeStatus::Halted)
                    });
                    return Ok(self.finish(options, run_id, start, results, cache, started));
                }
                Err(e) => {
                    error!(run_id = %run_id, node_id = %start, error = %e, "Start node failed");
                    self.emit(
                        options,
                        FlowEvent::NodeFailed {
                            run_id: run_id.clone(),
                            node_id: start.to_string(),
                            error: e.to_string(),
                        },
                    );
                    return Err(e);
                }
            }
        }

        // Downstream scheduling over the reachable subgraph.
        let order = graph.reachable_from(start);
        let mut slots: HashMap<String, Slot> = order
            .iter()
            .map(|id| (id.clone(), Slot { waiting: 0, live: false, phase: Phase::Waiting }))
            .collect();
        for id in &order {
            let waiting = graph
                .predecessors(id)
                .iter()
                .filter(|p| slots.contains_key(p.as_str()) || p.as_str() == start)
                .count();
            if let Some(slot) = slots.get_mut(id) {
                slot.waiting = waiting;
            }
        }

        let mut ready: VecDeque<String> = VecDeque::new();
        settle(graph, start, true, &mut slots, &mut ready);

        let limit = self.config.max_concurrent_nodes.max(1);
        let mut in_flight: FuturesUnordered<NodeRun> = FuturesUnordered::new();

        loop {
            while in_flight.len() < limit {
                let Some(id) = ready.pop_front() else { break };
                if let Some(slot) = slots.get_mut(&id) {
                    slot.phase = Phase::Running;
                }
                let live = slots.get(&id).map(|s| s.live).unwrap_or(false);

                if options.torn_down() {
                    debug!(run_id = %run_id, node_id = %id, "Agent torn down, not starting node");
                    results.push(NodeResult::new(id.clone(), NodeStatus::Cancelled));
                    settle(graph, &id, false, &mut slots, &mut ready);
                    continue;
                }
                if !live {
                    debug!(run_id = %run_id, node_id = %id, "No upstream completed, skipping node");
                    results.push(NodeResult::new(id.clone(), NodeStatus::Skipped));
                    settle(graph, &id, false, &mut slots, &mut ready);
                    continue;
                }

                let Some(node) = graph.node(&id) else {
                    settle(graph, &id, false, &mut slots, &mut ready);
                    continue;
                };
                let Some(block) = self.registry.get(&node.block_type) else {
                    warn!(
                        run_id = %run_id,
                        node_id = %id,
                        block_type = %node.block_type,
                        "Block type not registered, node is inert"
                    );
                    results.push(NodeResult::new(id.clone(), NodeStatus::Inert));
                    settle(graph, &id, false, &mut slots, &mut ready);
                    continue;
                };

                let inputs = effective_inputs(block.definition(), node, &cache, ctx);
                debug!(run_id = %run_id, node_id = %id, block_type = %node.block_type, "Starting node");
                self.emit(
                    options,
                    FlowEvent::NodeStarted {
                        run_id: run_id.clone(),
                        node_id: id.clone(),
                    },
                );

                let timeout = self.timeout_for(block.as_ref());
                let ctx = ctx.clone();
                in_flight.push(
                    async move {
                        let node_started = Instant::now();
                        let result = invoke(block, id.clone(), inputs, ctx, timeout).await;
                        (id, result, node_started.elapsed().as_millis() as u64)
                    }
                    .boxed(),
                );
            }

            if in_flight.is_empty() {
                if !ready.is_empty() {
                    continue;
                }
                // Only cycles can leave waiting nodes behind here.
                match break_stall(&order, &mut slots) {
                    Some(id) => {
                        debug!(run_id = %run_id, node_id = %id, "Breaking cycle");
                        ready.push_back(id);
                        continue;
                    }
                    None => {
                        for id in &order {
                            if let Some(slot) = slots.get_mut(id) {
                                if slot.phase == Phase::Waiting {
                                    slot.phase = Phase::Settled;
                                    results.push(NodeResult::new(id.clone(), NodeStatus::Skipped));
                                }
                            }
                        }
                        break;
                    }
                }
            }

            let Some((id, result, elapsed_ms)) = in_flight.next().await else {
                continue;
            };
            let category = graph
                .node(&id)
                .and_then(|n| self.registry.category(&n.block_type))
                .unwrap_or(BlockCategory::Action);

            match result {
                Ok(outputs) => {
                    debug!(run_id = %run_id, node_id = %id, elapsed_ms, "Node complete");
                    self.emit_outputs(options, &run_id, &id, category, &outputs);
                    cache.insert(id.clone(), outputs);
                    results.push(NodeResult {
                        elapsed_ms,
                        ..NodeResult::new(id.clone(), NodeStatus::Completed)
                    });
                    settle(graph, &id, true, &mut slots, &mut ready);
                }
                Err(e) if e.is_halt() => {
                    info!(run_id = %run_id, node_id = %id, reason = %e, "Branch halted");
                    self.emit(
                        options,
                        FlowEvent::NodeHalted {
                            run_id: run_id.clone(),
                            node_id: id.clone(),
                            reason: e.to_string(),
                        },
                    );
                    results.push(NodeResult {
                        error: Some(e.to_string()),
                        elapsed_ms,
                        ..NodeResult::new(id.clone(), NodeStatus::Halted)
                    });
                    settle(graph, &id, false, &mut slots, &mut ready);
                }
                Err(e) => {
                    error!(run_id = %run_id, node_id = %id, error = %e, "Node failed");
                    self.emit(
                        options,
                        FlowEvent::NodeFailed {
                            run_id: run_id.clone(),
                            node_id: id.clone(),
                            error: e.to_string(),
                        },
                    );
                    results.push(NodeResult {
                        error: Some(e.to_string()),
                        elapsed_ms,
                        ..NodeResult::new(id.clone(), NodeStatus::Failed)
                    });
                    settle(graph, &id, false, &mut slots, &mut ready);
                }
            }
        }

        Ok(self.finish(options, run_id, start, results, cache, started))
    }

    fn timeout_for(&self, block: &dyn Block) -> Option<Duration> {
        match block.timeout_secs() {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => self.config.node_timeout(),
        }
    }

    fn finish(
        &self,
        options: &RunOptions,
        run_id: RunId,
        start: &str,
        node_results: Vec<NodeResult>,
        outputs: OutputCache,
        started: Instant,
    ) -> RunReport {
        let report = RunReport {
            run_id,
            start_node: start.to_string(),
            succeeded: !node_results.iter().any(|r| r.status == NodeStatus::Failed),
            node_results,
            outputs,
            total_elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            run_id = %report.run_id,
            executed = report.executed(),
            failed = report.failed(),
            elapsed_ms = report.total_elapsed_ms,
            "Run complete"
        );
        self.emit(
            options,
            FlowEvent::RunComplete {
                run_id: report.run_id.clone(),
                executed: report.executed(),
                failed: report.failed(),
                elapsed_ms: report.total_elapsed_ms,
            },
        );
        report
    }

    fn emit(&self, options: &RunOptions, event: FlowEvent) {
        if let Some(ref bus) = options.event_bus {
            bus.publish(event);
        }
    }

    /// Live-update side channel. Muted once the run's agent is torn down.
    fn emit_outputs(
        &self,
        options: &RunOptions,
        run_id: &RunId,
        node_id: &str,
        category: BlockCategory,
        outputs: &Outputs,
    ) {
        let Some(ref bus) = options.event_bus else {
            return;
        };
        if options.torn_down() || !bus.has_receivers() {
            return;
        }
        bus.publish(FlowEvent::NodeOutput {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            category,
            outputs_json: serde_json::to_string(outputs).unwrap_or_default(),
        });
    }
}

async fn invoke(
    block: Arc<dyn Block>,
    node_id: String,
    inputs: Inputs,
    ctx: RunContext,
    timeout: Option<Duration>,
) -> Result<Outputs> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, block.run(inputs, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(BlockflowError::BlockTimeout {
                node: node_id,
                timeout_secs: limit.as_secs(),
            }),
        },
        None => block.run(inputs, ctx).await,
    }
}

/// Mark `id` settled and release successors whose predecessors all settled.
fn settle(
    graph: &AgentGraph,
    id: &str,
    completed: bool,
    slots: &mut HashMap<String, Slot>,
    ready: &mut VecDeque<String>,
) {
    if let Some(slot) = slots.get_mut(id) {
        slot.phase = Phase::Settled;
    }
    for next in graph.successors(id) {
        let Some(slot) = slots.get_mut(next) else { continue };
        if slot.phase != Phase::Waiting {
            continue;
        }
        slot.waiting = slot.waiting.saturating_sub(1);
        slot.live |= completed;
        if slot.waiting == 0 {
            // Reserve it so a later settle cannot queue it twice.
            slot.phase = Phase::Running;
            ready.push_back(next.clone());
        }
    }
}

/// First still-waiting node (in discovery order) that some completed
/// predecessor already released.
fn break_stall(order: &[String], slots: &mut HashMap<String, Slot>) -> Option<String> {
    let id = order.iter().find(|id| {
        slots
            .get(id.as_str())
            .map(|s| s.phase == Phase::Waiting && s.live)
            .unwrap_or(false)
    })?;
    if let Some(slot) = slots.get_mut(id) {
        slot.phase = Phase::Running;
    }
    Some(id.clone())
}
