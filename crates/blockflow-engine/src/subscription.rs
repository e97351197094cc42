use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use blockflow_core::config::{OverlapPolicy, RetryConfig, SubscriptionConfig};
use blockflow_core::event::EventBus;
use blockflow_core::traits::Block;
use blockflow_core::trigger::TriggerSink;
use blockflow_core::types::{FlowEvent, Inputs, Outputs, RunContext};

use crate::executor::{effective_inputs, GraphExecutor, RunOptions};
use crate::graph::AgentGraph;
use crate::resolver::OutputCache;

/// How long `shutdown` waits for each task before giving up on it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Live trigger listeners for one agent.
///
/// Cancelling stops every listener and dispatcher. Runs already in flight
/// finish, but publish no further live updates and start no new nodes.
/// Dropping the handle cancels it.
pub struct AgentSubscription {
    agent_id: String,
    cancel: CancellationToken,
    node_ids: Vec<String>,
    listeners: Vec<JoinHandle<()>>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl AgentSubscription {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Trigger nodes this subscription listens on.
    pub fn node_ids(&self) -> &[String] {
        &self.node_ids
    }

    pub fn listener_count(&self) -> usize {
        self.node_ids.len()
    }

    /// Signal teardown without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait for every listener and dispatcher to exit.
    ///
    /// A listener still running after the grace period is aborted. A
    /// dispatcher is only ever detached, so an in-flight block call runs to
    /// completion and its run still reports `RunComplete`.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.listeners) {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!(agent_id = %self.agent_id, "Listener ignored cancellation, aborting");
                abort.abort();
            }
        }
        for task in std::mem::take(&mut self.dispatchers) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!(agent_id = %self.agent_id, "Run still in flight, leaving it to finish");
            }
        }
        debug!(agent_id = %self.agent_id, "Subscription shut down");
    }
}

impl Drop for AgentSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for AgentSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSubscription")
            .field("agent_id", &self.agent_id)
            .field("node_ids", &self.node_ids)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Keeps subscribable blocks wired to downstream runs, one set per agent.
pub struct SubscriptionManager {
    executor: Arc<GraphExecutor>,
    config: SubscriptionConfig,
    event_bus: Arc<EventBus>,
    agents: Mutex<HashMap<String, AgentSubscription>>,
}

impl SubscriptionManager {
    pub fn new(
        executor: Arc<GraphExecutor>,
        config: SubscriptionConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            executor,
            config,
            event_bus,
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Start a listener for every subscribable node in `graph`.
    ///
    /// Each firing runs the graph downstream of the firing node. The returned
    /// handle is not tracked by the manager; use `activate` for that.
    pub fn subscribe_to_agent(
        &self,
        agent_id: &str,
        graph: Arc<AgentGraph>,
        ctx: RunContext,
    ) -> AgentSubscription {
        let cancel = CancellationToken::new();
        let mut node_ids = Vec::new();
        let mut listeners = Vec::new();
        let mut dispatchers = Vec::new();
        let registry = self.executor.registry().clone();
        let empty = OutputCache::new();

        for node in graph.nodes() {
            let Some(block) = registry.get(&node.block_type) else {
                continue;
            };
            if !block.subscribes() {
                continue;
            }

            let inputs = effective_inputs(block.definition(), node, &empty, &ctx);
            let (tx, rx) = mpsc::channel(self.config.channel_capacity());
            let sink = TriggerSink::new(agent_id, node.id.clone(), tx)
                .with_event_bus(self.event_bus.clone());

            let listener = Listener {
                agent_id: agent_id.to_string(),
                node_id: node.id.clone(),
                block,
                inputs,
                retry: self.config.retry.clone(),
                event_bus: self.event_bus.clone(),
                cancel: cancel.clone(),
            };
            listeners.push(tokio::spawn(listener.run(sink)));

            let dispatcher = Dispatcher {
                agent_id: agent_id.to_string(),
                node_id: node.id.clone(),
                executor: self.executor.clone(),
                graph: graph.clone(),
                ctx: ctx.clone(),
                overlap: self.config.overlap,
                event_bus: self.event_bus.clone(),
                cancel: cancel.clone(),
            };
            dispatchers.push(tokio::spawn(dispatcher.run(rx)));

            node_ids.push(node.id.clone());
        }

        info!(agent_id = %agent_id, listeners = node_ids.len(), "Agent subscribed");
        AgentSubscription {
            agent_id: agent_id.to_string(),
            cancel,
            node_ids,
            listeners,
            dispatchers,
        }
    }

    /// Replace the agent's live subscription. The previous one is fully shut
    /// down before the new listeners start. Returns the listener count.
    ///
    /// The agent map is not locked while the previous subscription shuts
    /// down, so other agents stay usable meanwhile.
    pub async fn activate(&self, agent_id: &str, graph: Arc<AgentGraph>, ctx: RunContext) -> usize {
        loop {
            let previous = self.agents.lock().await.remove(agent_id);
            if let Some(previous) = previous {
                info!(agent_id = %agent_id, "Re-activating agent, tearing down previous subscription");
                previous.shutdown().await;
            }

            let mut agents = self.agents.lock().await;
            // Another activate slipped in during shutdown; tear that one down too.
            if agents.contains_key(agent_id) {
                continue;
            }
            let subscription = self.subscribe_to_agent(agent_id, graph, ctx);
            let count = subscription.listener_count();
            agents.insert(agent_id.to_string(), subscription);
            return count;
        }
    }

    /// Tear down the agent's subscription. `false` if it had none.
    pub async fn deactivate(&self, agent_id: &str) -> bool {
        let removed = self.agents.lock().await.remove(agent_id);
        match removed {
            Some(subscription) => {
                subscription.shutdown().await;
                info!(agent_id = %agent_id, "Agent deactivated");
                true
            }
            None => false,
        }
    }

    pub async fn deactivate_all(&self) {
        let drained: Vec<AgentSubscription> =
            self.agents.lock().await.drain().map(|(_, s)| s).collect();
        for subscription in &drained {
            subscription.cancel();
        }
        for subscription in drained {
            subscription.shutdown().await;
        }
    }

    /// Agent ids with a live subscription, sorted.
    pub async fn active_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn is_active(&self, agent_id: &str) -> bool {
        self.agents.lock().await.contains_key(agent_id)
    }
}

/// Backoff before retry number `attempt` (0-based), with 0.8x-1.2x jitter.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Holds one block's `subscribe` call open, resubscribing on failure.
struct Listener {
    agent_id: String,
    node_id: String,
    block: Arc<dyn Block>,
    inputs: Inputs,
    retry: RetryConfig,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl Listener {
    async fn run(self, sink: TriggerSink) {
        let mut attempt: u32 = 0;
        loop {
            self.event_bus.publish(FlowEvent::SubscriptionOpened {
                agent_id: self.agent_id.clone(),
                node_id: self.node_id.clone(),
            });
            debug!(agent_id = %self.agent_id, node_id = %self.node_id, "Listener opened");

            let opened = Instant::now();
            let result = self
                .block
                .subscribe(self.inputs.clone(), sink.clone(), self.cancel.clone())
                .await;

            if self.cancel.is_cancelled() {
                break;
            }
            let e = match result {
                Ok(()) => {
                    info!(agent_id = %self.agent_id, node_id = %self.node_id, "Listener ended");
                    break;
                }
                Err(e) => e,
            };

            // A listener that stayed up a while starts a fresh retry budget.
            if opened.elapsed() >= Duration::from_millis(self.retry.max_backoff_ms) {
                attempt = 0;
            }
            if attempt >= self.retry.max_retries {
                error!(
                    agent_id = %self.agent_id,
                    node_id = %self.node_id,
                    error = %e,
                    retries = attempt,
                    "Listener failed, giving up"
                );
                break;
            }

            let backoff = calculate_backoff(attempt, &self.retry);
            attempt += 1;
            warn!(
                agent_id = %self.agent_id,
                node_id = %self.node_id,
                attempt,
                max_retries = self.retry.max_retries,
                backoff_ms = backoff.as_millis() as u64,
                error = %e,
                "Listener failed, resubscribing"
            );
            self.event_bus.publish(FlowEvent::SubscriptionError {
                agent_id: self.agent_id.clone(),
                node_id: self.node_id.clone(),
                attempt,
                error: e.to_string(),
            });

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        self.event_bus.publish(FlowEvent::SubscriptionClosed {
            agent_id: self.agent_id.clone(),
            node_id: self.node_id.clone(),
        });
        debug!(agent_id = %self.agent_id, node_id = %self.node_id, "Listener closed");
    }
}

/// Turns one trigger node's firings into downstream runs, one at a time.
struct Dispatcher {
    agent_id: String,
    node_id: String,
    executor: Arc<GraphExecutor>,
    graph: Arc<AgentGraph>,
    ctx: RunContext,
    overlap: OverlapPolicy,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(self, mut rx: mpsc::Receiver<Outputs>) {
        loop {
            let outputs = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                firing = rx.recv() => match firing {
                    Some(outputs) => outputs,
                    None => break,
                },
            };

            let options = RunOptions::new()
                .with_event_bus(self.event_bus.clone())
                .with_teardown(self.cancel.clone());
            match self
                .executor
                .run_downstream(&self.graph, &self.node_id, outputs, &self.ctx, &options)
                .await
            {
                Ok(report) => debug!(
                    agent_id = %self.agent_id,
                    node_id = %self.node_id,
                    run_id = %report.run_id,
                    succeeded = report.succeeded,
                    "Triggered run finished"
                ),
                Err(e) => error!(
                    agent_id = %self.agent_id,
                    node_id = %self.node_id,
                    error = %e,
                    "Triggered run failed"
                ),
            }

            if self.overlap == OverlapPolicy::Skip {
                while rx.try_recv().is_ok() {
                    debug!(
                        agent_id = %self.agent_id,
                        node_id = %self.node_id,
                        "Firing arrived mid-run, skipping"
                    );
                    self.event_bus.publish(FlowEvent::TriggerSkipped {
                        agent_id: self.agent_id.clone(),
                        node_id: self.node_id.clone(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{build_connected_model, Edge, Node};
    use crate::registry::BlockRegistry;
    use blockflow_core::config::EngineConfig;
    use blockflow_test_utils::{outputs, wait_until, CallLog, FakeBlock, ListenerTap};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        }
    }

    fn manager(registry: BlockRegistry, config: SubscriptionConfig) -> (SubscriptionManager, Arc<EventBus>) {
        let executor = Arc::new(GraphExecutor::new(Arc::new(registry), EngineConfig::default()));
        let bus = Arc::new(EventBus::default());
        (SubscriptionManager::new(executor, config, bus.clone()), bus)
    }

    fn model(manager: &SubscriptionManager, nodes: Vec<Node>, edges: Vec<Edge>) -> Arc<AgentGraph> {
        Arc::new(build_connected_model(manager.executor.registry(), &nodes, &edges))
    }

    #[tokio::test]
    async fn test_firing_runs_downstream_with_payload() {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let action = FakeBlock::action("buy", &["amount"], &["tx_hash"]);
        let calls = action.calls();
        let mut r = BlockRegistry::new();
        r.register(watch);
        r.register(action);
        let (m, _) = manager(r, SubscriptionConfig::default());

        let g = model(
            &m,
            vec![
                Node::new("T", "watch"),
                Node::new("A", "buy").with_source("amount", "T", "value"),
            ],
            vec![Edge::execution("e1", "T", "A")],
        );
        assert_eq!(m.activate("agent-1", g, RunContext::new()).await, 1);
        assert!(tap.wait_opened(1).await);

        assert!(tap.fire(outputs(&[("value", "42")])));
        assert!(wait_until(|| calls.len() == 1).await);
        assert_eq!(calls.last_input("amount").as_deref(), Some("42"));

        assert!(m.deactivate("agent-1").await);
        assert_eq!(tap.closed(), 1);
        assert!(!m.deactivate("agent-1").await);
    }

    #[tokio::test]
    async fn test_subscribe_gets_effective_inputs() {
        let mut watch = FakeBlock::trigger("watch", &["value"]).with_input(
            blockflow_core::types::InputField::text("interval").with_default("60"),
        );
        let tap = watch.subscribable();
        let mut r = BlockRegistry::new();
        r.register(watch);
        let (m, _) = manager(r, SubscriptionConfig::default());

        let g = model(&m, vec![Node::new("T", "watch")], vec![]);
        let sub = m.subscribe_to_agent("a", g, RunContext::new());
        assert!(tap.wait_opened(1).await);
        assert_eq!(
            tap.inputs().and_then(|i| i.get("interval").cloned()).as_deref(),
            Some("60")
        );
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn test_reactivation_tears_down_first() {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let mut r = BlockRegistry::new();
        r.register(watch);
        let (m, _) = manager(r, SubscriptionConfig::default());
        let g = model(&m, vec![Node::new("T", "watch")], vec![]);

        m.activate("agent", g.clone(), RunContext::new()).await;
        assert!(tap.wait_opened(1).await);
        m.activate("agent", g, RunContext::new()).await;
        assert!(tap.wait_opened(2).await);

        // the first listener closed before the second opened
        assert_eq!(tap.closed(), 1);
        assert_eq!(m.active_agents().await, vec!["agent".to_string()]);

        m.deactivate_all().await;
        assert_eq!(tap.closed(), 2);
        assert!(m.active_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_deactivate_mid_run_closes_each_listener_once() {
        let mut first = FakeBlock::trigger("watch_a", &["value"]);
        let tap_a = first.subscribable();
        let mut second = FakeBlock::trigger("watch_b", &["value"]);
        let tap_b = second.subscribable();
        let slow = FakeBlock::action("slow", &["in"], &["out"]).with_delay(Duration::from_millis(100));
        let slow_calls = slow.calls();
        let after = FakeBlock::action("after", &["in"], &["out"]);
        let after_calls = after.calls();

        let mut r = BlockRegistry::new();
        r.register(first);
        r.register(second);
        r.register(slow);
        r.register(after);
        let (m, bus) = manager(r, SubscriptionConfig::default());
        let mut events = bus.subscribe();

        let g = model(
            &m,
            vec![
                Node::new("A", "watch_a"),
                Node::new("B", "watch_b"),
                Node::new("s", "slow"),
                Node::new("x", "after"),
            ],
            vec![Edge::execution("e1", "A", "s"), Edge::execution("e2", "s", "x")],
        );
        assert_eq!(m.activate("agent", g, RunContext::new()).await, 2);
        assert!(tap_a.wait_opened(1).await);
        assert!(tap_b.wait_opened(1).await);

        assert!(tap_a.fire(outputs(&[("value", "1")])));
        assert!(wait_until(|| slow_calls.len() == 1).await);
        assert!(m.deactivate("agent").await);

        assert_eq!(tap_a.closed(), 1);
        assert_eq!(tap_b.closed(), 1);
        assert_eq!(tap_a.opened(), 1);
        assert_eq!(tap_b.opened(), 1);
        // the in-flight node finished but nothing new started after teardown
        assert!(after_calls.is_empty());

        let mut closed = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                FlowEvent::SubscriptionClosed { .. } => closed += 1,
                FlowEvent::NodeOutput { node_id, .. } => assert_ne!(node_id, "s"),
                _ => {}
            }
        }
        assert_eq!(closed, 2);
    }

    fn slow_agent(delay: Duration) -> (SubscriptionManager, Arc<EventBus>, Arc<AgentGraph>, ListenerTap, CallLog) {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let slow = FakeBlock::action("slow", &["in"], &["out"]).with_delay(delay);
        let calls = slow.calls();
        let mut r = BlockRegistry::new();
        r.register(watch);
        r.register(slow);
        let (m, bus) = manager(r, SubscriptionConfig::default());
        let g = model(
            &m,
            vec![Node::new("T", "watch"), Node::new("s", "slow")],
            vec![Edge::execution("e1", "T", "s")],
        );
        (m, bus, g, tap, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_lets_long_run_complete() {
        let (m, bus, g, tap, calls) = slow_agent(Duration::from_secs(10));
        let mut events = bus.subscribe();

        m.activate("agent", g, RunContext::new()).await;
        assert!(tap.wait_opened(1).await);
        assert!(tap.fire(outputs(&[("value", "1")])));
        assert!(wait_until(|| calls.len() == 1).await);

        // returns after the grace period while the block is still running
        assert!(m.deactivate("agent").await);
        assert_eq!(tap.closed(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::RunComplete { failed, .. } = event {
                completed.push(failed);
            }
        }
        assert_eq!(completed, vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_does_not_block_other_callers() {
        let (m, _, g, tap, calls) = slow_agent(Duration::from_secs(10));
        let m = Arc::new(m);

        m.activate("agent", g.clone(), RunContext::new()).await;
        assert!(tap.wait_opened(1).await);
        assert!(tap.fire(outputs(&[("value", "1")])));
        assert!(wait_until(|| calls.len() == 1).await);

        let again = {
            let m = m.clone();
            tokio::spawn(async move { m.activate("agent", g, RunContext::new()).await })
        };
        assert!(tap.wait_closed(1).await);

        // the old dispatcher is still inside its grace period here
        let listed = tokio::time::timeout(Duration::from_millis(100), m.active_agents()).await;
        assert_eq!(listed.ok(), Some(Vec::new()));

        assert!(matches!(again.await, Ok(1)));
        assert!(tap.wait_opened(2).await);
        assert_eq!(m.active_agents().await, vec!["agent".to_string()]);
        m.deactivate_all().await;
    }

    #[tokio::test]
    async fn test_failed_listener_is_retried() {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let watch = watch.failing_subscriptions(2);
        let mut r = BlockRegistry::new();
        r.register(watch);
        let config = SubscriptionConfig {
            retry: fast_retry(),
            ..SubscriptionConfig::default()
        };
        let (m, bus) = manager(r, config);
        let mut events = bus.subscribe();
        let g = model(&m, vec![Node::new("T", "watch")], vec![]);

        let sub = m.subscribe_to_agent("a", g, RunContext::new());
        assert!(tap.wait_opened(3).await);
        sub.shutdown().await;
        assert_eq!(tap.opened(), 3);
        assert_eq!(tap.closed(), 1);

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::SubscriptionError { attempt, .. } = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_listener_gives_up_after_max_retries() {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let watch = watch.failing_subscriptions(100);
        let mut r = BlockRegistry::new();
        r.register(watch);
        let config = SubscriptionConfig {
            retry: fast_retry(),
            ..SubscriptionConfig::default()
        };
        let (m, bus) = manager(r, config);
        let mut events = bus.subscribe();
        let g = model(&m, vec![Node::new("T", "watch")], vec![]);

        let _sub = m.subscribe_to_agent("a", g, RunContext::new());
        let mut closed = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !closed && tokio::time::Instant::now() < deadline {
            if let Ok(Ok(FlowEvent::SubscriptionClosed { .. })) =
                tokio::time::timeout(Duration::from_millis(50), events.recv()).await
            {
                closed = true;
            }
        }
        assert!(closed);
        // first attempt plus three retries
        assert_eq!(tap.opened(), 4);
    }

    #[tokio::test]
    async fn test_skip_overlap_drops_firings_mid_run() {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let slow = FakeBlock::action("slow", &["in"], &["out"]).with_delay(Duration::from_millis(100));
        let calls = slow.calls();
        let mut r = BlockRegistry::new();
        r.register(watch);
        r.register(slow);
        let (m, bus) = manager(r, SubscriptionConfig::default());
        let mut events = bus.subscribe();
        let g = model(
            &m,
            vec![Node::new("T", "watch"), Node::new("s", "slow")],
            vec![Edge::execution("e1", "T", "s")],
        );

        let sub = m.subscribe_to_agent("a", g, RunContext::new());
        assert!(tap.wait_opened(1).await);
        fire_three(&tap);

        assert!(wait_until(|| calls.len() == 1).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.len(), 1);
        sub.shutdown().await;

        let mut skipped = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FlowEvent::TriggerSkipped { .. }) {
                skipped += 1;
            }
        }
        assert_eq!(skipped, 2);
    }

    #[tokio::test]
    async fn test_queue_overlap_runs_every_firing() {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let slow = FakeBlock::action("slow", &["in"], &["out"]).with_delay(Duration::from_millis(20));
        let calls = slow.calls();
        let mut r = BlockRegistry::new();
        r.register(watch);
        r.register(slow);
        let config = SubscriptionConfig {
            overlap: OverlapPolicy::Queue,
            ..SubscriptionConfig::default()
        };
        let (m, _) = manager(r, config);
        let g = model(
            &m,
            vec![
                Node::new("T", "watch"),
                Node::new("s", "slow").with_input("in", "{{T.value}}"),
            ],
            vec![Edge::execution("e1", "T", "s")],
        );

        let sub = m.subscribe_to_agent("a", g, RunContext::new());
        assert!(tap.wait_opened(1).await);
        fire_three(&tap);

        assert!(wait_until(|| calls.len() == 3).await);
        let seen: Vec<String> = (0..3)
            .filter_map(|i| calls.call(i).and_then(|c| c.get("in").cloned()))
            .collect();
        assert_eq!(seen, vec!["1", "2", "3"]);
        sub.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_listeners() {
        let mut watch = FakeBlock::trigger("watch", &["value"]);
        let tap = watch.subscribable();
        let mut r = BlockRegistry::new();
        r.register(watch);
        let (m, _) = manager(r, SubscriptionConfig::default());
        let g = model(&m, vec![Node::new("T", "watch")], vec![]);

        let sub = m.subscribe_to_agent("a", g, RunContext::new());
        assert!(tap.wait_opened(1).await);
        drop(sub);
        assert!(tap.wait_closed(1).await);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 60_000,
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((800..=1200).contains(&first));
        let late = calculate_backoff(40, &config).as_millis();
        assert!(late <= 72_000);
        assert!(late >= 48_000);
    }

    fn fire_three(tap: &ListenerTap) {
        for v in ["1", "2", "3"] {
            tap.fire(outputs(&[("value", v)]));
        }
    }
}
