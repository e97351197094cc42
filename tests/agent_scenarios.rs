use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use blockflow_blocks::{builtin_registry, register_builtins};
use blockflow_core::config::{EngineConfig, SubscriptionConfig};
use blockflow_core::error::{BlockflowError, Result};
use blockflow_core::event::EventBus;
use blockflow_core::traits::Block;
use blockflow_core::types::{
    BlockCategory, BlockDefinition, FlowEvent, InputField, Inputs, OutputField, Outputs,
    RunContext, TransactionRequest,
};
use blockflow_engine::{
    build_connected_model, normalize, resolve, validate_edge, AgentGraph, BlockRegistry,
    Edge, FlowDocument, GraphExecutor, Node, NodeStatus, OutputCache, RunOptions,
    SubscriptionManager, EXEC_IN, EXEC_OUT,
};
use blockflow_test_utils::{outputs, wait_until, FakeBlock, FakeSigner};

const SAVED_FLOW: &str = r#"{
    "nodes": [
        {"id": "start", "blockType": "manual_trigger", "data": {"inputs": {"value": "5"}}},
        {"id": "gate", "blockType": "compare",
         "data": {"inputs": {"operator": ">", "right": "3"}}},
        {"id": "msg", "blockType": "join_text",
         "data": {"inputs": {"first": "price", "separator": "=", "second": "{{start.value}}"}}},
        {"id": "out", "blockType": "log", "position": {"x": "bad", "y": 4}},
        {"id": "gate", "blockType": "log"},
        {"id": "legacy", "blockType": "retired_swap"}
    ],
    "edges": [
        {"id": "e1", "source": "start", "target": "gate", "sourceHandle": "value", "targetHandle": "left"},
        {"id": "e2", "source": "gate", "target": "msg", "sourceHandle": "exec-out", "targetHandle": "exec-in"},
        {"id": "e3", "source": "msg", "target": "out", "sourceHandle": "text", "targetHandle": "message"},
        {"id": "e4", "source": "msg", "target": "start", "sourceHandle": "exec-out", "targetHandle": "exec-in"},
        {"id": "e5", "source": "out", "target": "ghost"},
        {"id": "e6", "source": "msg", "target": "out", "sourceHandle": "text", "targetHandle": "volume"}
    ]
}"#;

fn saved_graph() -> (BlockRegistry, FlowDocument) {
    let doc = FlowDocument::from_json(SAVED_FLOW).expect("parse saved flow");
    (builtin_registry(), doc)
}

#[test]
fn normalization_is_idempotent() {
    let (registry, doc) = saved_graph();
    let once = normalize(&registry, &doc.nodes, &doc.edges);
    let twice = normalize(&registry, &once.0, &once.1);
    assert_eq!(once, twice);

    // also across a save/load cycle
    let saved = FlowDocument::new(once.0.clone(), once.1.clone()).to_json_pretty().unwrap();
    let reloaded = FlowDocument::from_json(&saved).unwrap();
    assert_eq!(normalize(&registry, &reloaded.nodes, &reloaded.edges), once);
}

#[test]
fn normalized_edges_are_execution_only() {
    let (registry, doc) = saved_graph();
    let (nodes, edges) = normalize(&registry, &doc.nodes, &doc.edges);

    assert_eq!(nodes.len(), 5);
    for edge in &edges {
        assert_eq!(edge.source_handle.as_deref(), Some(EXEC_OUT));
        assert_eq!(edge.target_handle.as_deref(), Some(EXEC_IN));
        let target = nodes.iter().find(|n| n.id == edge.target).unwrap();
        assert!(!registry.is_trigger(&target.block_type));
    }
    let pairs: Vec<(&str, &str)> = edges
        .iter()
        .map(|e| (e.source.as_str(), e.target.as_str()))
        .collect();
    assert_eq!(pairs, vec![("start", "gate"), ("gate", "msg"), ("msg", "out")]);

    let gate = nodes.iter().find(|n| n.id == "gate").unwrap();
    assert_eq!(gate.block_type, "compare");
    assert_eq!(gate.input_sources["left"].source_node_id, "start");
    let out = nodes.iter().find(|n| n.id == "out").unwrap();
    assert_eq!(out.input_sources["message"].output_name, "text");
    assert!(!out.input_sources.contains_key("volume"));
}

#[test]
fn validator_agrees_with_normalizer() {
    let registry = builtin_registry();
    let nodes = vec![
        Node::new("t", "manual_trigger"),
        Node::new("w", "wallet_info"),
        Node::new("c", "compare"),
        Node::new("j", "join_text"),
    ];
    let candidates = [
        ("t", Some("value"), "j", Some("first")),
        ("t", Some("value"), "w", Some("address")),
        ("w", Some("address"), "j", Some("second")),
        ("c", Some("result"), "j", Some("nope")),
        ("j", Some("text"), "c", Some("left")),
        ("j", Some("text"), "t", Some("value")),
        // mixed and missing handles
        ("t", Some("value"), "j", Some(EXEC_IN)),
        ("t", Some(EXEC_OUT), "j", None),
        ("t", Some(EXEC_OUT), "c", Some("right")),
        ("c", Some(EXEC_OUT), "w", Some("address")),
        ("j", Some("text"), "t", Some(EXEC_IN)),
        ("j", None, "t", None),
    ];

    for (source, out, target, handle) in candidates {
        let edge = Edge::wired("e", source, out, target, handle);
        let verdict = validate_edge(&registry, &nodes, &edge);
        let (normalized, edges) = normalize(&registry, &nodes, &[edge.clone()]);
        let bound = edge
            .data_field()
            .map(|field| {
                normalized
                    .iter()
                    .any(|n| n.id == target && n.input_sources.contains_key(field))
            })
            .unwrap_or(false);
        assert_eq!(
            verdict.valid,
            bound || !edges.is_empty(),
            "{}.{:?} -> {}.{:?}",
            source,
            out,
            target,
            handle
        );
    }
}

#[test]
fn variable_resolution_round_trip() {
    let mut cache = OutputCache::new();
    cache.insert("A", outputs(&[("x", "5")]));
    assert_eq!(resolve("{{A.x}}", &cache), "5");
    assert_eq!(resolve("{{A.y}}", &cache), "{{A.y}}");
}

#[tokio::test]
async fn builtin_flow_runs_and_filters() {
    let (registry, doc) = saved_graph();
    let graph = build_connected_model(&registry, &doc.nodes, &doc.edges);
    let executor = GraphExecutor::new(Arc::new(registry), EngineConfig::default());
    let ctx = RunContext::new();

    let report = executor
        .run_downstream(&graph, "start", outputs(&[("value", "5")]), &ctx, &RunOptions::new())
        .await
        .unwrap();
    assert!(report.succeeded);
    assert_eq!(report.outputs.get("msg", "text"), Some("price=5"));
    assert_eq!(report.outputs.get("out", "message"), Some("price=5"));

    let report = executor
        .run_downstream(&graph, "start", outputs(&[("value", "1")]), &ctx, &RunOptions::new())
        .await
        .unwrap();
    assert_eq!(report.status("gate"), Some(NodeStatus::Halted));
    assert_eq!(report.status("out"), Some(NodeStatus::Skipped));
    assert!(report.succeeded);
}

#[tokio::test]
async fn trigger_value_reaches_bound_action() {
    let mut registry = BlockRegistry::new();
    let mut trigger = FakeBlock::trigger("price_watch", &["value"]);
    let tap = trigger.subscribable();
    let action = FakeBlock::action("swap", &["amount"], &["tx_hash"]);
    let calls = action.calls();
    registry.register(trigger);
    registry.register(action);

    let graph = build_connected_model(
        &registry,
        &[
            Node::new("T", "price_watch"),
            Node::new("A", "swap").with_source("amount", "T", "value"),
        ],
        &[Edge::execution("e1", "T", "A")],
    );
    let executor = Arc::new(GraphExecutor::new(Arc::new(registry), EngineConfig::default()));
    let manager =
        SubscriptionManager::new(executor, SubscriptionConfig::default(), Arc::new(EventBus::default()));

    manager.activate("agent", Arc::new(graph), RunContext::new()).await;
    assert!(tap.wait_opened(1).await);
    assert!(tap.fire(outputs(&[("value", "42")])));
    assert!(wait_until(|| calls.len() == 1).await);
    assert_eq!(calls.last_input("amount").as_deref(), Some("42"));

    manager.deactivate_all().await;
}

#[tokio::test]
async fn deactivating_mid_run_unsubscribes_each_trigger_once() {
    let mut registry = BlockRegistry::new();
    register_builtins(&mut registry);
    let mut first = FakeBlock::trigger("wallet_events", &["value"]);
    let first_tap = first.subscribable();
    let mut second = FakeBlock::trigger("price_feed", &["value"]);
    let second_tap = second.subscribable();
    let slow = FakeBlock::action("bridge", &["amount"], &["tx_hash"])
        .with_delay(Duration::from_millis(150));
    let slow_calls = slow.calls();
    registry.register(first);
    registry.register(second);
    registry.register(slow);

    let graph: AgentGraph = build_connected_model(
        &registry,
        &[
            Node::new("w", "wallet_events"),
            Node::new("p", "price_feed"),
            Node::new("b", "bridge").with_input("amount", "{{w.value}}"),
            Node::new("l", "log").with_input("message", "{{b.tx_hash}}"),
        ],
        &[Edge::execution("e1", "w", "b"), Edge::execution("e2", "b", "l")],
    );

    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let executor = Arc::new(GraphExecutor::new(Arc::new(registry), EngineConfig::default()));
    let manager = SubscriptionManager::new(executor, SubscriptionConfig::default(), bus);

    assert_eq!(manager.activate("agent", Arc::new(graph), RunContext::new()).await, 2);
    assert!(first_tap.wait_opened(1).await);
    assert!(second_tap.wait_opened(1).await);

    first_tap.fire(outputs(&[("value", "3")]));
    assert!(wait_until(|| slow_calls.len() == 1).await);
    assert!(manager.deactivate("agent").await);

    assert_eq!(first_tap.closed(), 1);
    assert_eq!(second_tap.closed(), 1);
    assert!(!manager.is_active("agent").await);

    // nothing from the torn-down run reached the live-update channel
    let mut late_outputs = 0;
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::NodeOutput { node_id, .. } = event {
            if node_id == "b" || node_id == "l" {
                late_outputs += 1;
            }
        }
    }
    assert_eq!(late_outputs, 0);
}

#[tokio::test]
async fn failing_node_does_not_stop_sibling_branch() {
    let mut registry = BlockRegistry::new();
    registry.register(FakeBlock::trigger("tick", &["value"]));
    registry.register(FakeBlock::action("quote", &[], &["price"]).returning(&[("price", "3000")]));
    registry.register(FakeBlock::action("swap", &["amount"], &["tx_hash"]).failing("slippage"));
    let notify = FakeBlock::action("notify", &["text"], &["sent"]);
    let notify_calls = notify.calls();
    registry.register(notify);

    // tick -> quote -> swap (fails) ; tick -> notify, reading the quote
    let graph = build_connected_model(
        &registry,
        &[
            Node::new("t", "tick"),
            Node::new("q", "quote"),
            Node::new("s", "swap").with_source("amount", "q", "price"),
            Node::new("n", "notify").with_input("text", "{{t.value}}"),
        ],
        &[
            Edge::execution("e1", "t", "q"),
            Edge::execution("e2", "q", "s"),
            Edge::execution("e3", "t", "n"),
        ],
    );
    let executor = GraphExecutor::new(Arc::new(registry), EngineConfig::default());

    let report = executor
        .run_downstream(
            &graph,
            "t",
            outputs(&[("value", "tick-1")]),
            &RunContext::new(),
            &RunOptions::new(),
        )
        .await
        .expect("downstream failures do not fail the run");

    assert_eq!(report.status("s"), Some(NodeStatus::Failed));
    assert_eq!(report.status("n"), Some(NodeStatus::Completed));
    assert_eq!(notify_calls.last_input("text").as_deref(), Some("tick-1"));
    assert!(!report.succeeded);
}

/// Sends a transfer through whatever signer the run context carries.
struct Transfer {
    definition: BlockDefinition,
}

impl Transfer {
    fn new() -> Self {
        Self {
            definition: BlockDefinition::new("transfer", BlockCategory::Action)
                .with_input(InputField::wallet_address("from"))
                .with_input(InputField::text("to"))
                .with_output(OutputField::typed("tx_hash", "string")),
        }
    }
}

impl Block for Transfer {
    fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    fn run(&self, inputs: Inputs, ctx: RunContext) -> BoxFuture<'_, Result<Outputs>> {
        Box::pin(async move {
            let tx = TransactionRequest {
                to: inputs.get("to").cloned().unwrap_or_default(),
                ..TransactionRequest::default()
            };
            let hash = ctx.send_transaction(tx).await?;
            Ok(outputs(&[("tx_hash", hash.as_str())]))
        })
    }
}

#[tokio::test]
async fn signer_comes_from_run_context() {
    let mut registry = builtin_registry();
    registry.register(Transfer::new());
    let graph = build_connected_model(
        &registry,
        &[
            Node::new("start", "manual_trigger"),
            Node::new("send", "transfer").with_input("to", "{{start.value}}"),
            Node::new("echo", "log").with_source("message", "send", "tx_hash"),
        ],
        &[
            Edge::execution("e1", "start", "send"),
            Edge::execution("e2", "send", "echo"),
        ],
    );
    let executor = GraphExecutor::new(Arc::new(registry), EngineConfig::default());

    let signer = Arc::new(FakeSigner::default());
    let ctx = RunContext::new()
        .with_wallet("0xme")
        .with_signer(signer.clone());
    let report = executor
        .run_downstream(&graph, "start", outputs(&[("value", "0xbob")]), &ctx, &RunOptions::new())
        .await
        .unwrap();
    assert_eq!(signer.sent.load(Ordering::SeqCst), 1);
    assert_eq!(report.outputs.get("echo", "message"), Some("0xtx-0xbob"));

    // without a signer the send fails locally and the echo never runs
    let report = executor
        .run_downstream(
            &graph,
            "start",
            outputs(&[("value", "0xbob")]),
            &RunContext::new(),
            &RunOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(report.status("send"), Some(NodeStatus::Failed));
    assert_eq!(report.status("echo"), Some(NodeStatus::Skipped));
    let error = report
        .node_results
        .iter()
        .find(|r| r.node_id == "send")
        .and_then(|r| r.error.clone())
        .unwrap_or_default();
    assert!(error.contains(&BlockflowError::SignerUnavailable("send_transaction".into()).to_string()));
}
