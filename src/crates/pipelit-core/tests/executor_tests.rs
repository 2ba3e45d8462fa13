//! End-to-end executor scenarios over in-memory infrastructure

use pipelit_checkpoint::InMemoryCheckpointer;
use pipelit_core::{
    compile, fn_component, register_builtins, BudgetGate, CoreError, Edge, EventBus, Executor,
    InterruptReason, Node, NodeConfig, NodeOutcome, NodeStatus, NoCredentials, PortRegistry,
    ResumeRequest, RunOutcome, RunReport, TokenUsage, WorkflowSnapshot,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn node(id: &str, component_type: &str) -> Node {
    Node {
        id: id.to_string(),
        component_type: component_type.to_string(),
        config: NodeConfig::default(),
        position: None,
    }
}

fn node_with_extra(id: &str, component_type: &str, extra: Value) -> Node {
    let mut built = node(id, component_type);
    if let Value::Object(map) = extra {
        built.config.extra = map;
    }
    built
}

fn workflow(nodes: Vec<Node>, edges: Vec<Edge>) -> WorkflowSnapshot {
    WorkflowSnapshot {
        id: "wf-test".to_string(),
        slug: "test-flow".to_string(),
        name: "Test Flow".to_string(),
        nodes,
        edges,
    }
}

fn base_registry() -> PortRegistry {
    let mut registry = PortRegistry::new();
    register_builtins(&mut registry).unwrap();

    registry
        .register(fn_component("code_hi", "Hi", |ctx| {
            let text = ctx
                .state
                .lookup("trigger.text")
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            Ok(NodeOutcome::from_raw(json!({"result": format!("hi {text}")})))
        }))
        .unwrap();

    registry
        .register(fn_component("agent_stub", "Agent Stub", |ctx| {
            Ok(NodeOutcome::from_raw(json!({"ran": ctx.node_id})))
        }))
        .unwrap();

    registry
        .register(fn_component("items_source", "Items", |_| {
            Ok(NodeOutcome::from_raw(json!({"items": [1, 2, 3]})))
        }))
        .unwrap();

    registry
        .register(fn_component("times_ten", "Times Ten", |ctx| {
            let current = ctx
                .state
                .lookup("loop.current")
                .and_then(|v| v.as_f64())
                .unwrap_or_default();
            Ok(NodeOutcome::from_raw(json!({"value": current * 10.0})))
        }))
        .unwrap();

    registry
        .register(fn_component("collect_results", "Collector", |ctx| {
            let results = ctx.state.lookup("body_loop.results").unwrap_or(Value::Null);
            Ok(NodeOutcome::from_raw(json!({"result": results})))
        }))
        .unwrap();

    registry
        .register(fn_component("always_fails", "Failing", |ctx| {
            Err(CoreError::node_failed(ctx.node_id, "BOOM", "it exploded"))
        }))
        .unwrap();

    registry
}

struct Harness {
    registry: PortRegistry,
    bus: Arc<EventBus>,
    checkpoints: Arc<InMemoryCheckpointer>,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: base_registry(),
            bus: Arc::new(EventBus::default()),
            checkpoints: Arc::new(InMemoryCheckpointer::new()),
        }
    }

    fn executor(&self, wf: &WorkflowSnapshot, trigger: &str) -> Executor {
        let plan = compile(wf, trigger, &self.registry).unwrap();
        Executor::new(
            Arc::new(plan),
            self.bus.clone(),
            self.checkpoints.clone(),
            Arc::new(NoCredentials),
        )
    }
}

fn status_of(report: &RunReport, node_id: &str) -> Option<NodeStatus> {
    report
        .node_logs
        .iter()
        .rev()
        .find(|log| log.node_id == node_id)
        .map(|log| log.status)
}

#[tokio::test]
async fn test_linear_chat_flow() {
    let harness = Harness::new();
    let wf = workflow(
        vec![node("trigger", "trigger_chat"), node("greeter", "code_hi")],
        vec![Edge::data("trigger", "text", "greeter", "input")],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor
        .run("exec-1", json!({"text": "world"}), None)
        .await
        .unwrap();

    match &report.outcome {
        RunOutcome::Completed { final_output } => {
            let output = final_output.as_ref().unwrap();
            assert_eq!(output["result"], "hi world");
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(status_of(&report, "trigger"), Some(NodeStatus::Success));
    assert_eq!(status_of(&report, "greeter"), Some(NodeStatus::Success));
}

#[tokio::test]
async fn test_switch_routes_one_branch() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node_with_extra(
                "router",
                "switch",
                json!({
                    "rules": [
                        {"id": "a", "field": "trigger.text", "operator": "equals", "value": "x"},
                        {"id": "b", "field": "trigger.text", "operator": "equals", "value": "y"}
                    ],
                    "enable_fallback": true
                }),
            ),
            node("agent_a", "agent_stub"),
            node("agent_b", "agent_stub"),
            node("agent_c", "agent_stub"),
        ],
        vec![
            Edge::data("trigger", "", "router", ""),
            Edge::conditional("router", "agent_a", "a"),
            Edge::conditional("router", "agent_b", "b"),
            Edge::conditional("router", "agent_c", "__other__"),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor
        .run("exec-2", json!({"text": "y"}), None)
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(status_of(&report, "agent_b"), Some(NodeStatus::Success));
    assert_eq!(status_of(&report, "agent_a"), Some(NodeStatus::Skipped));
    assert_eq!(status_of(&report, "agent_c"), Some(NodeStatus::Skipped));
    assert_eq!(report.state.route.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_switch_without_rules_skips_all_branches() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node_with_extra("router", "switch", json!({"rules": []})),
            node("agent_a", "agent_stub"),
        ],
        vec![
            Edge::data("trigger", "", "router", ""),
            Edge::conditional("router", "agent_a", "a"),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-3", json!({}), None).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(status_of(&report, "agent_a"), Some(NodeStatus::Skipped));
    assert_eq!(report.state.route.as_deref(), Some(""));
}

#[tokio::test]
async fn test_loop_aggregates_results() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_manual"),
            node("source", "items_source"),
            node("body_loop", "loop"),
            node("worker", "times_ten"),
            node("aggregator", "collect_results"),
        ],
        vec![
            Edge::data("trigger", "", "source", ""),
            Edge::data("source", "items", "body_loop", "items"),
            Edge::labeled("body_loop", "worker", "loop_body"),
            Edge::labeled("worker", "body_loop", "loop_return"),
            Edge::data("body_loop", "results", "aggregator", ""),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-4", json!({}), None).await.unwrap();

    match &report.outcome {
        RunOutcome::Completed { final_output } => {
            let output = final_output.as_ref().unwrap();
            assert_eq!(output["result"], json!([10.0, 20.0, 30.0]));
        }
        other => panic!("expected completion, got {other:?}"),
    }
    let loop_outputs = report.state.node_outputs.get("body_loop").unwrap();
    assert_eq!(loop_outputs["count"], 3);
}

#[tokio::test]
async fn test_loop_over_empty_list() {
    let mut harness = Harness::new();
    harness
        .registry
        .register(fn_component("empty_source", "Empty", |_| {
            Ok(NodeOutcome::from_raw(json!({"items": []})))
        }))
        .unwrap();

    let wf = workflow(
        vec![
            node("trigger", "trigger_manual"),
            node("source", "empty_source"),
            node("body_loop", "loop"),
            node("worker", "times_ten"),
        ],
        vec![
            Edge::data("trigger", "", "source", ""),
            Edge::data("source", "items", "body_loop", "items"),
            Edge::labeled("body_loop", "worker", "loop_body"),
            Edge::labeled("worker", "body_loop", "loop_return"),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-5", json!({}), None).await.unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    let loop_outputs = report.state.node_outputs.get("body_loop").unwrap();
    assert_eq!(loop_outputs["results"], json!([]));
    // The body never ran.
    assert_eq!(status_of(&report, "worker"), None);
}

#[tokio::test]
async fn test_human_confirm_interrupt_and_resume() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node_with_extra("confirm", "human_confirm", json!({"prompt": "Proceed?"})),
            node("approved", "agent_stub"),
            node("rejected", "agent_stub"),
        ],
        vec![
            Edge::data("trigger", "", "confirm", ""),
            Edge::conditional("confirm", "approved", "confirmed"),
            Edge::conditional("confirm", "rejected", "cancelled"),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-6", json!({}), None).await.unwrap();
    match &report.outcome {
        RunOutcome::Interrupted { reason, .. } => {
            assert_eq!(*reason, InterruptReason::HumanConfirmation);
        }
        other => panic!("expected interruption, got {other:?}"),
    }
    assert_eq!(status_of(&report, "confirm"), Some(NodeStatus::Waiting));

    let report = executor
        .run(
            "exec-6",
            Value::Null,
            Some(ResumeRequest {
                input: Some("yes".to_string()),
                ..ResumeRequest::default()
            }),
        )
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(status_of(&report, "approved"), Some(NodeStatus::Success));
    assert_eq!(status_of(&report, "rejected"), Some(NodeStatus::Skipped));
    let confirm_outputs = report.state.node_outputs.get("confirm").unwrap();
    assert_eq!(confirm_outputs["confirmed"], true);
}

#[tokio::test]
async fn test_human_confirm_rejection_branch() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node("confirm", "human_confirm"),
            node("approved", "agent_stub"),
            node("rejected", "agent_stub"),
        ],
        vec![
            Edge::data("trigger", "", "confirm", ""),
            Edge::conditional("confirm", "approved", "confirmed"),
            Edge::conditional("confirm", "rejected", "cancelled"),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-7", json!({}), None).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Interrupted { .. }));

    let report = executor
        .run(
            "exec-7",
            Value::Null,
            Some(ResumeRequest {
                input: Some("no".to_string()),
                ..ResumeRequest::default()
            }),
        )
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    assert_eq!(status_of(&report, "rejected"), Some(NodeStatus::Success));
    assert_eq!(status_of(&report, "approved"), Some(NodeStatus::Skipped));
}

#[tokio::test]
async fn test_interrupt_before_pauses_then_resumes() {
    let harness = Harness::new();
    let mut greeter = node("greeter", "code_hi");
    greeter.config.interrupt_before = true;
    let wf = workflow(
        vec![node("trigger", "trigger_chat"), greeter],
        vec![Edge::data("trigger", "text", "greeter", "input")],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor
        .run("exec-8", json!({"text": "pause"}), None)
        .await
        .unwrap();
    match &report.outcome {
        RunOutcome::Interrupted { reason, .. } => {
            assert_eq!(*reason, InterruptReason::HumanConfirmation);
        }
        other => panic!("expected interruption, got {other:?}"),
    }
    // The paused node never ran.
    assert_eq!(status_of(&report, "greeter"), None);

    let report = executor
        .run("exec-8", Value::Null, Some(ResumeRequest::default()))
        .await
        .unwrap();
    match &report.outcome {
        RunOutcome::Completed { final_output } => {
            assert_eq!(final_output.as_ref().unwrap()["result"], "hi pause");
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_node_failure_fails_execution() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node("bomb", "always_fails"),
            node("after", "agent_stub"),
        ],
        vec![
            Edge::data("trigger", "", "bomb", ""),
            Edge::data("bomb", "", "after", ""),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-9", json!({}), None).await.unwrap();
    match &report.outcome {
        RunOutcome::Failed { error_code, .. } => assert_eq!(error_code, "BOOM"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(status_of(&report, "bomb"), Some(NodeStatus::Failed));
    // Downstream was never scheduled.
    assert_eq!(status_of(&report, "after"), None);
}

#[tokio::test]
async fn test_parallel_patch_tiebreak_is_lexicographic() {
    let mut harness = Harness::new();
    harness
        .registry
        .register(fn_component("patch_a", "Patch A", |_| {
            Ok(NodeOutcome::from_raw(json!({"_state_patch": {"k": "from_a"}})))
        }))
        .unwrap();
    harness
        .registry
        .register(fn_component("patch_b", "Patch B", |_| {
            Ok(NodeOutcome::from_raw(json!({"_state_patch": {"k": "from_b"}})))
        }))
        .unwrap();
    harness
        .registry
        .register(fn_component("read_k", "Read K", |ctx| {
            Ok(NodeOutcome::from_raw(json!({"k": ctx.state.lookup("k")})))
        }))
        .unwrap();

    let wf = workflow(
        vec![
            node("trigger", "trigger_manual"),
            node("a_writer", "patch_a"),
            node("b_writer", "patch_b"),
            node("reader", "read_k"),
        ],
        vec![
            Edge::data("trigger", "", "a_writer", ""),
            Edge::data("trigger", "", "b_writer", ""),
            Edge::data("a_writer", "", "reader", ""),
            Edge::data("b_writer", "", "reader", ""),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-10", json!({}), None).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    // b_writer sorts after a_writer, so its patch wins the wave.
    assert_eq!(report.state.get("k"), Some(&json!("from_b")));
}

#[tokio::test]
async fn test_budget_gate_aborts_execution() {
    struct DenyAll;

    #[async_trait::async_trait]
    impl BudgetGate for DenyAll {
        async fn check(&self, _execution_id: &str) -> pipelit_core::Result<()> {
            Err(CoreError::BudgetExceeded {
                epic_id: "epic-1".to_string(),
            })
        }

        async fn charge(
            &self,
            _execution_id: &str,
            _node_id: &str,
            _usage: &TokenUsage,
        ) -> pipelit_core::Result<()> {
            Ok(())
        }
    }

    let harness = Harness::new();
    let wf = workflow(
        vec![node("trigger", "trigger_chat"), node("greeter", "code_hi")],
        vec![Edge::data("trigger", "", "greeter", "")],
    );
    let plan = compile(&wf, "trigger", &harness.registry).unwrap();
    let executor = Executor::new(
        Arc::new(plan),
        harness.bus.clone(),
        harness.checkpoints.clone(),
        Arc::new(NoCredentials),
    )
    .with_budget(Arc::new(DenyAll));

    let report = executor.run("exec-11", json!({}), None).await.unwrap();
    match &report.outcome {
        RunOutcome::Failed { error_code, .. } => assert_eq!(error_code, "BUDGET_EXCEEDED"),
        other => panic!("expected budget failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancellation_before_scheduling() {
    let harness = Harness::new();
    let wf = workflow(
        vec![node("trigger", "trigger_chat"), node("greeter", "code_hi")],
        vec![Edge::data("trigger", "", "greeter", "")],
    );
    let executor = harness.executor(&wf, "trigger");
    executor.cancellation_token().cancel();

    let report = executor.run("exec-12", json!({}), None).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Cancelled));
}

#[tokio::test]
async fn test_subworkflow_suspends_with_child_spawn() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node_with_extra(
                "delegate",
                "subworkflow",
                json!({"workflow_slug": "child-flow", "payload": {"text": "{{ trigger.text }}"}}),
            ),
            node("after", "agent_stub"),
        ],
        vec![
            Edge::data("trigger", "", "delegate", ""),
            Edge::data("delegate", "output", "after", ""),
        ],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor
        .run("exec-13", json!({"text": "from parent"}), None)
        .await
        .unwrap();
    let child = match &report.outcome {
        RunOutcome::Interrupted {
            reason,
            pending_child: Some(child),
            ..
        } => {
            assert_eq!(*reason, InterruptReason::Subworkflow);
            child.clone()
        }
        other => panic!("expected child suspension, got {other:?}"),
    };
    assert_eq!(child.workflow_slug, "child-flow");
    assert_eq!(child.parent_node_id, "delegate");
    // Templated payload was rendered before suspension.
    assert_eq!(child.payload["text"], "from parent");

    // Child completed; inject its final output and resume.
    let report = executor
        .run(
            "exec-13",
            Value::Null,
            Some(ResumeRequest {
                child_result: Some(("delegate".to_string(), json!({"greeting": "hi"}))),
                ..ResumeRequest::default()
            }),
        )
        .await
        .unwrap();

    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));
    let delegate_outputs = report.state.node_outputs.get("delegate").unwrap();
    assert_eq!(delegate_outputs["output"]["greeting"], "hi");
    assert_eq!(status_of(&report, "after"), Some(NodeStatus::Success));
}

#[tokio::test]
async fn test_child_failure_fails_parent_node() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node_with_extra("delegate", "subworkflow", json!({"workflow_slug": "child"})),
        ],
        vec![Edge::data("trigger", "", "delegate", "")],
    );
    let executor = harness.executor(&wf, "trigger");

    let report = executor.run("exec-14", json!({}), None).await.unwrap();
    assert!(matches!(report.outcome, RunOutcome::Interrupted { .. }));

    let report = executor
        .run(
            "exec-14",
            Value::Null,
            Some(ResumeRequest {
                child_error: Some(("delegate".to_string(), "child blew up".to_string())),
                ..ResumeRequest::default()
            }),
        )
        .await
        .unwrap();

    match &report.outcome {
        RunOutcome::Failed { message, .. } => assert!(message.contains("child blew up")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(status_of(&report, "delegate"), Some(NodeStatus::Failed));
}

#[tokio::test]
async fn test_status_events_published() {
    let harness = Harness::new();
    let wf = workflow(
        vec![node("trigger", "trigger_chat"), node("greeter", "code_hi")],
        vec![Edge::data("trigger", "", "greeter", "")],
    );
    let executor = harness.executor(&wf, "trigger");
    let mut rx = harness.bus.subscribe("execution:exec-15");

    let report = executor
        .run("exec-15", json!({"text": "events"}), None)
        .await
        .unwrap();
    assert!(matches!(report.outcome, RunOutcome::Completed { .. }));

    let mut saw_completed = false;
    let mut saw_greeter_success = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            pipelit_core::StatusEvent::ExecutionCompleted { execution_id, .. } => {
                assert_eq!(execution_id, "exec-15");
                saw_completed = true;
            }
            pipelit_core::StatusEvent::NodeStatus {
                node_id, status, ..
            } if node_id == "greeter" && status == NodeStatus::Success => {
                saw_greeter_success = true;
            }
            _ => {}
        }
    }
    assert!(saw_completed);
    assert!(saw_greeter_success);
}

#[tokio::test]
async fn test_compile_is_deterministic() {
    let harness = Harness::new();
    let wf = workflow(
        vec![
            node("trigger", "trigger_chat"),
            node("b", "agent_stub"),
            node("a", "agent_stub"),
            node("z", "agent_stub"),
        ],
        vec![
            Edge::data("trigger", "", "b", ""),
            Edge::data("trigger", "", "a", ""),
            Edge::data("a", "", "z", ""),
            Edge::data("b", "", "z", ""),
        ],
    );
    let first = compile(&wf, "trigger", &harness.registry).unwrap();
    let second = compile(&wf, "trigger", &harness.registry).unwrap();
    assert_eq!(first.waves, second.waves);
    assert_eq!(first.waves[1], vec!["a".to_string(), "b".to_string()]);
}
