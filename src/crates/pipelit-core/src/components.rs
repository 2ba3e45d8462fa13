//! Built-in control-flow component types
//!
//! The core registers the component types whose semantics the executor
//! defines: the trigger markers, `switch`, `loop`, `human_confirm`, and
//! `subworkflow`. Everything with external behavior (LLM calls, HTTP,
//! shell, code, memory stores) is registered by the embedder through the
//! same [`PortRegistry`] interface.

use crate::error::{CoreError, Result};
use crate::ports::{ComponentDef, DataType, PortRegistry, PortSpec};
use crate::runnable::{FnRunnable, NodeOutcome, RunContext, Runnable};
use crate::state::NodeUpdate;
use crate::switch::{evaluate_rules, SwitchRule};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Inputs accepted when resuming a human confirmation, after trim and
/// lowercasing
const CONFIRM_WORDS: [&str; 5] = ["yes", "y", "confirm", "true", "1"];

/// Register every built-in component type
pub fn register_builtins(registry: &mut PortRegistry) -> Result<()> {
    for (type_name, display_name, outputs) in trigger_types() {
        let mut def = ComponentDef::new(type_name, display_name).trigger();
        for port in outputs {
            def = def.with_output(port);
        }
        registry.register(def.with_builder(|_, _| {
            let runnable: Arc<dyn Runnable> = Arc::new(TriggerRunnable);
            Ok(runnable)
        }))?;
    }

    registry.register(
        ComponentDef::new("switch", "Switch")
            .route_emitter()
            .with_input(PortSpec::optional("input", DataType::Any))
            .with_output(PortSpec::optional("route", DataType::String))
            .with_builder(|_, _| {
                let runnable: Arc<dyn Runnable> = Arc::new(SwitchRunnable);
                Ok(runnable)
            }),
    )?;

    registry.register(
        ComponentDef::new("loop", "Loop")
            .looping()
            .with_input(PortSpec::optional("items", DataType::Array))
            .with_output(PortSpec::optional("results", DataType::Array))
            .with_output(PortSpec::optional("count", DataType::Number))
            .with_builder(|_, _| {
                let runnable: Arc<dyn Runnable> = Arc::new(LoopPlaceholder);
                Ok(runnable)
            }),
    )?;

    registry.register(
        ComponentDef::new("human_confirm", "Human Confirmation")
            .route_emitter()
            .interrupting()
            .with_input(PortSpec::optional("input", DataType::Any))
            .with_output(PortSpec::optional("confirmed", DataType::Boolean))
            .with_output(PortSpec::optional("user_response", DataType::String))
            .with_builder(|_, _| {
                let runnable: Arc<dyn Runnable> = Arc::new(HumanConfirmRunnable);
                Ok(runnable)
            }),
    )?;

    registry.register(
        ComponentDef::new("subworkflow", "Sub-workflow")
            .interrupting()
            .with_input(PortSpec::optional("input", DataType::Any))
            .with_output(PortSpec::optional("output", DataType::Any))
            .with_builder(|_, _| {
                let runnable: Arc<dyn Runnable> = Arc::new(SubworkflowRunnable);
                Ok(runnable)
            }),
    )?;

    Ok(())
}

fn trigger_types() -> Vec<(&'static str, &'static str, Vec<PortSpec>)> {
    vec![
        (
            "trigger_chat",
            "Chat Trigger",
            vec![PortSpec::optional("text", DataType::String)],
        ),
        (
            "trigger_manual",
            "Manual Trigger",
            vec![PortSpec::optional("text", DataType::String)],
        ),
        (
            "trigger_schedule",
            "Schedule Trigger",
            vec![PortSpec::optional("payload", DataType::Object)],
        ),
        (
            "trigger_telegram",
            "Telegram Trigger",
            vec![
                PortSpec::optional("text", DataType::String),
                PortSpec::optional("user_id", DataType::Number),
                PortSpec::optional("chat_id", DataType::Number),
            ],
        ),
        (
            "trigger_workflow",
            "Workflow Trigger",
            vec![PortSpec::optional("payload", DataType::Object)],
        ),
        (
            "trigger_error",
            "Error Trigger",
            vec![
                PortSpec::optional("message", DataType::String),
                PortSpec::optional("error_code", DataType::String),
                PortSpec::optional("source_node_id", DataType::String),
            ],
        ),
    ]
}

/// Surfaces the firing trigger's payload as the trigger node's outputs
struct TriggerRunnable;

#[async_trait]
impl Runnable for TriggerRunnable {
    async fn run(&self, ctx: RunContext<'_>) -> Result<NodeOutcome> {
        let outputs = match &ctx.state.trigger {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other.clone());
                map
            }
        };
        Ok(NodeOutcome::Outputs(NodeUpdate::from_outputs(outputs)))
    }
}

/// Evaluates the node's rule list and emits the matching rule id as the route
struct SwitchRunnable;

#[async_trait]
impl Runnable for SwitchRunnable {
    async fn run(&self, ctx: RunContext<'_>) -> Result<NodeOutcome> {
        let rules: Vec<SwitchRule> = match ctx.config.extra.get("rules") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                CoreError::node_failed(
                    ctx.node_id,
                    "INVALID_RULES",
                    format!("switch rules failed to parse: {err}"),
                )
            })?,
            None => Vec::new(),
        };
        let enable_fallback = ctx.config.bool_field("enable_fallback").unwrap_or(false);
        let route = evaluate_rules(&rules, enable_fallback, ctx.state);
        Ok(NodeOutcome::Outputs(NodeUpdate {
            outputs: Map::from_iter([("route".to_string(), Value::String(route.clone()))]),
            route: Some(route),
            ..NodeUpdate::default()
        }))
    }
}

/// First visit suspends for input; on resume the answer picks the branch
struct HumanConfirmRunnable;

#[async_trait]
impl Runnable for HumanConfirmRunnable {
    async fn run(&self, ctx: RunContext<'_>) -> Result<NodeOutcome> {
        let Some(input) = &ctx.state.resume_input else {
            let prompt = if !ctx.config.system_prompt.is_empty() {
                ctx.config.system_prompt.clone()
            } else {
                ctx.config
                    .str_field("prompt")
                    .unwrap_or("Please confirm to continue.")
                    .to_string()
            };
            return Ok(NodeOutcome::SuspendForInput { prompt });
        };

        let normalized = input.trim().to_lowercase();
        let confirmed = CONFIRM_WORDS.contains(&normalized.as_str());
        let route = if confirmed { "confirmed" } else { "cancelled" };
        Ok(NodeOutcome::Outputs(NodeUpdate {
            outputs: Map::from_iter([
                ("confirmed".to_string(), Value::Bool(confirmed)),
                ("user_response".to_string(), Value::String(input.clone())),
            ]),
            route: Some(route.to_string()),
            ..NodeUpdate::default()
        }))
    }
}

/// Two-phase delegation: suspend for the child, then return its output
struct SubworkflowRunnable;

#[async_trait]
impl Runnable for SubworkflowRunnable {
    async fn run(&self, ctx: RunContext<'_>) -> Result<NodeOutcome> {
        if let Some(result) = ctx.state.subworkflow_results.get(ctx.node_id) {
            return Ok(NodeOutcome::Outputs(NodeUpdate::from_outputs(
                Map::from_iter([("output".to_string(), result.clone())]),
            )));
        }

        let slug = ctx
            .config
            .str_field("workflow_slug")
            .or_else(|| ctx.config.str_field("target"))
            .ok_or_else(|| {
                CoreError::node_failed(
                    ctx.node_id,
                    "MISSING_TARGET",
                    "subworkflow node has no workflow_slug configured",
                )
            })?;
        let payload = ctx
            .config
            .extra
            .get("payload")
            .cloned()
            .unwrap_or_else(|| json!({"trigger": ctx.state.trigger}));
        Ok(NodeOutcome::SuspendForChild {
            workflow_slug: slug.to_string(),
            payload,
        })
    }
}

/// Loop nodes are driven by the executor's frame machinery; reaching this
/// runnable means the plan was constructed by hand without a frame
struct LoopPlaceholder;

#[async_trait]
impl Runnable for LoopPlaceholder {
    async fn run(&self, ctx: RunContext<'_>) -> Result<NodeOutcome> {
        Err(CoreError::Execution(format!(
            "loop node '{}' invoked directly; loops are driven by the executor",
            ctx.node_id
        )))
    }
}

/// Convenience for tests and embedders: a component that runs a closure
pub fn fn_component(
    type_name: &str,
    display_name: &str,
    func: impl for<'a> Fn(&RunContext<'a>) -> Result<NodeOutcome> + Send + Sync + Clone + 'static,
) -> ComponentDef {
    ComponentDef::new(type_name, display_name).with_builder(move |_, _| {
        Ok(FnRunnable::arc(func.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runnable::{
        CredentialResolver, NoCredentials, ResolvedCapabilities, ResolvedConfig,
    };
    use crate::state::ExecutionState;
    use tokio_util::sync::CancellationToken;

    struct Ctx {
        state: ExecutionState,
        config: ResolvedConfig,
        caps: ResolvedCapabilities,
        creds: Arc<dyn CredentialResolver>,
        cancel: CancellationToken,
    }

    impl Ctx {
        fn new(state: ExecutionState) -> Self {
            Self {
                state,
                config: ResolvedConfig::default(),
                caps: ResolvedCapabilities::default(),
                creds: Arc::new(NoCredentials),
                cancel: CancellationToken::new(),
            }
        }

        fn run_context(&self) -> RunContext<'_> {
            RunContext {
                execution_id: "exec-1",
                node_id: "node-1",
                config: &self.config,
                state: &self.state,
                capabilities: &self.caps,
                credentials: &self.creds,
                cancel: &self.cancel,
            }
        }
    }

    #[test]
    fn test_register_builtins() {
        let mut registry = PortRegistry::new();
        register_builtins(&mut registry).unwrap();
        for type_name in [
            "trigger_chat",
            "trigger_manual",
            "trigger_schedule",
            "trigger_telegram",
            "trigger_workflow",
            "trigger_error",
            "switch",
            "loop",
            "human_confirm",
            "subworkflow",
        ] {
            assert!(registry.contains(type_name), "missing {type_name}");
        }
        assert!(registry.get("switch").unwrap().emits_route);
        assert!(registry.get("loop").unwrap().is_loop);
        assert!(registry.get("subworkflow").unwrap().interrupting);
    }

    #[tokio::test]
    async fn test_trigger_surfaces_payload() {
        let ctx = Ctx::new(ExecutionState::seeded(json!({"text": "hello"})));
        let outcome = TriggerRunnable.run(ctx.run_context()).await.unwrap();
        match outcome {
            NodeOutcome::Outputs(update) => assert_eq!(update.outputs["text"], "hello"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_human_confirm_suspends_then_confirms() {
        let mut ctx = Ctx::new(ExecutionState::seeded(json!({})));
        ctx.config.extra.insert("prompt".to_string(), json!("Deploy?"));

        match HumanConfirmRunnable.run(ctx.run_context()).await.unwrap() {
            NodeOutcome::SuspendForInput { prompt } => assert_eq!(prompt, "Deploy?"),
            other => panic!("expected suspension, got {other:?}"),
        }

        ctx.state.resume_input = Some("  YES ".to_string());
        match HumanConfirmRunnable.run(ctx.run_context()).await.unwrap() {
            NodeOutcome::Outputs(update) => {
                assert_eq!(update.outputs["confirmed"], true);
                assert_eq!(update.route.as_deref(), Some("confirmed"));
            }
            other => panic!("expected outputs, got {other:?}"),
        }

        ctx.state.resume_input = Some("nope".to_string());
        match HumanConfirmRunnable.run(ctx.run_context()).await.unwrap() {
            NodeOutcome::Outputs(update) => {
                assert_eq!(update.outputs["confirmed"], false);
                assert_eq!(update.route.as_deref(), Some("cancelled"));
            }
            other => panic!("expected outputs, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subworkflow_two_phase() {
        let mut ctx = Ctx::new(ExecutionState::seeded(json!({"text": "hi"})));
        ctx.config
            .extra
            .insert("workflow_slug".to_string(), json!("child-flow"));

        match SubworkflowRunnable.run(ctx.run_context()).await.unwrap() {
            NodeOutcome::SuspendForChild { workflow_slug, .. } => {
                assert_eq!(workflow_slug, "child-flow");
            }
            other => panic!("expected child suspension, got {other:?}"),
        }

        ctx.state
            .subworkflow_results
            .insert("node-1".to_string(), json!({"answer": 42}));
        match SubworkflowRunnable.run(ctx.run_context()).await.unwrap() {
            NodeOutcome::Outputs(update) => {
                assert_eq!(update.outputs["output"]["answer"], 42);
            }
            other => panic!("expected outputs, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_switch_runnable_routes() {
        let mut ctx = Ctx::new(ExecutionState::seeded(json!({"text": "y"})));
        ctx.config.extra.insert(
            "rules".to_string(),
            json!([
                {"id": "a", "field": "trigger.text", "operator": "equals", "value": "x"},
                {"id": "b", "field": "trigger.text", "operator": "equals", "value": "y"}
            ]),
        );
        match SwitchRunnable.run(ctx.run_context()).await.unwrap() {
            NodeOutcome::Outputs(update) => assert_eq!(update.route.as_deref(), Some("b")),
            other => panic!("expected outputs, got {other:?}"),
        }
    }
}
