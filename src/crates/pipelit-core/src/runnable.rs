//! The runnable contract between the executor and component behaviors
//!
//! Node behaviors (LLM calls, HTTP, shell, memory stores) live outside the
//! core. For each registered component type a builder turns a node plus its
//! resolved capabilities into a [`Runnable`]; the executor invokes it with the
//! rendered config, a read-only state view, and a cooperative cancellation
//! token, and interprets the returned [`NodeOutcome`].
//!
//! Suspension happens only at sentinel boundaries: a runnable that wants to
//! pause the execution returns [`NodeOutcome::SuspendForInput`],
//! [`NodeOutcome::SuspendForChild`], or [`NodeOutcome::Delay`] - never by
//! blocking inside opaque code.

use crate::error::Result;
use crate::graph::{NodeConfig, NodeId};
use crate::state::{ExecutionState, NodeUpdate};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A sub-component node bound to a consuming node at build time
///
/// Carries the sub-component's snapshot so the consuming runnable can
/// resolve credentials and destructure its config without reaching back
/// into the graph.
#[derive(Debug, Clone)]
pub struct CapabilityRef {
    pub node_id: NodeId,
    pub component_type: String,
    pub config: NodeConfig,
}

/// Capabilities resolved from sub-component edges during compilation
#[derive(Debug, Clone, Default)]
pub struct ResolvedCapabilities {
    pub model: Option<CapabilityRef>,
    pub tools: Vec<CapabilityRef>,
    pub memory: Option<CapabilityRef>,
    pub output_parser: Option<CapabilityRef>,
}

/// Resolves credential references into plaintext secret bundles
///
/// The core treats secrets opaquely; encryption at rest is the embedder's
/// concern.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, credential_ref: &str) -> Result<Value>;
}

/// Resolver for embedders without a credential store; every lookup fails
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve(&self, credential_ref: &str) -> Result<Value> {
        Err(crate::error::CoreError::Execution(format!(
            "no credential store configured (requested '{credential_ref}')"
        )))
    }
}

/// A node's config after template rendering, immediately before it runs
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    /// Rendered system prompt (empty when the node declares none)
    pub system_prompt: String,

    /// `extra_config` with every string value rendered
    pub extra: Map<String, Value>,
}

impl ResolvedConfig {
    /// String field from the rendered extra config
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }

    /// Boolean field from the rendered extra config
    pub fn bool_field(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }
}

/// Everything a runnable sees when it executes
pub struct RunContext<'a> {
    pub execution_id: &'a str,
    pub node_id: &'a str,
    pub config: &'a ResolvedConfig,
    /// Read-only view; mutation happens only through the executor's merge
    pub state: &'a ExecutionState,
    pub capabilities: &'a ResolvedCapabilities,
    pub credentials: &'a Arc<dyn CredentialResolver>,
    /// Cooperative cancellation; long-running work should poll it
    pub cancel: &'a CancellationToken,
}

/// What a node run produced
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Normal completion with a tagged update
    Outputs(NodeUpdate),

    /// Suspend until a human supplies input (the prompt is user-visible)
    SuspendForInput { prompt: String },

    /// Suspend until the named child workflow completes
    SuspendForChild {
        workflow_slug: String,
        payload: Value,
    },

    /// Suspend for a timed delay before resuming at this node
    Delay { seconds: f64 },
}

impl NodeOutcome {
    /// Normal completion from a raw output mapping
    pub fn from_raw(value: Value) -> Self {
        NodeOutcome::Outputs(NodeUpdate::from_raw(value))
    }
}

/// A component behavior invoked by the executor
#[async_trait]
pub trait Runnable: Send + Sync {
    async fn run(&self, ctx: RunContext<'_>) -> Result<NodeOutcome>;
}

/// Adapter turning a synchronous closure into a [`Runnable`]
///
/// The workhorse for tests and for simple components that only transform
/// state (code nodes, formatters).
pub struct FnRunnable {
    func: Box<dyn for<'a> Fn(&RunContext<'a>) -> Result<NodeOutcome> + Send + Sync>,
}

impl FnRunnable {
    pub fn new(
        func: impl for<'a> Fn(&RunContext<'a>) -> Result<NodeOutcome> + Send + Sync + 'static,
    ) -> Self {
        Self {
            func: Box::new(func),
        }
    }

    /// Wrap into the `Arc<dyn Runnable>` builders return
    pub fn arc(
        func: impl for<'a> Fn(&RunContext<'a>) -> Result<NodeOutcome> + Send + Sync + 'static,
    ) -> Arc<dyn Runnable> {
        Arc::new(Self::new(func))
    }
}

#[async_trait]
impl Runnable for FnRunnable {
    async fn run(&self, ctx: RunContext<'_>) -> Result<NodeOutcome> {
        (self.func)(&ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context<'a>(
        state: &'a ExecutionState,
        config: &'a ResolvedConfig,
        caps: &'a ResolvedCapabilities,
        creds: &'a Arc<dyn CredentialResolver>,
        cancel: &'a CancellationToken,
    ) -> RunContext<'a> {
        RunContext {
            execution_id: "exec-1",
            node_id: "n1",
            config,
            state,
            capabilities: caps,
            credentials: creds,
            cancel,
        }
    }

    #[tokio::test]
    async fn test_fn_runnable_reads_state() {
        let state = ExecutionState::seeded(json!({"text": "world"}));
        let config = ResolvedConfig::default();
        let caps = ResolvedCapabilities::default();
        let creds: Arc<dyn CredentialResolver> = Arc::new(NoCredentials);
        let cancel = CancellationToken::new();

        let runnable = FnRunnable::new(|ctx| {
            let text = ctx
                .state
                .lookup("trigger.text")
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default();
            Ok(NodeOutcome::from_raw(json!({"result": format!("hi {text}")})))
        });

        let outcome = runnable
            .run(context(&state, &config, &caps, &creds, &cancel))
            .await
            .unwrap();
        match outcome {
            NodeOutcome::Outputs(update) => {
                assert_eq!(update.outputs["result"], "hi world");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_credentials_rejects() {
        let creds = NoCredentials;
        assert!(creds.resolve("cred-1").await.is_err());
    }
}
