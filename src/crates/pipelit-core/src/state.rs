//! Mutable execution state
//!
//! One [`ExecutionState`] exists per live execution, owned by the executor
//! driving it; external components reach it only through these methods.
//! Reserved keys of the source model (`_route`, `_messages`, `_state_patch`,
//! `_token_usage`) are modelled as the tagged [`NodeUpdate`] struct so the
//! state-merge step is a total, explicit function rather than key magic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token and money usage emitted by a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// The tagged result of a successful node run
///
/// `outputs` is the node's flat output mapping; underscore-prefixed keys are
/// filtered out of the public `node_outputs` view when recorded. The other
/// fields carry what the source modelled as reserved state keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    /// Flat output mapping; becomes `node_outputs[node_id]` minus `_` keys
    #[serde(default)]
    pub outputs: Map<String, Value>,

    /// Route emitted for conditional-edge selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    /// Messages appended to the conversation transcript
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Value>,

    /// Free-form patch merged into the root state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_patch: Option<Map<String, Value>>,

    /// Usage routed to the cost accountant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl NodeUpdate {
    /// An update carrying only plain outputs
    pub fn from_outputs(outputs: Map<String, Value>) -> Self {
        Self {
            outputs,
            ..Self::default()
        }
    }

    /// Parse a raw output mapping, lifting the reserved underscore keys
    /// into their tagged fields
    ///
    /// Used by adapters around runnables that still speak the flat-map
    /// dialect. Unknown underscore keys stay in `outputs` and are filtered
    /// from the public view at record time.
    pub fn from_raw(value: Value) -> Self {
        let mut outputs = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("output".to_string(), other);
                map
            }
        };

        let route = outputs
            .remove("_route")
            .and_then(|v| v.as_str().map(|s| s.to_string()));
        let messages = outputs
            .remove("_messages")
            .and_then(|v| match v {
                Value::Array(items) => Some(items),
                other => Some(vec![other]),
            })
            .unwrap_or_default();
        let state_patch = outputs.remove("_state_patch").and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        });
        let token_usage = outputs
            .remove("_token_usage")
            .and_then(|v| serde_json::from_value(v).ok());

        Self {
            outputs,
            route,
            messages,
            state_patch,
            token_usage,
        }
    }
}

/// A loop's iterator frame; inner loops shadow outer frames
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopScope {
    /// The element currently being processed
    pub current: Value,
    /// Zero-based iteration index
    pub index: u64,
}

/// Per-execution mutable state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionState {
    /// The firing trigger's payload; read-only after seeding
    #[serde(default)]
    pub trigger: Value,

    /// Visible outputs per completed node (underscore keys filtered)
    #[serde(default)]
    pub node_outputs: Map<String, Value>,

    /// Ordered appended message transcript
    #[serde(default)]
    pub messages: Vec<Value>,

    /// Last-emitted route string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,

    /// Caller-supplied context, opaque to the core
    #[serde(default)]
    pub user_context: Value,

    /// Final outputs of completed child workflows, keyed by the parent node
    #[serde(default)]
    pub subworkflow_results: Map<String, Value>,

    /// User input supplied when resuming a suspended execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_input: Option<String>,

    /// Active loop iterator frame, if inside a loop body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_scope: Option<LoopScope>,

    /// Free-form keys written via state patches
    #[serde(default)]
    pub vars: Map<String, Value>,
}

impl ExecutionState {
    /// Seed a fresh state with the firing trigger's payload
    pub fn seeded(trigger: Value) -> Self {
        Self {
            trigger,
            ..Self::default()
        }
    }

    /// Record a completed node's update
    ///
    /// Filters underscore-prefixed keys out of the public view, applies the
    /// route, appends messages, and merges the state patch. Token usage is
    /// the executor's concern and is not stored here.
    pub fn record_node_output(&mut self, node_id: &str, update: &NodeUpdate) {
        let visible: Map<String, Value> = update
            .outputs
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.node_outputs
            .insert(node_id.to_string(), Value::Object(visible));

        if let Some(route) = &update.route {
            self.route = Some(route.clone());
        }
        for message in &update.messages {
            self.messages.push(message.clone());
        }
        if let Some(patch) = &update.state_patch {
            self.merge_patch(patch.clone());
        }
    }

    /// Merge a free-form patch into the root state
    pub fn merge_patch(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.vars.insert(key, value);
        }
    }

    /// Append one message to the transcript
    pub fn append_message(&mut self, message: Value) {
        self.messages.push(message);
    }

    /// Read a free-form key
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Write a free-form key
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Resolve a dotted path against the read-only view
    ///
    /// The first segment selects a root: the `trigger` shorthand, a reserved
    /// view (`node_outputs`, `messages`, `route`, `user_context`, `loop`),
    /// a node id (aliasing that node's visible outputs), or a free-form key.
    /// Missing paths resolve to `None`; list segments may be numeric indices.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let normalized = path.replace('[', ".").replace(']', "");
        let mut segments = normalized.split('.').filter(|s| !s.is_empty());
        let root = segments.next()?;

        let mut current = self.root_value(root)?;
        for segment in segments {
            current = match current {
                Value::Object(ref map) => map.get(segment)?.clone(),
                Value::Array(ref items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?.clone()
                }
                _ => return None,
            };
        }
        Some(current)
    }

    fn root_value(&self, segment: &str) -> Option<Value> {
        match segment {
            "trigger" => Some(self.trigger.clone()),
            "node_outputs" => Some(Value::Object(self.node_outputs.clone())),
            "messages" | "_messages" => Some(Value::Array(self.messages.clone())),
            "route" => self.route.clone().map(Value::String),
            "user_context" => Some(self.user_context.clone()),
            "loop" | "_loop" => self.loop_scope.as_ref().map(|scope| {
                let mut map = Map::new();
                map.insert("current".to_string(), scope.current.clone());
                map.insert("index".to_string(), Value::from(scope.index));
                Value::Object(map)
            }),
            "_subworkflow_results" => Some(Value::Object(self.subworkflow_results.clone())),
            other => self
                .node_outputs
                .get(other)
                .cloned()
                .or_else(|| self.vars.get(other).cloned()),
        }
    }
}
