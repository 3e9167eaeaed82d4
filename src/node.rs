use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::flow::NodeSpec;
use crate::variables::VariableManager;

/// Input/output payload of one node execution.
pub type JsonMap = Map<String, Value>;

/// Line-based server-sent-event stream: each item is one
/// `data: <json>\n\n` chunk; the final item is `data: [DONE]\n\n`.
pub type SseStream = BoxStream<'static, String>;

/// Per-node lifecycle states during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Diagnostic record kept for every node the engine touches in a run.
/// Never persisted by the engine itself; it surfaces in failure records
/// and in the execution summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionContext {
    pub node_id: String,
    pub flow_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub input_data: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<JsonMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl NodeExecutionContext {
    pub fn new(node_id: impl Into<String>, flow_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            flow_id: flow_id.into(),
            status: NodeStatus::Pending,
            input_data: JsonMap::new(),
            output_data: None,
            error_message: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn mark_running(&mut self, input: JsonMap) {
        self.status = NodeStatus::Running;
        self.input_data = input;
        self.start_time = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, output: JsonMap) {
        self.status = NodeStatus::Completed;
        self.output_data = Some(output);
        self.end_time = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = NodeStatus::Failed;
        self.error_message = Some(error.into());
        self.end_time = Some(Utc::now());
    }

    /// Wall time of the execution in seconds, if it finished.
    pub fn elapsed_secs(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => Some((e - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum NodeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),
    #[error("node `{node_id}` produced no `{key}` output")]
    MissingOutput { node_id: String, key: String },
    #[error("node kind `{0}` does not support streaming execution")]
    SseUnsupported(String),
}

/// Capability contract every node kind implements.
///
/// `execute` returns the node's output map, which must include the key named
/// by the node's `outputParams` binding (default `last_message`) and may
/// carry auxiliary keys such as `condition_result`. A failed node returns
/// `Err`; the engine turns that into a structured per-path failure.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// The shared variable namespace this executor was constructed with.
    fn variables(&self) -> &Arc<VariableManager>;

    async fn execute(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: &JsonMap,
    ) -> Result<JsonMap, NodeError>;

    /// Streaming execution. Only agent-style executors implement this;
    /// everything else reports the kind as unsupported.
    fn sse_execute(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: JsonMap,
    ) -> Result<SseStream, NodeError> {
        let _ = (node_id, input);
        Err(NodeError::SseUnsupported(node.kind.clone()))
    }

    fn supports_sse(&self) -> bool {
        false
    }

    /// Static parameter checks; the default accepts anything.
    fn validate_params(&self, node: &NodeSpec) -> Vec<String> {
        let _ = node;
        Vec::new()
    }

    /// Deep template resolution of the node's kind-specific config against
    /// the current variable namespace.
    fn resolve_params(&self, node: &NodeSpec) -> Value {
        self.variables()
            .resolve_template_value(&Value::Object(node.data.config.extra.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticExecutor {
        vars: Arc<VariableManager>,
    }

    #[async_trait]
    impl NodeExecutor for StaticExecutor {
        fn variables(&self) -> &Arc<VariableManager> {
            &self.vars
        }

        async fn execute(
            &self,
            _node_id: &str,
            _node: &NodeSpec,
            _input: &JsonMap,
        ) -> Result<JsonMap, NodeError> {
            Ok(JsonMap::new())
        }
    }

    fn node_with_config(extra: Value) -> NodeSpec {
        serde_json::from_value(json!({
            "id": "n1",
            "type": "function",
            "data": {"config": extra}
        }))
        .unwrap()
    }

    #[test]
    fn default_sse_execute_is_unsupported() {
        let exec = StaticExecutor {
            vars: Arc::new(VariableManager::new()),
        };
        let node = node_with_config(json!({}));
        assert!(!exec.supports_sse());
        match exec.sse_execute("n1", &node, JsonMap::new()) {
            Err(NodeError::SseUnsupported(kind)) => assert_eq!(kind, "function"),
            Ok(_) => panic!("expected SseUnsupported, got Ok(stream)"),
            Err(other) => panic!("expected SseUnsupported, got {other:?}"),
        }
    }

    #[test]
    fn resolve_params_walks_the_config() {
        let vars = Arc::new(VariableManager::new());
        vars.set("who", json!("ops"));
        let exec = StaticExecutor { vars };
        let node = node_with_config(json!({"greeting": "hi {{who}}", "count": 2}));
        let resolved = exec.resolve_params(&node);
        assert_eq!(resolved["greeting"], json!("hi ops"));
        assert_eq!(resolved["count"], json!(2));
    }

    #[test]
    fn context_lifecycle_tracks_timestamps() {
        let mut ctx = NodeExecutionContext::new("n1", "flow");
        assert_eq!(ctx.status, NodeStatus::Pending);
        ctx.mark_running(JsonMap::new());
        assert_eq!(ctx.status, NodeStatus::Running);
        assert!(ctx.start_time.is_some());
        ctx.mark_failed("boom");
        assert_eq!(ctx.status, NodeStatus::Failed);
        assert_eq!(ctx.error_message.as_deref(), Some("boom"));
        assert!(ctx.elapsed_secs().is_some());
    }
}
