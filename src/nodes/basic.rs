use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::flow::NodeSpec;
use crate::node::{JsonMap, NodeError, NodeExecutor};
use crate::nodes::input_value;
use crate::registry::NodeCtorArgs;
use crate::variables::VariableManager;

/// Entry node: passes the run input through under the declared output key.
/// Registered for the `restful`, `openai`, `celery` and `start` kinds.
pub struct EntryNode {
    vars: Arc<VariableManager>,
}

impl EntryNode {
    pub fn new(args: &NodeCtorArgs) -> Self {
        Self {
            vars: args.variables.clone(),
        }
    }
}

#[async_trait]
impl NodeExecutor for EntryNode {
    fn variables(&self) -> &Arc<VariableManager> {
        &self.vars
    }

    async fn execute(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: &JsonMap,
    ) -> Result<JsonMap, NodeError> {
        let value = input_value(node, input);
        debug!("entry node {node_id} forwarding input");
        let mut output = JsonMap::new();
        output.insert(node.data.config.output_params.clone(), value);
        Ok(output)
    }
}

/// Exit node: terminal passthrough. The value it forwards becomes the run's
/// final `last_message` when it is the last node on the path.
pub struct ExitNode {
    vars: Arc<VariableManager>,
}

impl ExitNode {
    pub fn new(args: &NodeCtorArgs) -> Self {
        Self {
            vars: args.variables.clone(),
        }
    }
}

#[async_trait]
impl NodeExecutor for ExitNode {
    fn variables(&self) -> &Arc<VariableManager> {
        &self.vars
    }

    async fn execute(
        &self,
        _node_id: &str,
        node: &NodeSpec,
        input: &JsonMap,
    ) -> Result<JsonMap, NodeError> {
        let value = input_value(node, input);
        let mut output = JsonMap::new();
        output.insert(node.data.config.output_params.clone(), value.clone());
        // annotate the terminal value for the run record
        output.insert("final".to_string(), Value::Bool(true));
        Ok(output)
    }
}
