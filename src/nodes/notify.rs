use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::flow::NodeSpec;
use crate::node::{JsonMap, NodeError, NodeExecutor};
use crate::registry::NodeCtorArgs;
use crate::variables::VariableManager;

/// Notification node: posts a `{title, message, channel}` payload to a
/// configured webhook and forwards the rendered message as its output.
pub struct NotifyNode {
    vars: Arc<VariableManager>,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NotifyConfig {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default = "default_message")]
    message: String,
    #[serde(default = "default_channel")]
    channel: String,
    #[serde(default = "default_timeout", rename = "timeoutSecs", alias = "timeout_secs")]
    timeout_secs: u64,
}

fn default_message() -> String {
    "{{last_message}}".to_string()
}

fn default_channel() -> String {
    "default".to_string()
}

fn default_timeout() -> u64 {
    10
}

impl NotifyNode {
    pub fn new(args: &NodeCtorArgs) -> Self {
        Self {
            vars: args.variables.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn parse_config(&self, node: &NodeSpec) -> Result<NotifyConfig, NodeError> {
        serde_json::from_value(self.resolve_params(node))
            .map_err(|e| NodeError::InvalidInput(format!("notification config: {e}")))
    }
}

#[async_trait]
impl NodeExecutor for NotifyNode {
    fn variables(&self) -> &Arc<VariableManager> {
        &self.vars
    }

    async fn execute(
        &self,
        node_id: &str,
        node: &NodeSpec,
        _input: &JsonMap,
    ) -> Result<JsonMap, NodeError> {
        let config = self.parse_config(node)?;

        let payload = json!({
            "title": config.title,
            "message": config.message,
            "channel": config.channel,
        });

        let response = self
            .client
            .post(&config.url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .json(&payload)
            .send()
            .await
            .map_err(|e| NodeError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NodeError::ExecutionFailed(format!(
                "notification webhook returned {}",
                response.status()
            )));
        }
        info!("notification node {node_id} delivered to `{}`", config.channel);

        let mut output = JsonMap::new();
        output.insert(
            node.data.config.output_params.clone(),
            Value::String(config.message),
        );
        Ok(output)
    }

    fn validate_params(&self, node: &NodeSpec) -> Vec<String> {
        match serde_json::from_value::<NotifyConfig>(Value::Object(node.data.config.extra.clone()))
        {
            Ok(config) if config.url.trim().is_empty() => {
                vec![format!("node {}: notification needs a webhook url", node.id)]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("node {}: {e}", node.id)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(vars: Arc<VariableManager>) -> NotifyNode {
        NotifyNode::new(&NodeCtorArgs {
            variables: vars,
            start_node_id: None,
        })
    }

    fn node(config: Value) -> NodeSpec {
        serde_json::from_value(json!({
            "id": "ping", "type": "notification", "data": {"config": config}
        }))
        .unwrap()
    }

    #[test]
    fn message_template_resolves_from_variables() {
        let vars = Arc::new(VariableManager::new());
        vars.set("last_message", json!("deploy finished"));
        let exec = exec(vars);
        let config = exec
            .parse_config(&node(json!({"url": "https://hooks.example.com/x"})))
            .unwrap();
        assert_eq!(config.message, "deploy finished");
        assert_eq!(config.channel, "default");
    }

    #[test]
    fn validate_params_requires_url() {
        let exec = exec(Arc::new(VariableManager::new()));
        assert_eq!(exec.validate_params(&node(json!({}))).len(), 1);
        assert!(exec
            .validate_params(&node(json!({"url": "https://hooks.example.com/x"})))
            .is_empty());
    }
}
