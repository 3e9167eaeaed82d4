use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::flow::NodeSpec;
use crate::node::{JsonMap, NodeError, NodeExecutor};
use crate::registry::NodeCtorArgs;
use crate::variables::VariableManager;

/// HTTP action node: fires one request built from template-resolved config
/// and exposes the (JSON-parsed when possible) response body as its output.
pub struct HttpActionNode {
    vars: Arc<VariableManager>,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HttpConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    /// Query parameters.
    #[serde(default)]
    params: HashMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default = "default_timeout", rename = "timeoutSecs", alias = "timeout_secs")]
    timeout_secs: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl HttpActionNode {
    pub fn new(args: &NodeCtorArgs) -> Self {
        Self {
            vars: args.variables.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn parse_config(&self, node: &NodeSpec) -> Result<HttpConfig, NodeError> {
        let resolved = self.resolve_params(node);
        serde_json::from_value(resolved)
            .map_err(|e| NodeError::InvalidInput(format!("http config: {e}")))
    }
}

#[async_trait]
impl NodeExecutor for HttpActionNode {
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
        let method = Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| NodeError::InvalidInput(format!("bad http method: {}", config.method)))?;
        let url = url::Url::parse(&config.url)
            .map_err(|e| NodeError::InvalidInput(format!("bad url `{}`: {e}", config.url)))?;

        debug!("http node {node_id}: {method} {url}");

        let mut request = self
            .client
            .request(method, url)
            .timeout(Duration::from_secs(config.timeout_secs))
            .query(&config.params);
        for (name, value) in &config.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &config.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            error!("http node {node_id} request failed: {e}");
            NodeError::ConnectionFailed(e.to_string())
        })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("reading response body: {e}")))?;
        let body_value = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let mut output = JsonMap::new();
        output.insert(node.data.config.output_params.clone(), body_value);
        output.insert("status_code".to_string(), Value::from(status));
        Ok(output)
    }

    fn validate_params(&self, node: &NodeSpec) -> Vec<String> {
        // validate the raw config; template placeholders resolve at run time
        match serde_json::from_value::<HttpConfig>(Value::Object(node.data.config.extra.clone())) {
            Ok(config) if config.url.trim().is_empty() => {
                vec![format!("node {}: http action needs a url", node.id)]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("node {}: {e}", node.id)],
        }
    }
}
