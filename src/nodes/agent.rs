use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::flow::NodeSpec;
use crate::node::{JsonMap, NodeError, NodeExecutor, SseStream};
use crate::nodes::{input_value, value_as_string};
use crate::registry::NodeCtorArgs;
use crate::variables::VariableManager;

/// Agent node: one OpenAI-compatible chat-completions call.
///
/// The resolved input value becomes the user message; the assistant reply
/// becomes the node output. This is the only built-in that supports the
/// single-stream execution mode.
pub struct AgentNode {
    vars: Arc<VariableManager>,
    client: reqwest::Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentConfig {
    #[serde(default = "default_model")]
    model: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default = "default_api_base")]
    api_base: String,
    /// Falls back to the `OPENAI_API_KEY` environment variable.
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

impl AgentConfig {
    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    fn resolve_api_key(&self) -> Result<String, NodeError> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                NodeError::InvalidInput(
                    "agent node has no api key (config `apiKey` or OPENAI_API_KEY)".to_string(),
                )
            })
    }

    fn request_body(&self, user_message: &str, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": user_message}));
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

impl AgentNode {
    pub fn new(args: &NodeCtorArgs) -> Self {
        Self {
            vars: args.variables.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn parse_config(&self, node: &NodeSpec) -> Result<AgentConfig, NodeError> {
        serde_json::from_value(self.resolve_params(node))
            .map_err(|e| NodeError::InvalidInput(format!("agent config: {e}")))
    }
}

fn choice_array_to_string(parts: Vec<Value>) -> String {
    parts
        .into_iter()
        .filter_map(|p| match p {
            Value::Object(mut obj) => obj.remove("text"),
            Value::String(s) => Some(Value::String(s)),
            _ => None,
        })
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl NodeExecutor for AgentNode {
    fn variables(&self) -> &Arc<VariableManager> {
        &self.vars
    }

    async fn execute(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: &JsonMap,
    ) -> Result<JsonMap, NodeError> {
        let config = self.parse_config(node)?;
        let api_key = config.resolve_api_key()?;
        let user_message = value_as_string(&input_value(node, input));

        let resp = self
            .client
            .post(config.completions_url())
            .bearer_auth(api_key)
            .json(&config.request_body(&user_message, false))
            .send()
            .await
            .map_err(|e| NodeError::ConnectionFailed(format!("chat request failed: {e}")))?;

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            error!("agent node {node_id} upstream error: {text}");
            return Err(NodeError::ExecutionFailed(format!(
                "model API returned error: {text}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("invalid model response: {e}")))?;

        let content = body
            .pointer("/choices/0/message/content")
            .cloned()
            .ok_or_else(|| {
                NodeError::ExecutionFailed("model response missing message content".to_string())
            })?;
        let content = match content {
            Value::String(s) => s,
            Value::Array(arr) => choice_array_to_string(arr),
            other => other.to_string(),
        };

        let mut output = JsonMap::new();
        output.insert(node.data.config.output_params.clone(), Value::String(content));
        Ok(output)
    }

    fn supports_sse(&self) -> bool {
        true
    }

    fn sse_execute(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: JsonMap,
    ) -> Result<SseStream, NodeError> {
        let config = self.parse_config(node)?;
        let api_key = config.resolve_api_key()?;
        let user_message = value_as_string(&input_value(node, &input));
        let body = config.request_body(&user_message, true);
        let url = config.completions_url();
        let client = self.client.clone();
        let node_id = node_id.to_string();

        let stream = stream! {
            let resp = match client.post(url).bearer_auth(api_key).json(&body).send().await {
                Ok(resp) => resp,
                Err(e) => {
                    error!("agent node {node_id} stream request failed: {e}");
                    yield format!("data: {}\n\n", json!({"result": false, "error": e.to_string()}));
                    yield "data: [DONE]\n\n".to_string();
                    return;
                }
            };
            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
                yield format!("data: {}\n\n", json!({"result": false, "error": text}));
                yield "data: [DONE]\n\n".to_string();
                return;
            }

            let mut done = false;
            let mut buffer = String::new();
            let mut bytes = resp.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield format!("data: {}\n\n", json!({"result": false, "error": e.to_string()}));
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                // forward complete upstream lines, re-framed one event per line
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if let Some(payload) = line.strip_prefix("data:") {
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            done = true;
                        }
                        yield format!("data: {payload}\n\n");
                    }
                }
                if done {
                    break;
                }
            }
            if !done {
                yield "data: [DONE]\n\n".to_string();
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exec(vars: Arc<VariableManager>) -> AgentNode {
        AgentNode::new(&NodeCtorArgs {
            variables: vars,
            start_node_id: None,
        })
    }

    fn node(config: Value) -> NodeSpec {
        serde_json::from_value(json!({"id": "llm", "type": "agents", "data": {"config": config}}))
            .unwrap()
    }

    #[test]
    fn agent_is_streaming_capable() {
        assert!(exec(Arc::new(VariableManager::new())).supports_sse());
    }

    #[test]
    fn config_defaults_and_url() {
        let exec = exec(Arc::new(VariableManager::new()));
        let config = exec.parse_config(&node(json!({}))).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(
            config.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn system_prompt_is_template_resolved() {
        let vars = Arc::new(VariableManager::new());
        vars.set("persona", json!("a terse ops bot"));
        let exec = exec(vars);
        let config = exec
            .parse_config(&node(json!({"systemPrompt": "You are {{persona}}."})))
            .unwrap();
        assert_eq!(config.system_prompt.as_deref(), Some("You are a terse ops bot."));
        let body = config.request_body("hi", false);
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["messages"][1]["content"], json!("hi"));
        assert_eq!(body["stream"], json!(false));
    }

    #[test]
    fn choice_array_to_string_pulls_text() {
        let parts = vec![json!({"text": "part one"}), json!({"text": "part two"})];
        assert_eq!(choice_array_to_string(parts), "part one\npart two");
    }
}
