use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flow::NodeSpec;
use crate::node::{JsonMap, NodeError, NodeExecutor};
use crate::nodes::{input_value, value_as_string};
use crate::registry::NodeCtorArgs;
use crate::variables::VariableManager;

/// Function node: applies a named built-in transform to the input string.
pub struct FunctionNode {
    vars: Arc<VariableManager>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FunctionConfig {
    function: FunctionName,
    /// Only used by the `template` function.
    #[serde(default)]
    template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FunctionName {
    Upper,
    Lower,
    Trim,
    Reverse,
    Length,
    Capitalize,
    Template,
}

impl FunctionNode {
    pub fn new(args: &NodeCtorArgs) -> Self {
        Self {
            vars: args.variables.clone(),
        }
    }

    fn parse_config(node: &NodeSpec) -> Result<FunctionConfig, NodeError> {
        serde_json::from_value(Value::Object(node.data.config.extra.clone()))
            .map_err(|e| NodeError::InvalidInput(format!("function config: {e}")))
    }

    fn apply(&self, config: &FunctionConfig, input: &str) -> Result<Value, NodeError> {
        let out = match config.function {
            FunctionName::Upper => Value::String(input.to_uppercase()),
            FunctionName::Lower => Value::String(input.to_lowercase()),
            FunctionName::Trim => Value::String(input.trim().to_string()),
            FunctionName::Reverse => Value::String(input.chars().rev().collect()),
            FunctionName::Length => Value::from(input.chars().count()),
            FunctionName::Capitalize => {
                let mut chars = input.chars();
                Value::String(match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                })
            }
            FunctionName::Template => {
                let template = config.template.as_deref().ok_or_else(|| {
                    NodeError::InvalidInput("template function needs a `template`".to_string())
                })?;
                Value::String(self.vars.resolve_template(template))
            }
        };
        Ok(out)
    }
}

#[async_trait]
impl NodeExecutor for FunctionNode {
    fn variables(&self) -> &Arc<VariableManager> {
        &self.vars
    }

    async fn execute(
        &self,
        _node_id: &str,
        node: &NodeSpec,
        input: &JsonMap,
    ) -> Result<JsonMap, NodeError> {
        let config = Self::parse_config(node)?;
        let text = value_as_string(&input_value(node, input));
        let result = self.apply(&config, &text)?;
        let mut output = JsonMap::new();
        output.insert(node.data.config.output_params.clone(), result);
        Ok(output)
    }

    fn validate_params(&self, node: &NodeSpec) -> Vec<String> {
        match Self::parse_config(node) {
            Ok(config) if config.function == FunctionName::Template && config.template.is_none() => {
                vec![format!("node {}: template function needs a `template`", node.id)]
            }
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("node {}: {e}", node.id)],
        }
    }
}
