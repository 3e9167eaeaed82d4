use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::flow::NodeSpec;
use crate::node::{JsonMap, NodeError, NodeExecutor};
use crate::nodes::input_value;
use crate::registry::NodeCtorArgs;
use crate::variables::VariableManager;

/// Conditional branch node.
///
/// Evaluates a group of operand comparisons over template-resolved strings
/// and emits the verdict as `condition_result` so the engine can pick the
/// matching `"true"`/`"false"` edges. The branch forwards its input under
/// the output key, but the engine never lets a branch overwrite
/// `last_message`.
pub struct BranchNode {
    vars: Arc<VariableManager>,
    start_node_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchConfig {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: Logic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Left operand template; defaults to the pipeline payload.
    #[serde(default = "default_left")]
    pub left: String,
    pub operator: Operator,
    /// Right operand template.
    #[serde(default)]
    pub right: String,
}

fn default_left() -> String {
    "{{last_message}}".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Gt,
    Lt,
    IsEmpty,
    NotEmpty,
}

impl Operator {
    fn apply(self, left: &str, right: &str) -> bool {
        match self {
            Operator::Equals => left == right,
            Operator::NotEquals => left != right,
            Operator::Contains => left.contains(right),
            Operator::NotContains => !left.contains(right),
            Operator::StartsWith => left.starts_with(right),
            Operator::EndsWith => left.ends_with(right),
            // numeric when both sides parse, lexicographic otherwise
            Operator::Gt => match (left.parse::<f64>(), right.parse::<f64>()) {
                (Ok(l), Ok(r)) => l > r,
                _ => left > right,
            },
            Operator::Lt => match (left.parse::<f64>(), right.parse::<f64>()) {
                (Ok(l), Ok(r)) => l < r,
                _ => left < right,
            },
            Operator::IsEmpty => left.trim().is_empty(),
            Operator::NotEmpty => !left.trim().is_empty(),
        }
    }
}

impl BranchNode {
    pub fn new(args: &NodeCtorArgs) -> Self {
        Self {
            vars: args.variables.clone(),
            start_node_id: args.start_node_id.clone(),
        }
    }

    fn evaluate(&self, config: &BranchConfig) -> bool {
        // empty condition groups evaluate to true so a bare branch behaves
        // like a plain passthrough with an always-true verdict
        if config.conditions.is_empty() {
            return true;
        }
        let mut verdicts = config.conditions.iter().map(|c| {
            let left = self.vars.resolve_template(&c.left);
            let right = self.vars.resolve_template(&c.right);
            let hit = c.operator.apply(&left, &right);
            debug!("branch condition `{left}` {:?} `{right}` -> {hit}", c.operator);
            hit
        });
        match config.logic {
            Logic::And => verdicts.all(|v| v),
            Logic::Or => verdicts.any(|v| v),
        }
    }
}

#[async_trait]
impl NodeExecutor for BranchNode {
    fn variables(&self) -> &Arc<VariableManager> {
        &self.vars
    }

    async fn execute(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: &JsonMap,
    ) -> Result<JsonMap, NodeError> {
        // the entry kind is visible to operand templates as `start_node`
        if let Some(start) = &self.start_node_id {
            if !self.vars.has("start_node") {
                self.vars.set("start_node", Value::String(start.clone()));
            }
        }

        let config: BranchConfig =
            serde_json::from_value(Value::Object(node.data.config.extra.clone()))
                .map_err(|e| NodeError::InvalidInput(format!("branch config: {e}")))?;

        let result = self.evaluate(&config);
        debug!("branch {node_id} evaluated to {result}");

        let mut output = JsonMap::new();
        output.insert(node.data.config.output_params.clone(), input_value(node, input));
        output.insert("condition_result".to_string(), Value::Bool(result));
        Ok(output)
    }

    fn validate_params(&self, node: &NodeSpec) -> Vec<String> {
        match serde_json::from_value::<BranchConfig>(Value::Object(node.data.config.extra.clone()))
        {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("node {}: invalid branch config: {e}", node.id)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branch(vars: Arc<VariableManager>, start: Option<&str>) -> BranchNode {
        BranchNode::new(&NodeCtorArgs {
            variables: vars,
            start_node_id: start.map(str::to_string),
        })
    }

    fn node(config: Value) -> NodeSpec {
        serde_json::from_value(json!({
            "id": "cond", "type": "condition", "data": {"config": config}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn equals_condition_on_last_message() {
        let vars = Arc::new(VariableManager::new());
        vars.set("last_message", json!("yes"));
        let exec = branch(vars, None);
        let spec = node(json!({
            "conditions": [{"operator": "equals", "right": "yes"}]
        }));
        let out = exec.execute("cond", &spec, &JsonMap::new()).await.unwrap();
        assert_eq!(out.get("condition_result"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn and_logic_requires_all_conditions() {
        let vars = Arc::new(VariableManager::new());
        vars.set("last_message", json!("hello ops"));
        let exec = branch(vars, None);
        let spec = node(json!({
            "logic": "and",
            "conditions": [
                {"operator": "contains", "right": "hello"},
                {"operator": "contains", "right": "nope"}
            ]
        }));
        let out = exec.execute("cond", &spec, &JsonMap::new()).await.unwrap();
        assert_eq!(out.get("condition_result"), Some(&json!(false)));
    }

    #[tokio::test]
    async fn or_logic_needs_one_hit() {
        let vars = Arc::new(VariableManager::new());
        vars.set("last_message", json!("hello ops"));
        let exec = branch(vars, None);
        let spec = node(json!({
            "logic": "or",
            "conditions": [
                {"operator": "contains", "right": "hello"},
                {"operator": "contains", "right": "nope"}
            ]
        }));
        let out = exec.execute("cond", &spec, &JsonMap::new()).await.unwrap();
        assert_eq!(out.get("condition_result"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn numeric_comparison_when_both_sides_parse() {
        let vars = Arc::new(VariableManager::new());
        vars.set("score", json!("10"));
        let exec = branch(vars, None);
        let spec = node(json!({
            "conditions": [{"left": "{{score}}", "operator": "gt", "right": "9"}]
        }));
        let out = exec.execute("cond", &spec, &JsonMap::new()).await.unwrap();
        // "10" > "9" would be false lexicographically; numeric wins
        assert_eq!(out.get("condition_result"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn start_node_is_visible_to_operands() {
        let vars = Arc::new(VariableManager::new());
        let exec = branch(vars, Some("entry_restful"));
        let spec = node(json!({
            "conditions": [
                {"left": "{{start_node}}", "operator": "equals", "right": "entry_restful"}
            ]
        }));
        let out = exec.execute("cond", &spec, &JsonMap::new()).await.unwrap();
        assert_eq!(out.get("condition_result"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn empty_condition_group_is_true() {
        let vars = Arc::new(VariableManager::new());
        let exec = branch(vars, None);
        let out = exec
            .execute("cond", &node(json!({})), &JsonMap::new())
            .await
            .unwrap();
        assert_eq!(out.get("condition_result"), Some(&json!(true)));
    }

    #[test]
    fn validate_params_rejects_bad_operator() {
        let vars = Arc::new(VariableManager::new());
        let exec = branch(vars, None);
        let spec = node(json!({
            "conditions": [{"operator": "resembles", "right": "x"}]
        }));
        assert_eq!(exec.validate_params(&spec).len(), 1);
    }
}
