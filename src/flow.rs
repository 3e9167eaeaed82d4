use std::collections::HashMap;

use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A declarative chat flow: typed nodes plus directed edges between them.
///
/// This is the wire shape produced by the flow editor:
/// `{"nodes":[{"id","type","data":{"config":{...}}}],
///   "edges":[{"source","target","sourceHandle"?}]}`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FlowDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// One typed unit of work in the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeSpec {
    pub id: String,
    /// Node kind tag, resolved against the registry at execution time.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: NodeData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NodeData {
    #[serde(default)]
    pub config: NodeConfig,
}

/// Per-node configuration: the input/output variable bindings plus whatever
/// kind-specific keys the node's executor understands.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeConfig {
    /// Variable name this node reads its input from.
    #[serde(rename = "inputParams", default = "default_param")]
    pub input_params: String,
    /// Variable name this node writes its output to.
    #[serde(rename = "outputParams", default = "default_param")]
    pub output_params: String,
    /// Kind-specific configuration, template-resolved by the executor.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_param() -> String {
    "last_message".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            input_params: default_param(),
            output_params: default_param(),
            extra: Map::new(),
        }
    }
}

/// A directed connection between two nodes, optionally guarded by a branch
/// handle (`"true"` / `"false"`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(
        rename = "sourceHandle",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,
}

impl EdgeSpec {
    /// `"true"`/`"false"` handles mark branch-conditional edges; anything
    /// else (including no handle) is followed unconditionally.
    pub fn branch_handle(&self) -> Option<bool> {
        match self.source_handle.as_deref().map(str::to_lowercase).as_deref() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }
}

impl FlowDefinition {
    pub fn from_value(value: Value) -> Result<Self, FlowError> {
        serde_json::from_value(value).map_err(|e| FlowError::Serialization(e.to_string()))
    }

    pub fn from_str(json: &str) -> Result<Self, FlowError> {
        serde_json::from_str(json).map_err(|e| FlowError::Serialization(e.to_string()))
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    /// The last declared node; the single-stream execution mode requires it
    /// to be streaming-capable.
    pub fn last_node(&self) -> Option<&NodeSpec> {
        self.nodes.last()
    }

    /// Entry nodes are nodes with no incoming edge, in declaration order.
    pub fn entry_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !self.edges.iter().any(|e| e.target == n.id))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Outgoing edges of `node_id`.
    pub fn edges_from<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// Build the dependency graph (edge target depends on source). Edges
    /// that reference undeclared nodes are skipped here; validation reports
    /// them separately.
    pub fn build_graph(&self) -> StableDiGraph<String, ()> {
        let mut graph = StableDiGraph::new();
        let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
        for node in &self.nodes {
            let idx = graph.add_node(node.id.clone());
            index_of.insert(node.id.as_str(), idx);
        }
        for edge in &self.edges {
            if let (Some(&from), Some(&to)) = (
                index_of.get(edge.source.as_str()),
                index_of.get(edge.target.as_str()),
            ) {
                graph.add_edge(from, to, ());
            }
        }
        graph
    }

    pub fn has_cycle(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.build_graph())
    }

    /// Structural validation errors. Node-kind support is checked by the
    /// engine, which knows the registry and its custom executors.
    pub fn structural_errors(&self, has_explicit_start: bool) -> Vec<String> {
        let mut errors = Vec::new();
        if self.nodes.is_empty() {
            errors.push("flow has no nodes".to_string());
            return errors;
        }
        if self.entry_nodes().is_empty() && !has_explicit_start {
            errors.push("flow has no entry node".to_string());
        }
        if self.has_cycle() {
            errors.push("flow contains a cyclic dependency".to_string());
        }
        for edge in &self.edges {
            if self.node(&edge.source).is_none() {
                errors.push(format!("edge references unknown source node: {}", edge.source));
            }
            if self.node(&edge.target).is_none() {
                errors.push(format!("edge references unknown target node: {}", edge.target));
            }
        }
        errors
    }
}

#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error("flow definition error: {0}")]
    Serialization(String),
}
