use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::node::NodeExecutor;
use crate::nodes::agent::AgentNode;
use crate::nodes::basic::{EntryNode, ExitNode};
use crate::nodes::branch::BranchNode;
use crate::nodes::function::FunctionNode;
use crate::nodes::http::HttpActionNode;
use crate::nodes::notify::NotifyNode;
use crate::variables::VariableManager;

/// Constructor arguments handed to every executor factory.
///
/// Branch executors use `start_node_id` because condition evaluation can
/// depend on how the run was entered; other kinds ignore it.
#[derive(Clone)]
pub struct NodeCtorArgs {
    pub variables: Arc<VariableManager>,
    pub start_node_id: Option<String>,
}

pub type NodeFactory = Arc<dyn Fn(&NodeCtorArgs) -> Arc<dyn NodeExecutor> + Send + Sync>;

/// Introspection record for one registered node kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub kind: String,
    /// `builtin`, `registered` or `module:<path>` for catalog-loaded kinds.
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

struct RegisteredNode {
    factory: NodeFactory,
    info: NodeInfo,
}

/// Maps a node-kind tag to an executor factory.
///
/// Construct one instance at startup and pass it to each engine explicitly;
/// there is no process-global registry.
#[derive(Default)]
pub struct NodeRegistry {
    entries: HashMap<String, RegisteredNode>,
}

impl NodeRegistry {
    /// Empty registry, no built-ins. Mostly useful for tests and embedders
    /// that want full control over the kind table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with every built-in node kind, including the
    /// back-compat aliases (`start`/`end`/`condition`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        let entry: NodeFactory = Arc::new(|args| Arc::new(EntryNode::new(args)));
        for kind in ["restful", "openai", "celery", "start"] {
            registry.register_builtin(kind, entry.clone(), "flow entry passthrough");
        }

        let exit: NodeFactory = Arc::new(|args| Arc::new(ExitNode::new(args)));
        for kind in ["exit", "end"] {
            registry.register_builtin(kind, exit.clone(), "flow exit passthrough");
        }

        let branch: NodeFactory = Arc::new(|args| Arc::new(BranchNode::new(args)));
        for kind in ["branch", "condition"] {
            registry.register_builtin(kind, branch.clone(), "conditional branch");
        }

        registry.register_builtin(
            "function",
            Arc::new(|args| Arc::new(FunctionNode::new(args))),
            "built-in string transform",
        );
        registry.register_builtin(
            "http",
            Arc::new(|args| Arc::new(HttpActionNode::new(args))),
            "HTTP action",
        );
        registry.register_builtin(
            "notification",
            Arc::new(|args| Arc::new(NotifyNode::new(args))),
            "webhook notification",
        );
        registry.register_builtin(
            "agents",
            Arc::new(|args| Arc::new(AgentNode::new(args))),
            "LLM agent call (streaming-capable)",
        );

        info!("registered {} built-in node kinds", registry.entries.len());
        registry
    }

    fn register_builtin(&mut self, kind: &str, factory: NodeFactory, description: &str) {
        self.entries.insert(
            kind.to_string(),
            RegisteredNode {
                factory,
                info: NodeInfo {
                    kind: kind.to_string(),
                    origin: "builtin".to_string(),
                    description: Some(description.to_string()),
                },
            },
        );
    }

    /// Register (or replace) an executor factory for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, factory: NodeFactory) {
        let kind = kind.into();
        info!("registering node kind `{kind}`");
        self.entries.insert(
            kind.clone(),
            RegisteredNode {
                factory,
                info: NodeInfo {
                    kind,
                    origin: "registered".to_string(),
                    description: None,
                },
            },
        );
    }

    /// Remove a kind; returns whether anything was removed.
    pub fn unregister(&mut self, kind: &str) -> bool {
        let removed = self.entries.remove(kind).is_some();
        if removed {
            info!("unregistered node kind `{kind}`");
        } else {
            warn!("tried to unregister unknown node kind `{kind}`");
        }
        removed
    }

    pub fn is_supported(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn supported_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.entries.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn node_info(&self, kind: &str) -> Option<NodeInfo> {
        self.entries.get(kind).map(|e| e.info.clone())
    }

    pub fn list_all_nodes(&self) -> Vec<NodeInfo> {
        let mut infos: Vec<NodeInfo> = self.entries.values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.kind.cmp(&b.kind));
        infos
    }

    /// Construct an executor for `kind`, or `None` when unsupported.
    pub fn create(&self, kind: &str, args: &NodeCtorArgs) -> Option<Arc<dyn NodeExecutor>> {
        self.entries.get(kind).map(|e| (e.factory)(args))
    }

    /// Resolve a factory from the process-wide module catalog and register
    /// it under `kind`. This is the explicit replacement for reflective
    /// module loading: the "module" must have announced its executors via
    /// [`register_module_node`] first.
    pub fn load_node_from_module(
        &mut self,
        kind: &str,
        module_path: &str,
        type_name: &str,
    ) -> Result<(), RegistryError> {
        let factory = lookup_module_node(module_path, type_name).ok_or_else(|| {
            RegistryError::UnknownModuleNode {
                module: module_path.to_string(),
                name: type_name.to_string(),
            }
        })?;
        self.entries.insert(
            kind.to_string(),
            RegisteredNode {
                factory,
                info: NodeInfo {
                    kind: kind.to_string(),
                    origin: format!("module:{module_path}::{type_name}"),
                    description: None,
                },
            },
        );
        info!("loaded node kind `{kind}` from module `{module_path}::{type_name}`");
        Ok(())
    }

    /// Batch form of [`load_node_from_module`]. Failures are logged per
    /// kind and returned; successfully resolved kinds are still registered.
    pub fn load_nodes_from_config(
        &mut self,
        config: &HashMap<String, ModuleNodeRef>,
    ) -> Vec<RegistryError> {
        let mut errors = Vec::new();
        for (kind, reference) in config {
            if let Err(err) = self.load_node_from_module(kind, &reference.module, &reference.name) {
                warn!("failed to load node kind `{kind}`: {err}");
                errors.push(err);
            }
        }
        errors
    }
}

/// One entry of a batch module-loading config:
/// `{"node_type": {"module": "path", "class": "TypeName"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleNodeRef {
    pub module: String,
    #[serde(alias = "class")]
    pub name: String,
}

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("no executor `{name}` announced by module `{module}`")]
    UnknownModuleNode { module: String, name: String },
}

static MODULE_CATALOG: Lazy<RwLock<HashMap<(String, String), NodeFactory>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Announce an executor factory under a module path + type name so that
/// `load_node_from_module` / `load_nodes_from_config` can find it.
pub fn register_module_node(module_path: &str, type_name: &str, factory: NodeFactory) {
    MODULE_CATALOG
        .write()
        .expect("module catalog poisoned")
        .insert((module_path.to_string(), type_name.to_string()), factory);
}

fn lookup_module_node(module_path: &str, type_name: &str) -> Option<NodeFactory> {
    MODULE_CATALOG
        .read()
        .expect("module catalog poisoned")
        .get(&(module_path.to_string(), type_name.to_string()))
        .cloned()
}
