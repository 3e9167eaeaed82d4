//! DAG-based chat-flow execution.
//!
//! A flow is a JSON document of typed nodes and directed edges. The
//! [`engine::ChatFlowEngine`] validates the graph, walks it from the start
//! node with a shared [`variables::VariableManager`] namespace, fans out
//! concurrently where a node has several successors and reports each run
//! to a [`recorder::RunRecorder`]. Node behavior is pluggable through
//! [`registry::NodeRegistry`]; the built-in kinds live under [`nodes`].

pub mod engine;
pub mod flow;
pub mod logger;
pub mod node;
pub mod nodes;
pub mod recorder;
pub mod registry;
pub mod variables;

pub use engine::{ChatFlowEngine, EngineSettings, FlowOutcome, NodeOutcome, RunFailure};
pub use flow::{EdgeSpec, FlowDefinition, NodeSpec};
pub use node::{JsonMap, NodeError, NodeExecutionContext, NodeExecutor, NodeStatus, SseStream};
pub use recorder::{ExecuteType, MemoryRecorder, NullRecorder, RunRecord, RunRecorder, RunStatus};
pub use registry::{NodeCtorArgs, NodeFactory, NodeInfo, NodeRegistry};
pub use variables::VariableManager;
