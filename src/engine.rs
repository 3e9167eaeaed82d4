use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::flow::{FlowDefinition, NodeSpec};
use crate::node::{JsonMap, NodeExecutionContext, NodeExecutor, SseStream};
use crate::recorder::{ExecuteType, RunRecord, RunRecorder, RunStatus};
use crate::registry::{NodeCtorArgs, NodeFactory, NodeRegistry};
use crate::variables::VariableManager;

const SSE_DONE: &str = "data: [DONE]\n\n";

/// Tunables for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound on branches executing at once during fan-out.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_nodes: usize,
    /// Total wall-clock budget of a run when the caller passes no timeout.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: f64,
    /// Fixed cost deducted from the remaining budget for every hop taken,
    /// on top of the node's actual run time.
    #[serde(default = "default_per_hop_reserve")]
    pub per_hop_reserve_secs: f64,
}

fn default_max_parallel() -> usize {
    5
}

fn default_execution_timeout() -> f64 {
    300.0
}

fn default_per_hop_reserve() -> f64 {
    1.0
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel(),
            execution_timeout_secs: default_execution_timeout(),
            per_hop_reserve_secs: default_per_hop_reserve(),
        }
    }
}

impl EngineSettings {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.execution_timeout_secs)
    }

    pub fn per_hop_reserve(&self) -> Duration {
        Duration::from_secs_f64(self.per_hop_reserve_secs)
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("flow execution timed out")]
    Timeout,
    #[error("execution path had no runnable nodes")]
    EmptyPath,
}

/// Result tree of one execution path. Children of a fan-out hang off
/// `next`, keyed by node id.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub success: bool,
    pub node_id: String,
    pub node_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub next: HashMap<String, NodeOutcome>,
}

/// Failure snapshot returned instead of an `Err`: a run always reports
/// its diagnostic state, it never aborts with a bare error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub error: String,
    pub variables: JsonMap,
    pub execution_contexts: HashMap<String, NodeExecutionContext>,
    pub execution_time: f64,
}

#[derive(Debug, Clone)]
pub enum FlowOutcome {
    /// The run finished; the value is the final `last_message`.
    Success(Value),
    Failure(RunFailure),
}

impl FlowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Success(value) => Some(value),
            Self::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure),
        }
    }
}

/// Executes one flow run: validates the graph, walks it from the start
/// node and collects per-node diagnostics along the way.
///
/// An engine instance is single-use per run in spirit (variables and
/// contexts accumulate), matching how callers construct one per request.
pub struct ChatFlowEngine {
    flow: FlowDefinition,
    flow_id: String,
    registry: Arc<NodeRegistry>,
    recorder: Arc<dyn RunRecorder>,
    variables: Arc<VariableManager>,
    contexts: Arc<DashMap<String, NodeExecutionContext>>,
    custom: HashMap<String, NodeFactory>,
    start_node_id: Option<String>,
    settings: EngineSettings,
}

impl ChatFlowEngine {
    pub fn new(
        flow: FlowDefinition,
        registry: Arc<NodeRegistry>,
        recorder: Arc<dyn RunRecorder>,
    ) -> Self {
        Self {
            flow,
            flow_id: Uuid::new_v4().to_string(),
            registry,
            recorder,
            variables: Arc::new(VariableManager::new()),
            contexts: Arc::new(DashMap::new()),
            custom: HashMap::new(),
            start_node_id: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = flow_id.into();
        self
    }

    /// Override start-node resolution; without this the first declared node
    /// with no incoming edge is used.
    pub fn with_start_node(mut self, node_id: impl Into<String>) -> Self {
        self.start_node_id = Some(node_id.into());
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Engine-local executor override; shadows the registry for `kind`.
    pub fn register_node_executor(&mut self, kind: impl Into<String>, factory: NodeFactory) {
        self.custom.insert(kind.into(), factory);
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn variables(&self) -> &Arc<VariableManager> {
        &self.variables
    }

    pub fn node_contexts(&self) -> HashMap<String, NodeExecutionContext> {
        self.contexts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn is_kind_supported(&self, kind: &str) -> bool {
        self.custom.contains_key(kind) || self.registry.is_supported(kind)
    }

    fn executor_for(&self, kind: &str) -> Option<Arc<dyn NodeExecutor>> {
        let args = NodeCtorArgs {
            variables: self.variables.clone(),
            start_node_id: self.start_node_id.clone(),
        };
        if let Some(factory) = self.custom.get(kind) {
            return Some(factory(&args));
        }
        self.registry.create(kind, &args)
    }

    /// All validation errors of the flow: structure plus node-kind support.
    /// An empty result means the flow is executable.
    pub fn validate_flow(&self) -> Vec<String> {
        let mut errors = self.flow.structural_errors(self.start_node_id.is_some());
        for node in &self.flow.nodes {
            if !self.is_kind_supported(&node.kind) {
                errors.push(format!(
                    "node `{}` has unsupported type `{}`",
                    node.id, node.kind
                ));
            }
        }
        errors
    }

    fn resolve_start(&self) -> Result<String, String> {
        if let Some(id) = &self.start_node_id {
            return if self.flow.node(id).is_some() {
                Ok(id.clone())
            } else {
                Err(format!("start node `{id}` not found in flow"))
            };
        }
        self.flow
            .entry_nodes()
            .into_iter()
            .next()
            .ok_or_else(|| "flow has no entry node".to_string())
    }

    /// Only the reserved keys are seeded. The raw input map itself stays a
    /// per-node fallback during input resolution; its keys never become
    /// variables of their own.
    fn seed_variables(&self, input: &JsonMap) {
        self.variables.set("flow_id", Value::String(self.flow_id.clone()));
        let initial = input
            .get("last_message")
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
        self.variables.set("last_message", initial);
        self.variables
            .set("flow_input", Value::Object(input.clone()));
    }

    /// Run the flow to completion. Never returns `Err`: every failure mode
    /// is folded into [`FlowOutcome::Failure`] with the diagnostic state at
    /// the time of failure, and every run (failed validation included) is
    /// reported to the recorder.
    pub async fn execute(
        self: &Arc<Self>,
        input: JsonMap,
        timeout: Option<Duration>,
    ) -> FlowOutcome {
        let started = Instant::now();
        self.seed_variables(&input);

        let errors = self.validate_flow();
        let outcome = if !errors.is_empty() {
            self.failure_snapshot(
                format!("flow validation failed: {}", errors.join("; ")),
                started,
            )
        } else {
            match self.resolve_start() {
                Err(message) => self.failure_snapshot(message, started),
                Ok(start) => {
                    info!(flow_id = %self.flow_id, start = %start, "executing flow");
                    let budget = timeout.unwrap_or_else(|| self.settings.execution_timeout());
                    match self
                        .clone()
                        .walk(start, input.clone(), budget, HashSet::new())
                        .await
                    {
                        Err(err) => self.failure_snapshot(err.to_string(), started),
                        // node failures stay inside the outcome tree and the
                        // contexts; the run's result is whatever last_message
                        // holds when the traversal stops
                        Ok(_) => {
                            let last = self
                                .variables
                                .get("last_message")
                                .unwrap_or_else(|| Value::String(String::new()));
                            FlowOutcome::Success(last)
                        }
                    }
                }
            }
        };

        self.record_run(&input, &outcome).await;
        outcome
    }

    fn failure_snapshot(&self, error: impl Into<String>, started: Instant) -> FlowOutcome {
        let error = error.into();
        warn!(flow_id = %self.flow_id, "flow run failed: {error}");
        FlowOutcome::Failure(RunFailure {
            error,
            variables: self.variables.get_all(),
            execution_contexts: self.node_contexts(),
            execution_time: started.elapsed().as_secs_f64(),
        })
    }

    /// Walk one execution path. Single-successor chains are followed
    /// iteratively; only a fan-out recurses (boxed, one level per split).
    ///
    /// `carry` is the predecessor's output map, used as the input-resolution
    /// fallback for the next node. `budget` is the path's time allowance:
    /// each hop deducts the fixed per-hop reserve plus the node's actual
    /// run time, so a chain with more hops than the budget covers times out
    /// even when every node is instantaneous. A node failure ends this path
    /// but is not fatal to the run; an exhausted budget is.
    fn walk(
        self: Arc<Self>,
        start: String,
        carry: JsonMap,
        mut budget: Duration,
        mut visited: HashSet<String>,
    ) -> BoxFuture<'static, Result<NodeOutcome, EngineError>> {
        async move {
            let mut chain: Vec<NodeOutcome> = Vec::new();
            let mut carry = carry;
            let mut current = Some(start);

            while let Some(node_id) = current.take() {
                if budget.is_zero() {
                    return Err(EngineError::Timeout);
                }
                if visited.contains(&node_id) {
                    chain.push(self.skipped_outcome(&node_id));
                    break;
                }
                visited.insert(node_id.clone());

                let hop_started = Instant::now();
                let mut outcome = self.execute_single(&node_id, &carry).await;
                if !outcome.success {
                    chain.push(outcome);
                    break;
                }
                carry = outcome.data.clone().unwrap_or_default();
                budget = budget
                    .saturating_sub(self.settings.per_hop_reserve() + hop_started.elapsed());

                let mut successors = self.next_nodes(&node_id, &outcome);
                match successors.len() {
                    0 => chain.push(outcome),
                    1 => {
                        chain.push(outcome);
                        current = successors.pop();
                    }
                    _ => {
                        let children = self
                            .fan_out(successors, carry.clone(), budget, &visited)
                            .await?;
                        for child in children {
                            outcome.next.insert(child.node_id.clone(), child);
                        }
                        chain.push(outcome);
                    }
                }
            }

            let mut nodes = chain.into_iter().rev();
            let Some(mut tree) = nodes.next() else {
                return Err(EngineError::EmptyPath);
            };
            for mut parent in nodes {
                parent.next.insert(tree.node_id.clone(), tree);
                tree = parent;
            }
            Ok(tree)
        }
        .boxed()
    }

    /// Synthetic entry for a node re-entered on its own path: reported as a
    /// success in the tree, not re-executed.
    fn skipped_outcome(&self, node_id: &str) -> NodeOutcome {
        warn!("node `{node_id}` re-entered on the same path; not re-executing");
        NodeOutcome {
            success: true,
            node_id: node_id.to_string(),
            node_type: self
                .flow
                .node(node_id)
                .map(|n| n.kind.clone())
                .unwrap_or_default(),
            data: None,
            error: None,
            note: Some(format!("node `{node_id}` already ran on this path")),
            execution_time: 0.0,
            next: HashMap::new(),
        }
    }

    /// Run all fan-out branches concurrently, each with an equal share of
    /// the remaining budget and its own copy of the visited set. A branch
    /// that fails (timeout included) becomes a failure entry; only the
    /// outer guard elapsing is fatal for the run. Dropping the task set on
    /// that guard aborts the still-running branches.
    async fn fan_out(
        self: &Arc<Self>,
        targets: Vec<String>,
        carry: JsonMap,
        budget: Duration,
        visited: &HashSet<String>,
    ) -> Result<Vec<NodeOutcome>, EngineError> {
        if budget.is_zero() {
            return Err(EngineError::Timeout);
        }
        let per_branch = budget / targets.len() as u32;
        debug!(
            branches = targets.len(),
            budget_secs = per_branch.as_secs_f64(),
            "fanning out"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_nodes));
        let mut tasks = JoinSet::new();
        for target in targets {
            let engine = Arc::clone(self);
            let branch_carry = carry.clone();
            let branch_visited = visited.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return engine.failed_branch(&target, "branch pool closed"),
                };
                match Arc::clone(&engine)
                    .walk(target.clone(), branch_carry, per_branch, branch_visited)
                    .await
                {
                    Ok(tree) => tree,
                    Err(err) => engine.failed_branch(&target, err.to_string()),
                }
            });
        }

        let engine = Arc::clone(self);
        tokio::time::timeout(budget, async move {
            let mut outcomes = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                outcomes.push(match joined {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!("branch task failed to join: {err}");
                        engine.failed_branch("<branch>", format!("branch task failed: {err}"))
                    }
                });
            }
            outcomes
        })
        .await
        .map_err(|_| EngineError::Timeout)
    }

    fn failed_branch(&self, node_id: &str, error: impl Into<String>) -> NodeOutcome {
        NodeOutcome {
            success: false,
            node_id: node_id.to_string(),
            node_type: self
                .flow
                .node(node_id)
                .map(|n| n.kind.clone())
                .unwrap_or_default(),
            data: None,
            error: Some(error.into()),
            note: None,
            execution_time: 0.0,
            next: HashMap::new(),
        }
    }

    /// Execute one node with full context bookkeeping. Failures come back
    /// as a `success: false` outcome, never a panic or an early return.
    ///
    /// Input resolution: the declared input key is looked up in the
    /// variable namespace, then in `fallback` (the predecessor's output, or
    /// the raw run input for the first node), then defaults to `""`.
    async fn execute_single(&self, node_id: &str, fallback: &JsonMap) -> NodeOutcome {
        let Some(node) = self.flow.node(node_id).cloned() else {
            return self.failed_branch(node_id, format!("unknown node `{node_id}`"));
        };
        let kind = node.kind.clone();
        let Some(executor) = self.executor_for(&kind) else {
            return self.failed_branch(node_id, format!("unsupported node type `{kind}`"));
        };

        let input_key = node.data.config.input_params.clone();
        let input_value = self
            .variables
            .get(&input_key)
            .or_else(|| fallback.get(&input_key).cloned())
            .unwrap_or_else(|| Value::String(String::new()));
        let mut input = JsonMap::new();
        input.insert(input_key, input_value);

        let mut context = NodeExecutionContext::new(node_id, &self.flow_id);
        context.mark_running(input.clone());
        self.contexts.insert(node_id.to_string(), context.clone());

        let started = Instant::now();
        debug!("executing node `{node_id}` ({kind})");
        match executor.execute(node_id, &node, &input).await {
            Ok(output) => {
                context.mark_completed(output.clone());
                self.contexts.insert(node_id.to_string(), context);
                self.publish_output(&node, &output);
                NodeOutcome {
                    success: true,
                    node_id: node_id.to_string(),
                    node_type: kind,
                    data: Some(output),
                    error: None,
                    note: None,
                    execution_time: started.elapsed().as_secs_f64(),
                    next: HashMap::new(),
                }
            }
            Err(err) => {
                warn!("node `{node_id}` failed: {err}");
                context.mark_failed(err.to_string());
                self.contexts.insert(node_id.to_string(), context);
                NodeOutcome {
                    success: false,
                    node_id: node_id.to_string(),
                    node_type: kind,
                    data: None,
                    error: Some(err.to_string()),
                    note: None,
                    execution_time: started.elapsed().as_secs_f64(),
                    next: HashMap::new(),
                }
            }
        }
    }

    /// Publish a node's output value under its declared output key. The one
    /// exception: a branch kind never advances `last_message`, so the
    /// original message flows past the split to whichever side runs next.
    /// A non-default output key only ever writes that key.
    fn publish_output(&self, node: &NodeSpec, output: &JsonMap) {
        self.variables.set(
            format!("node_{}_result", node.id),
            Value::Object(output.clone()),
        );
        let out_key = &node.data.config.output_params;
        let Some(value) = output.get(out_key) else {
            return;
        };
        if out_key == "last_message" && matches!(node.kind.as_str(), "condition" | "branch") {
            return;
        }
        self.variables.set(out_key.clone(), value.clone());
    }

    /// Successor targets of a node, honoring branch handles: an edge with a
    /// `true`/`false` handle is followed only when the node produced a
    /// matching `condition_result`.
    fn next_nodes(&self, node_id: &str, outcome: &NodeOutcome) -> Vec<String> {
        let condition = outcome
            .data
            .as_ref()
            .and_then(|d| d.get("condition_result"))
            .and_then(Value::as_bool);
        self.flow
            .edges_from(node_id)
            .filter(|edge| match edge.branch_handle() {
                None => true,
                Some(handle) => match condition {
                    Some(actual) => handle == actual,
                    None => {
                        warn!(
                            "edge {node_id} -> {} has a branch handle but the node \
                             produced no condition_result; not following it",
                            edge.target
                        );
                        false
                    }
                },
            })
            .map(|edge| edge.target.clone())
            .collect()
    }

    async fn record_run(&self, input: &JsonMap, outcome: &FlowOutcome) {
        let status = if outcome.is_success() {
            RunStatus::Success
        } else {
            RunStatus::Fail
        };
        let output_data = self
            .contexts
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    Value::Object(entry.value().output_data.clone().unwrap_or_default()),
                )
            })
            .collect();
        let last_output = match self.variables.get("last_message") {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let execute_type = self
            .resolve_start()
            .ok()
            .and_then(|id| self.flow.node(&id).map(|n| ExecuteType::from_kind(&n.kind)))
            .unwrap_or(ExecuteType::OpenAi);

        let record = RunRecord {
            flow_id: self.flow_id.clone(),
            status,
            input_data: input.clone(),
            output_data,
            last_output,
            execute_type,
            recorded_at: Utc::now(),
        };
        if let Err(err) = self.recorder.record(&record).await {
            warn!(flow_id = %self.flow_id, "failed to record run: {err}");
        }
    }

    /// Streaming execution: every node before the last runs sequentially,
    /// then the last node's event stream is forwarded as-is. Requires the
    /// last declared node to be streaming-capable. The stream is lazy and
    /// always ends with a `[DONE]` event.
    pub fn sse_execute(
        self: &Arc<Self>,
        input: JsonMap,
        timeout: Option<Duration>,
    ) -> SseStream {
        let engine = Arc::clone(self);
        let stream = stream! {
            let deadline =
                Instant::now() + timeout.unwrap_or_else(|| engine.settings.execution_timeout());
            engine.seed_variables(&input);

            let errors = engine.validate_flow();
            if !errors.is_empty() {
                yield sse_error(format!("flow validation failed: {}", errors.join("; ")));
                yield SSE_DONE.to_string();
                return;
            }
            let Some(last) = engine.flow.last_node().cloned() else {
                yield sse_error("flow has no nodes");
                yield SSE_DONE.to_string();
                return;
            };
            let Some(last_executor) = engine.executor_for(&last.kind) else {
                yield sse_error(format!("unsupported node type `{}`", last.kind));
                yield SSE_DONE.to_string();
                return;
            };
            if !last_executor.supports_sse() {
                yield sse_error(format!(
                    "node kind `{}` does not support streaming execution",
                    last.kind
                ));
                yield SSE_DONE.to_string();
                return;
            }

            let mut rolling = input.clone();
            for node in engine.flow.nodes.iter().filter(|n| n.id != last.id) {
                let Some(executor) = engine.executor_for(&node.kind) else {
                    yield sse_error(format!("unsupported node type `{}`", node.kind));
                    yield SSE_DONE.to_string();
                    return;
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    yield sse_error("flow execution timed out");
                    yield SSE_DONE.to_string();
                    return;
                }
                match tokio::time::timeout(remaining, executor.execute(&node.id, node, &rolling))
                    .await
                {
                    Err(_) => {
                        yield sse_error("flow execution timed out");
                        yield SSE_DONE.to_string();
                        return;
                    }
                    Ok(Err(err)) => {
                        yield sse_error(format!("node `{}` failed: {err}", node.id));
                        yield SSE_DONE.to_string();
                        return;
                    }
                    Ok(Ok(output)) => {
                        engine.variables.set(
                            format!("node_{}_output", node.id),
                            Value::Object(output.clone()),
                        );
                        for (key, value) in output {
                            rolling.insert(key, value);
                        }
                    }
                }
            }

            match last_executor.sse_execute(&last.id, &last, rolling) {
                Ok(mut events) => {
                    // the node's stream carries its own [DONE] terminator
                    while let Some(event) = events.next().await {
                        yield event;
                    }
                }
                Err(err) => {
                    yield sse_error(format!("node `{}` failed: {err}", last.id));
                    yield SSE_DONE.to_string();
                }
            }
        };
        stream.boxed()
    }

    /// Diagnostic snapshot of the engine after (or during) a run.
    pub fn execution_summary(&self) -> Value {
        json!({
            "flow_id": self.flow_id,
            "total_nodes": self.flow.nodes.len(),
            "total_edges": self.flow.edges.len(),
            "entry_nodes": self.flow.entry_nodes(),
            "execution_contexts": self.node_contexts(),
            "variables": self.variables.get_all(),
        })
    }
}

fn sse_error(message: impl Into<String>) -> String {
    format!(
        "data: {}\n\n",
        json!({"result": false, "error": message.into()})
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::NullRecorder;
    use serde_json::json;

    fn engine_for(flow: Value) -> Arc<ChatFlowEngine> {
        let flow = FlowDefinition::from_value(flow).unwrap();
        Arc::new(ChatFlowEngine::new(
            flow,
            Arc::new(NodeRegistry::with_builtins()),
            Arc::new(NullRecorder),
        ))
    }

    #[test]
    fn settings_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.max_parallel_nodes, 5);
        assert_eq!(settings.execution_timeout(), Duration::from_secs(300));
        assert_eq!(settings.per_hop_reserve(), Duration::from_secs(1));
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: EngineSettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(settings.max_parallel_nodes, 5);
        let settings: EngineSettings =
            serde_json::from_value(json!({"max_parallel_nodes": 2})).unwrap();
        assert_eq!(settings.max_parallel_nodes, 2);
    }

    #[test]
    fn validation_reports_unsupported_kind() {
        let engine = engine_for(json!({
            "nodes": [
                {"id": "a", "type": "start", "data": {"config": {}}},
                {"id": "b", "type": "quantum", "data": {"config": {}}}
            ],
            "edges": [{"source": "a", "target": "b"}]
        }));
        let errors = engine.validate_flow();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("`b`"));
        assert!(errors[0].contains("`quantum`"));
    }

    #[test]
    fn explicit_start_must_exist() {
        let flow = FlowDefinition::from_value(json!({
            "nodes": [{"id": "a", "type": "start", "data": {"config": {}}}],
            "edges": []
        }))
        .unwrap();
        let engine = ChatFlowEngine::new(
            flow,
            Arc::new(NodeRegistry::with_builtins()),
            Arc::new(NullRecorder),
        )
        .with_start_node("ghost");
        assert!(engine.resolve_start().is_err());
    }

    #[test]
    fn start_defaults_to_first_entry_node() {
        let engine = engine_for(json!({
            "nodes": [
                {"id": "a", "type": "start", "data": {"config": {}}},
                {"id": "b", "type": "end", "data": {"config": {}}}
            ],
            "edges": [{"source": "a", "target": "b"}]
        }));
        assert_eq!(engine.resolve_start().unwrap(), "a");
    }

    #[test]
    fn branch_output_does_not_advance_last_message() {
        let engine = engine_for(json!({"nodes": [], "edges": []}));
        engine.variables.set("last_message", json!("original"));
        let node: NodeSpec = serde_json::from_value(
            json!({"id": "gate", "type": "branch", "data": {"config": {}}}),
        )
        .unwrap();
        let mut output = JsonMap::new();
        output.insert("last_message".into(), json!("should not land"));
        output.insert("condition_result".into(), json!(true));
        engine.publish_output(&node, &output);
        assert_eq!(engine.variables.get("last_message"), Some(json!("original")));
        assert!(engine.variables.has("node_gate_result"));
    }

    #[test]
    fn branch_with_custom_output_key_still_publishes_it() {
        let engine = engine_for(json!({"nodes": [], "edges": []}));
        engine.variables.set("last_message", json!("original"));
        let node: NodeSpec = serde_json::from_value(json!({
            "id": "gate", "type": "branch",
            "data": {"config": {"outputParams": "gate_echo"}}
        }))
        .unwrap();
        let mut output = JsonMap::new();
        output.insert("gate_echo".into(), json!("echoed"));
        output.insert("condition_result".into(), json!(false));
        engine.publish_output(&node, &output);
        assert_eq!(engine.variables.get("gate_echo"), Some(json!("echoed")));
        assert_eq!(engine.variables.get("last_message"), Some(json!("original")));
    }

    #[test]
    fn side_channel_output_never_touches_last_message() {
        let engine = engine_for(json!({"nodes": [], "edges": []}));
        engine.variables.set("last_message", json!("original"));
        let node: NodeSpec = serde_json::from_value(json!({
            "id": "side", "type": "function",
            "data": {"config": {"outputParams": "side_out"}}
        }))
        .unwrap();
        let mut output = JsonMap::new();
        output.insert("side_out".into(), json!("SIDE"));
        engine.publish_output(&node, &output);
        assert_eq!(engine.variables.get("side_out"), Some(json!("SIDE")));
        assert_eq!(engine.variables.get("last_message"), Some(json!("original")));
    }

    #[tokio::test]
    async fn revisited_node_becomes_a_synthetic_success_entry() {
        let engine = engine_for(json!({
            "nodes": [
                {"id": "a", "type": "start", "data": {"config": {}}},
                {"id": "b", "type": "end", "data": {"config": {}}}
            ],
            "edges": [{"source": "a", "target": "b"}]
        }));
        engine.seed_variables(&JsonMap::new());
        let mut visited = HashSet::new();
        visited.insert("b".to_string());
        let tree = engine
            .clone()
            .walk(
                "a".to_string(),
                JsonMap::new(),
                Duration::from_secs(30),
                visited,
            )
            .await
            .unwrap();
        assert_eq!(tree.node_id, "a");
        let skipped = &tree.next["b"];
        assert!(skipped.success);
        assert!(skipped.note.as_deref().is_some_and(|n| n.contains("already ran")));
        assert!(skipped.data.is_none(), "skipped node must not re-execute");
    }
}
