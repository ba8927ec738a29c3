use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use plexus_core::config::{CacheScope, ExecutorConfig};
use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::ToolTransport;
use plexus_core::types::{
    AgentContext, NodeKind, Payload, Plan, PlanNode, Status, UpstreamOutput, ARTIFACT_URI_PREFIX,
};
use plexus_store::{content_hash, ArtifactFormat, ArtifactStore, ArtifactUri, Ledger, NodeUpdate};

use crate::agents::AgentRegistry;
use crate::graph::PlanGraph;
use crate::idempotency::{cache_key, idempotency_key};

/// A completed node's output, held for downstream nodes of the same run.
struct NodeOutput {
    artifact: String,
    payload: Payload,
    hash: String,
}

/// What `produce` hands back: the stored artifact, its payload, and the key
/// it may later be reused under.
struct Produced {
    artifact: String,
    payload: Payload,
    cache_key: String,
}

/// Walks a plan in dependency order, one node at a time, recording every
/// transition in the ledger and every output in the artifact store.
///
/// The executor holds no per-run state between calls, so one instance can
/// drive many runs concurrently.
pub struct DagExecutor {
    ledger: Arc<Ledger>,
    artifacts: Arc<ArtifactStore>,
    transport: Arc<dyn ToolTransport>,
    agents: Arc<AgentRegistry>,
    node_timeout: Duration,
    terminal_node: String,
    cache_scope: CacheScope,
}

impl DagExecutor {
    pub fn new(
        ledger: Arc<Ledger>,
        artifacts: Arc<ArtifactStore>,
        transport: Arc<dyn ToolTransport>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        let defaults = ExecutorConfig::default();
        Self {
            ledger,
            artifacts,
            transport,
            agents,
            node_timeout: defaults.node_timeout(),
            terminal_node: defaults.terminal_node,
            cache_scope: defaults.cache_scope,
        }
    }

    pub fn with_config(mut self, config: &ExecutorConfig) -> Self {
        self.node_timeout = config.node_timeout();
        self.terminal_node = config.terminal_node.clone();
        self.cache_scope = config.cache_scope;
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn with_cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    pub fn transport(&self) -> &Arc<dyn ToolTransport> {
        &self.transport
    }

    /// Execute a `pending` run to completion and return its result: the
    /// terminal node's output, or `{}` when the plan has no terminal node.
    ///
    /// Any node failure fails the run and is returned as the error.
    pub async fn execute(&self, run_id: &str, plan: &Plan) -> Result<Value> {
        let run = self
            .ledger
            .get_run(run_id)?
            .ok_or_else(|| PlexusError::RunNotFound(run_id.to_string()))?;
        if run.status != Status::Pending {
            return Err(PlexusError::InvalidRunState {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
            });
        }

        info!(run_id, plan_id = %plan.plan_id, nodes = plan.nodes.len(), "Execution started");

        let graph = match PlanGraph::build(plan) {
            Ok(graph) => graph,
            Err(e) => {
                self.fail_run(run_id, &e);
                return Err(e);
            }
        };

        self.ledger.start_run(run_id)?;

        let outputs = match self.run_nodes(run_id, &graph).await {
            Ok(outputs) => outputs,
            Err(e) => {
                self.fail_run(run_id, &e);
                return Err(e);
            }
        };

        let result = outputs
            .get(&self.terminal_node)
            .map(|o| o.payload.to_value())
            .unwrap_or_else(|| json!({}));
        self.ledger
            .update_run_status(run_id, Status::Success, Some(&result), None)?;

        info!(run_id, nodes = outputs.len(), "Execution completed");
        Ok(result)
    }

    fn fail_run(&self, run_id: &str, cause: &PlexusError) {
        error!(run_id, error = %cause, "Execution failed");
        if let Err(e) =
            self.ledger
                .update_run_status(run_id, Status::Failed, None, Some(&cause.to_string()))
        {
            error!(run_id, error = %e, "Failed to record run failure");
        }
    }

    async fn run_nodes(
        &self,
        run_id: &str,
        graph: &PlanGraph<'_>,
    ) -> Result<HashMap<String, NodeOutput>> {
        let mut outputs: HashMap<String, NodeOutput> = HashMap::new();
        for node in graph.ordered_nodes() {
            let predecessors = graph.predecessors(&node.id);
            let output = self.run_node(run_id, node, &predecessors, &outputs).await?;
            outputs.insert(node.id.clone(), output);
        }
        Ok(outputs)
    }

    async fn run_node(
        &self,
        run_id: &str,
        node: &PlanNode,
        predecessors: &[&str],
        outputs: &HashMap<String, NodeOutput>,
    ) -> Result<NodeOutput> {
        let mut ctx = AgentContext::new(run_id);
        let mut upstream_hashes = Vec::with_capacity(predecessors.len());
        for pred in predecessors {
            // Absent upstream outputs contribute nothing.
            if let Some(out) = outputs.get(*pred) {
                upstream_hashes.push(out.hash.clone());
                ctx.upstream.insert(
                    pred.to_string(),
                    UpstreamOutput {
                        artifact: out.artifact.clone(),
                        value: out.payload.to_value(),
                    },
                );
            }
        }
        let key = idempotency_key(node, &upstream_hashes);

        self.ledger
            .create_node(run_id, &node.id, &node.node_type, &key)?;
        let start_ms = now_ms();
        self.ledger.update_node_status(
            run_id,
            &node.id,
            Status::Running,
            NodeUpdate::started(start_ms),
        )?;
        debug!(run_id, node_id = %node.id, node_type = %node.node_type, idempotency_key = %key, "Node started");

        let outcome = self.produce(run_id, node, &key, &ctx, outputs).await;
        let end_ms = now_ms();

        match outcome {
            Ok(Produced {
                artifact,
                payload,
                cache_key,
            }) => {
                self.ledger.update_node_status(
                    run_id,
                    &node.id,
                    Status::Success,
                    NodeUpdate::succeeded(end_ms, artifact.clone()).with_cache_key(cache_key),
                )?;
                log_node_execution(run_id, node, Status::Success, start_ms, end_ms, Ok(artifact.as_str()));
                let hash = content_hash(&payload);
                Ok(NodeOutput {
                    artifact,
                    payload,
                    hash,
                })
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(db) = self.ledger.update_node_status(
                    run_id,
                    &node.id,
                    Status::Failed,
                    NodeUpdate::failed(end_ms, message.clone()),
                ) {
                    error!(run_id, node_id = %node.id, error = %db, "Failed to record node failure");
                }
                log_node_execution(run_id, node, Status::Failed, start_ms, end_ms, Err(message.as_str()));
                Err(e)
            }
        }
    }

    /// Obtain the node's output and persist it, from cache when allowed.
    async fn produce(
        &self,
        run_id: &str,
        node: &PlanNode,
        key: &str,
        ctx: &AgentContext,
        outputs: &HashMap<String, NodeOutput>,
    ) -> Result<Produced> {
        let inputs = self.resolve_inputs(run_id, node, outputs)?;
        let cache_key = cache_key(key, &inputs, ctx);
        if let Some((artifact, payload)) = self.cached(run_id, node, &cache_key)? {
            return Ok(Produced {
                artifact,
                payload,
                cache_key,
            });
        }

        let payload = match tokio::time::timeout(self.node_timeout, self.dispatch(node, ctx, inputs))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(PlexusError::NodeTimeout {
                    node: node.id.clone(),
                    timeout: self.node_timeout,
                })
            }
        };

        let format = ArtifactFormat::for_payload(&payload);
        let artifact = self.artifacts.write(run_id, &node.id, &payload, format)?;
        Ok(Produced {
            artifact,
            payload,
            cache_key,
        })
    }

    /// Reuse a prior successful output recorded under the same cache key.
    /// The artifact is copied into this run so reads stay run-scoped.
    fn cached(&self, run_id: &str, node: &PlanNode, cache_key: &str) -> Result<Option<(String, Payload)>> {
        let scope = match self.cache_scope {
            CacheScope::Off => return Ok(None),
            CacheScope::Run => Some(run_id),
            CacheScope::Global => None,
        };
        let Some(record) = self.ledger.find_cached(cache_key, scope)? else {
            return Ok(None);
        };
        let Some(source_uri) = record.output_artifact.as_deref() else {
            return Ok(None);
        };

        let copied = self
            .artifacts
            .copy_into(&record.run_id, source_uri, run_id, &node.id)
            .and_then(|uri| {
                let payload = self.artifacts.read(&uri, run_id)?;
                Ok((uri, payload))
            });
        match copied {
            Ok(hit) => {
                info!(
                    run_id,
                    node_id = %node.id,
                    source_run = %record.run_id,
                    source_node = %record.node_id,
                    "Idempotency cache hit"
                );
                Ok(Some(hit))
            }
            Err(PlexusError::ArtifactNotFound(missing)) => {
                warn!(run_id, node_id = %node.id, missing = %missing, "Cached artifact missing, executing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Declared args, overlaid with input bindings. Artifact URIs are
    /// replaced by the artifact's content; other values pass through.
    fn resolve_inputs(
        &self,
        run_id: &str,
        node: &PlanNode,
        outputs: &HashMap<String, NodeOutput>,
    ) -> Result<Map<String, Value>> {
        let mut inputs = node.args.clone();
        for (key, binding) in &node.input_bindings {
            let value = match binding.as_str().filter(|s| s.starts_with(ARTIFACT_URI_PREFIX)) {
                Some(uri) => self.read_binding(run_id, uri, outputs)?.to_value(),
                None => binding.clone(),
            };
            inputs.insert(key.clone(), value);
        }
        Ok(inputs)
    }

    /// A binding may name a different extension than the one its producer
    /// was stored under; fall back to the producer's recorded artifact.
    fn read_binding(
        &self,
        run_id: &str,
        uri: &str,
        outputs: &HashMap<String, NodeOutput>,
    ) -> Result<Payload> {
        match self.artifacts.read(uri, run_id) {
            Err(e @ PlexusError::ArtifactNotFound(_)) => {
                let produced = ArtifactUri::parse(uri)
                    .ok()
                    .and_then(|parsed| outputs.get(&parsed.node_id))
                    .filter(|out| out.artifact != uri);
                match produced {
                    Some(out) => {
                        debug!(run_id, binding = uri, artifact = %out.artifact, "Binding resolved to produced artifact");
                        self.artifacts.read(&out.artifact, run_id)
                    }
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    async fn dispatch(
        &self,
        node: &PlanNode,
        ctx: &AgentContext,
        inputs: Map<String, Value>,
    ) -> Result<Payload> {
        match node.kind()? {
            NodeKind::Tool => {
                let server = node
                    .server
                    .as_deref()
                    .ok_or_else(|| PlexusError::ServerNotFound("<missing>".into()))?;
                let tool = node.tool.as_deref().ok_or_else(|| PlexusError::ToolNotFound {
                    server: server.to_string(),
                    tool: "<missing>".into(),
                })?;
                debug!(node_id = %node.id, server, tool, transport = self.transport.name(), "Calling tool");
                self.transport.call_tool(server, tool, inputs).await
            }
            NodeKind::Agent => {
                let name = node
                    .agent
                    .as_deref()
                    .ok_or_else(|| PlexusError::UnknownAgent("<missing>".into()))?;
                let agent = self.agents.get(name)?;
                agent.run(ctx, inputs).await
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One structured event per finished node.
fn log_node_execution(
    run_id: &str,
    node: &PlanNode,
    status: Status,
    start_ms: i64,
    end_ms: i64,
    outcome: std::result::Result<&str, &str>,
) {
    let duration_ms = end_ms - start_ms;
    match outcome {
        Ok(artifact) => info!(
            event = "node_execution",
            run_id,
            node_id = %node.id,
            node_type = %node.node_type,
            status = %status,
            start_ms,
            end_ms,
            duration_ms,
            artifact_uri = artifact,
            "Node finished"
        ),
        Err(error) => warn!(
            event = "node_execution",
            run_id,
            node_id = %node.id,
            node_type = %node.node_type,
            status = %status,
            start_ms,
            end_ms,
            duration_ms,
            error,
            "Node failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::types::RunId;
    use plexus_test_utils::{
        agent_node, bind, plan, tool_node, EchoServer, FailingServer, RecordingServer, SleepServer,
    };
    use plexus_tools::{DirectTransport, ServerRegistry};

    struct Harness {
        _dir: tempfile::TempDir,
        ledger: Arc<Ledger>,
        artifacts: Arc<ArtifactStore>,
        recorder: RecordingServer,
        executor: DagExecutor,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let ledger = Arc::new(Ledger::in_memory().unwrap());
            let artifacts = Arc::new(ArtifactStore::new(dir.path().join("artifacts")));
            let recorder = RecordingServer::new("srv_rec");

            let mut registry = ServerRegistry::new();
            registry.register(EchoServer::new("srv_echo"));
            registry.register(SleepServer::new("srv_sleep"));
            registry.register(FailingServer::new("srv_fail", "boom"));
            registry.register(recorder.clone());
            let transport = Arc::new(DirectTransport::new(Arc::new(registry)));

            let executor = DagExecutor::new(
                ledger.clone(),
                artifacts.clone(),
                transport,
                Arc::new(AgentRegistry::with_builtins()),
            );
            Self {
                _dir: dir,
                ledger,
                artifacts,
                recorder,
                executor,
            }
        }

        fn submit(&self, plan: &Plan) -> String {
            let run_id = RunId::new().to_string();
            self.ledger
                .create_run(&run_id, &plan.plan_id, &json!("test query"))
                .unwrap();
            run_id
        }

        fn node_status(&self, run_id: &str, node_id: &str) -> Status {
            self.ledger.get_node(run_id, node_id).unwrap().unwrap().status
        }
    }

    fn record(id: &str) -> PlanNode {
        tool_node(id, "srv_rec", "record.call", json!({"label": id}))
    }

    #[tokio::test]
    async fn test_cyclic_plan_creates_no_nodes() {
        let h = Harness::new();
        let p = plan(vec![record("a"), record("b")], &[("a", "b"), ("b", "a")]);
        let run_id = h.submit(&p);

        let err = h.executor.execute(&run_id, &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::PlanCycle));

        let run = h.ledger.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, Status::Failed);
        assert_eq!(run.error.as_deref(), Some("Plan contains cycles"));
        assert!(run.finished_at.is_some());
        assert!(h.ledger.list_nodes(&run_id).unwrap().is_empty());
        assert!(h.recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_executes_in_dependency_order() {
        let h = Harness::new();
        let p = plan(
            vec![record("c"), record("b"), record("a"), record("d")],
            &[("a", "b"), ("b", "c"), ("a", "d")],
        );
        let run_id = h.submit(&p);

        h.executor.execute(&run_id, &p).await.unwrap();

        assert_eq!(h.recorder.labels(), vec!["a", "b", "c", "d"]);
        let nodes = h.ledger.list_nodes(&run_id).unwrap();
        assert_eq!(nodes.len(), 4);
        for node in nodes {
            assert_eq!(node.status, Status::Success);
            assert!(node.output_artifact.is_some());
            assert!(node.start_ms.unwrap() <= node.end_ms.unwrap());
        }
        let run = h.ledger.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, Status::Success);
        assert!(run.started_at.is_some());
    }

    #[tokio::test]
    async fn test_timeout_fails_run() {
        let mut h = Harness::new();
        h.executor = h.executor.with_node_timeout(Duration::from_millis(50));
        let p = plan(
            vec![
                tool_node("A", "srv_echo", "echo.args", json!({"x": 1})),
                tool_node("B", "srv_sleep", "sleep.wait", json!({"ms": 10_000})),
            ],
            &[("A", "B")],
        );
        let run_id = h.submit(&p);

        let err = h.executor.execute(&run_id, &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::NodeTimeout { .. }));

        let run = h.ledger.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, Status::Failed);

        let a = h.ledger.get_node(&run_id, "A").unwrap().unwrap();
        assert_eq!(a.status, Status::Success);
        assert!(a.output_artifact.is_some());

        let b = h.ledger.get_node(&run_id, "B").unwrap().unwrap();
        assert_eq!(b.status, Status::Failed);
        assert!(b.error.unwrap().contains("50ms"));
        assert!(b.end_ms.is_some());

        assert!(h.ledger.get_node(&run_id, "C").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_node_failure_stops_remaining_nodes() {
        let h = Harness::new();
        let p = plan(
            vec![
                tool_node("fetch", "srv_fail", "fail.now", json!({})),
                record("after"),
            ],
            &[("fetch", "after")],
        );
        let run_id = h.submit(&p);

        assert!(h.executor.execute(&run_id, &p).await.is_err());
        assert_eq!(h.node_status(&run_id, "fetch"), Status::Failed);
        assert!(h.ledger.get_node(&run_id, "after").unwrap().is_none());
        assert!(h.recorder.calls().is_empty());

        let run = h.ledger.get_run(&run_id).unwrap().unwrap();
        assert!(run.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_unknown_dispatch_targets() {
        let h = Harness::new();

        let p = plan(vec![agent_node("think", "summarizer")], &[]);
        let run_id = h.submit(&p);
        let err = h.executor.execute(&run_id, &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::UnknownAgent(_)));
        assert_eq!(h.node_status(&run_id, "think"), Status::Failed);

        let mut script = agent_node("script", "reducer");
        script.node_type = "script".into();
        let p = plan(vec![script], &[]);
        let run_id = h.submit(&p);
        let err = h.executor.execute(&run_id, &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::UnknownNodeType(_)));

        let p = plan(vec![tool_node("t", "srv_nowhere", "x.y", json!({}))], &[]);
        let run_id = h.submit(&p);
        let err = h.executor.execute(&run_id, &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::ServerNotFound(_)));
        assert_eq!(h.node_status(&run_id, "t"), Status::Failed);
    }

    #[tokio::test]
    async fn test_bindings_and_terminal_result() {
        let h = Harness::new();
        let sql = tool_node("sql", "srv_echo", "echo.table", json!({}));
        // Bound with the extension a planner would guess, not the one chosen.
        let viz = bind(agent_node("viz", "viz_spec_agent"), "dataframe_data", "artifact://sql/output.json");
        let reduce = bind(agent_node("reduce", "reducer"), "type", "chart");
        let p = plan(vec![sql, viz, reduce], &[("sql", "viz"), ("viz", "reduce")]);
        let run_id = h.submit(&p);

        let result = h.executor.execute(&run_id, &p).await.unwrap();
        assert_eq!(
            result,
            json!({"type": "chart", "status": "completed", "artifacts": ["artifact://viz/output.json"]})
        );

        let sql_node = h.ledger.get_node(&run_id, "sql").unwrap().unwrap();
        assert_eq!(sql_node.output_artifact.as_deref(), Some("artifact://sql/output.csv"));

        let spec = h.artifacts.read("artifact://viz/output.json", &run_id).unwrap().to_value();
        assert_eq!(spec["encoding"]["x"], "week");
        assert_eq!(spec["encoding"]["y"], "orders");

        let run = h.ledger.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.result, Some(result));
    }

    #[tokio::test]
    async fn test_no_terminal_node_gives_empty_result() {
        let h = Harness::new();
        let p = plan(vec![tool_node("img", "srv_echo", "echo.bytes", json!({}))], &[]);
        let run_id = h.submit(&p);

        let result = h.executor.execute(&run_id, &p).await.unwrap();
        assert_eq!(result, json!({}));

        let img = h.ledger.get_node(&run_id, "img").unwrap().unwrap();
        assert_eq!(img.output_artifact.as_deref(), Some("artifact://img/output.png"));
    }

    #[tokio::test]
    async fn test_literal_and_missing_bindings() {
        let h = Harness::new();
        let echo = bind(
            tool_node("echo", "srv_echo", "echo.args", json!({"a": 1, "b": 1})),
            "b",
            json!({"nested": true}),
        );
        let p = plan(vec![echo], &[]);
        let run_id = h.submit(&p);
        h.executor.execute(&run_id, &p).await.unwrap();
        let out = h.artifacts.read("artifact://echo/output.json", &run_id).unwrap().to_value();
        assert_eq!(out, json!({"a": 1, "b": {"nested": true}}));

        let dangling = bind(agent_node("v", "validator"), "data", "artifact://ghost/output.json");
        let p = plan(vec![dangling], &[]);
        let run_id = h.submit(&p);
        let err = h.executor.execute(&run_id, &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::ArtifactNotFound(_)));
        assert_eq!(h.node_status(&run_id, "v"), Status::Failed);
    }

    #[tokio::test]
    async fn test_idempotency_key_recorded() {
        let h = Harness::new();
        let p = plan(vec![record("a"), record("b")], &[("a", "b")]);
        let run_id = h.submit(&p);
        h.executor.execute(&run_id, &p).await.unwrap();

        let a = h.ledger.get_node(&run_id, "a").unwrap().unwrap();
        assert_eq!(a.idempotency_key, idempotency_key(&p.nodes[0], &[]));

        let a_out = h.artifacts.read(a.output_artifact.as_deref().unwrap(), &run_id).unwrap();
        let b = h.ledger.get_node(&run_id, "b").unwrap().unwrap();
        assert_eq!(
            b.idempotency_key,
            idempotency_key(&p.nodes[1], &[content_hash(&a_out)])
        );
    }

    #[tokio::test]
    async fn test_cache_off_always_dispatches() {
        let h = Harness::new();
        let twin = |id: &str| tool_node(id, "srv_rec", "record.call", json!({"label": "same"}));
        let p = plan(vec![twin("first"), twin("second")], &[]);
        let run_id = h.submit(&p);
        h.executor.execute(&run_id, &p).await.unwrap();
        assert_eq!(h.recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_run_scope() {
        let h = Harness::new();
        let executor = DagExecutor::new(
            h.ledger.clone(),
            h.artifacts.clone(),
            h.executor.transport().clone(),
            Arc::new(AgentRegistry::with_builtins()),
        )
        .with_cache_scope(CacheScope::Run);

        let twin = |id: &str| tool_node(id, "srv_rec", "record.call", json!({"label": "same"}));
        let p = plan(vec![twin("first"), twin("second")], &[]);

        let run_id = h.submit(&p);
        executor.execute(&run_id, &p).await.unwrap();
        assert_eq!(h.recorder.calls().len(), 1);

        let second = h.ledger.get_node(&run_id, "second").unwrap().unwrap();
        assert_eq!(second.status, Status::Success);
        assert_eq!(second.output_artifact.as_deref(), Some("artifact://second/output.json"));
        let first_out = h.artifacts.read("artifact://first/output.json", &run_id).unwrap();
        let second_out = h.artifacts.read("artifact://second/output.json", &run_id).unwrap();
        assert_eq!(first_out, second_out);

        // A fresh run does not see the first run's outputs.
        let other = h.submit(&p);
        executor.execute(&other, &p).await.unwrap();
        assert_eq!(h.recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_distinguishes_bound_inputs() {
        let h = Harness::new();
        let executor = DagExecutor::new(
            h.ledger.clone(),
            h.artifacts.clone(),
            h.executor.transport().clone(),
            Arc::new(AgentRegistry::with_builtins()),
        )
        .with_cache_scope(CacheScope::Run);

        let first = bind(tool_node("first", "srv_echo", "echo.args", json!({})), "region", "eu");
        let second = bind(tool_node("second", "srv_echo", "echo.args", json!({})), "region", "us");
        let third = bind(tool_node("third", "srv_echo", "echo.args", json!({})), "region", "eu");
        let p = plan(vec![first, second, third], &[]);
        let run_id = h.submit(&p);
        executor.execute(&run_id, &p).await.unwrap();

        let read = |uri: &str| h.artifacts.read(uri, &run_id).unwrap().to_value();
        assert_eq!(read("artifact://first/output.json"), json!({"region": "eu"}));
        assert_eq!(read("artifact://second/output.json"), json!({"region": "us"}));
        assert_eq!(read("artifact://third/output.json"), json!({"region": "eu"}));

        // Same declared node, so the recorded idempotency key is shared.
        let first = h.ledger.get_node(&run_id, "first").unwrap().unwrap();
        let second = h.ledger.get_node(&run_id, "second").unwrap().unwrap();
        assert_eq!(first.idempotency_key, second.idempotency_key);
    }

    #[tokio::test]
    async fn test_cache_distinguishes_upstream_artifacts() {
        let h = Harness::new();
        let executor = DagExecutor::new(
            h.ledger.clone(),
            h.artifacts.clone(),
            h.executor.transport().clone(),
            Arc::new(AgentRegistry::with_builtins()),
        )
        .with_cache_scope(CacheScope::Run);

        // Both reducers see one upstream with identical content, stored
        // under different node ids.
        let p = plan(
            vec![
                tool_node("left", "srv_echo", "echo.args", json!({"v": 1})),
                tool_node("right", "srv_echo", "echo.args", json!({"v": 1})),
                agent_node("reduce_left", "reducer"),
                agent_node("reduce_right", "reducer"),
            ],
            &[("left", "reduce_left"), ("right", "reduce_right")],
        );
        let run_id = h.submit(&p);
        executor.execute(&run_id, &p).await.unwrap();

        let out = h
            .artifacts
            .read("artifact://reduce_right/output.json", &run_id)
            .unwrap()
            .to_value();
        assert_eq!(out["artifacts"], json!(["artifact://right/output.json"]));
    }

    #[tokio::test]
    async fn test_cache_global_scope() {
        let h = Harness::new();
        let executor = DagExecutor::new(
            h.ledger.clone(),
            h.artifacts.clone(),
            h.executor.transport().clone(),
            Arc::new(AgentRegistry::with_builtins()),
        )
        .with_config(&ExecutorConfig {
            cache_scope: CacheScope::Global,
            ..ExecutorConfig::default()
        });

        let p = plan(vec![record("only")], &[]);
        let first = h.submit(&p);
        executor.execute(&first, &p).await.unwrap();
        let second = h.submit(&p);
        executor.execute(&second, &p).await.unwrap();

        assert_eq!(h.recorder.calls().len(), 1);
        let copied = h.artifacts.read("artifact://only/output.json", &second).unwrap();
        assert_eq!(copied.to_value()["seq"], 1);
    }

    #[tokio::test]
    async fn test_run_state_guard() {
        let h = Harness::new();
        let p = plan(vec![record("a")], &[]);

        let err = h.executor.execute("run_missing", &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::RunNotFound(_)));

        let run_id = h.submit(&p);
        h.executor.execute(&run_id, &p).await.unwrap();
        let err = h.executor.execute(&run_id, &p).await.unwrap_err();
        assert!(matches!(err, PlexusError::InvalidRunState { .. }));

        assert_eq!(h.recorder.calls().len(), 1);
        let run = h.ledger.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, Status::Success);
    }
}
