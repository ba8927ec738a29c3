//! Fixtures shared by the Plexus test suites: plan builders, a temporary
//! workspace, and scripted `ToolServer` mocks.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use plexus_core::config::AppConfig;
use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::ToolServer;
use plexus_core::types::{Payload, Plan, PlanEdge, PlanNode, ToolSpec};

/// Bytes starting with the PNG signature.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13];

// ── Plan builders ───────────────────────────────────────────────

pub fn tool_node(id: &str, server: &str, tool: &str, args: Value) -> PlanNode {
    PlanNode {
        id: id.to_string(),
        node_type: "tool".to_string(),
        server: Some(server.to_string()),
        tool: Some(tool.to_string()),
        agent: None,
        args: object(args),
        input_bindings: Default::default(),
    }
}

pub fn agent_node(id: &str, agent: &str) -> PlanNode {
    PlanNode {
        id: id.to_string(),
        node_type: "agent".to_string(),
        server: None,
        tool: None,
        agent: Some(agent.to_string()),
        args: Map::new(),
        input_bindings: Default::default(),
    }
}

/// Add an input binding (artifact URI or literal) to a node.
pub fn bind(mut node: PlanNode, key: &str, value: impl Into<Value>) -> PlanNode {
    node.input_bindings.insert(key.to_string(), value.into());
    node
}

pub fn plan(nodes: Vec<PlanNode>, edges: &[(&str, &str)]) -> Plan {
    Plan {
        plan_id: "plan_test".to_string(),
        flow_type: "test".to_string(),
        nodes,
        edges: edges.iter().map(|(s, t)| PlanEdge::new(*s, *t)).collect(),
        budgets: json!({"latency_s": 60}),
    }
}

fn object(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        Value::Null => Map::new(),
        other => {
            let mut m = Map::new();
            m.insert("value".into(), other);
            m
        }
    }
}

// ── Temp workspace ──────────────────────────────────────────────

/// A temporary directory laid out like a deployment: ledger file, artifact
/// root and data directory.
pub struct TempWorkspace {
    dir: tempfile::TempDir,
}

impl TempWorkspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        std::fs::create_dir_all(dir.path().join("data")).expect("create data dir");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("plexus.db")
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    /// Write a file under the data directory.
    pub fn write_data(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.data_dir().join(name);
        std::fs::write(&path, contents).expect("write data file");
        path
    }

    /// Config pointing every path into this workspace.
    pub fn config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.storage.database_path = self.db_path().display().to_string();
        config.storage.artifacts_path = self.artifacts_path().display().to_string();
        config.servers.data_dir = self.data_dir().display().to_string();
        config.servers.tracking_path = self.data_dir().join("tracking.json").display().to_string();
        config
    }
}

impl Default for TempWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

// ── Mock servers ────────────────────────────────────────────────

fn spec(name: &str) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: format!("test tool {name}"),
        input_schema: json!({"type": "object"}),
    }
}

fn not_found(server: &str, tool: &str) -> PlexusError {
    PlexusError::ToolNotFound {
        server: server.to_string(),
        tool: tool.to_string(),
    }
}

/// `echo.args` returns its arguments, `echo.bytes` a PNG-like binary,
/// `echo.table` a two-row table.
pub struct EchoServer {
    id: String,
}

impl EchoServer {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl ToolServer for EchoServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![spec("echo.args"), spec("echo.bytes"), spec("echo.table")]
    }

    fn call<'a>(
        &'a self,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            match tool {
                "echo.args" => Ok(Payload::Json(Value::Object(args))),
                "echo.bytes" => Ok(Payload::Binary(PNG_BYTES.to_vec())),
                "echo.table" => {
                    let mut table = plexus_core::Table::new(vec!["week".into(), "orders".into()]);
                    table.push_row(vec![json!(1), json!(10)]);
                    table.push_row(vec![json!(2), json!(20)]);
                    Ok(Payload::Table(table))
                }
                _ => Err(not_found(&self.id, tool)),
            }
        })
    }
}

/// `sleep.wait` sleeps for `ms` milliseconds (default 60s).
pub struct SleepServer {
    id: String,
}

impl SleepServer {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

impl ToolServer for SleepServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![spec("sleep.wait")]
    }

    fn call<'a>(
        &'a self,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            if tool != "sleep.wait" {
                return Err(not_found(&self.id, tool));
            }
            let ms = args.get("ms").and_then(|v| v.as_u64()).unwrap_or(60_000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Payload::Json(json!({"slept_ms": ms})))
        })
    }
}

/// `fail.now` always fails with the configured message.
pub struct FailingServer {
    id: String,
    message: String,
}

impl FailingServer {
    pub fn new(id: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            message: message.to_string(),
        }
    }
}

impl ToolServer for FailingServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![spec("fail.now")]
    }

    fn call<'a>(
        &'a self,
        tool: &'a str,
        _args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            if tool != "fail.now" {
                return Err(not_found(&self.id, tool));
            }
            Err(PlexusError::ToolExecution {
                tool: tool.to_string(),
                message: self.message.clone(),
            })
        })
    }
}

/// A single recorded call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub tool: String,
    pub args: Map<String, Value>,
}

/// `record.call` logs each invocation and returns `{"seq": n, "args": ..}`.
/// Clones share the same log.
#[derive(Clone)]
pub struct RecordingServer {
    id: String,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl RecordingServer {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// The `label` argument of each call, in call order.
    pub fn labels(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.args.get("label").and_then(|v| v.as_str()).map(str::to_string))
            .collect()
    }
}

impl ToolServer for RecordingServer {
    fn id(&self) -> &str {
        &self.id
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![spec("record.call")]
    }

    fn call<'a>(
        &'a self,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            if tool != "record.call" {
                return Err(not_found(&self.id, tool));
            }
            let seq = {
                let mut calls = self
                    .calls
                    .lock()
                    .map_err(|e| PlexusError::ToolExecution {
                        tool: tool.to_string(),
                        message: e.to_string(),
                    })?;
                calls.push(RecordedCall {
                    tool: tool.to_string(),
                    args: args.clone(),
                });
                calls.len()
            };
            Ok(Payload::Json(json!({"seq": seq, "args": args})))
        })
    }
}
