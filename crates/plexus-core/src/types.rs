use std::collections::BTreeMap;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{PlexusError, Result};
use crate::table::Table;

/// Prefix marking an `input_bindings` value as an artifact reference.
pub const ARTIFACT_URI_PREFIX: &str = "artifact://";

/// Unique run identifier (`run_` + 8 hex chars).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("run_{}", &hex[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status shared by runs and node records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Success,
    Failed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::Running,
        Status::Success,
        Status::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failed)
    }
}

impl FromStr for Status {
    type Err = PlexusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Status::Pending),
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            other => Err(PlexusError::Database(format!("unknown status '{other}'"))),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a node is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Tool,
    Agent,
}

impl FromStr for NodeKind {
    type Err = PlexusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tool" => Ok(NodeKind::Tool),
            "agent" => Ok(NodeKind::Agent),
            other => Err(PlexusError::UnknownNodeType(other.to_string())),
        }
    }
}

/// An execution plan: a DAG of nodes and edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    #[serde(default)]
    pub flow_type: String,
    pub nodes: Vec<PlanNode>,
    #[serde(default)]
    pub edges: Vec<PlanEdge>,
    #[serde(default)]
    pub budgets: Value,
}

/// Ordered `(source, target)` pair; serialized as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEdge(pub String, pub String);

impl PlanEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self(source.into(), target.into())
    }

    pub fn source(&self) -> &str {
        &self.0
    }

    pub fn target(&self) -> &str {
        &self.1
    }
}

/// A unit of work in a plan.
///
/// `node_type` stays a string so that an unrecognized type fails the node
/// that carries it, not the whole plan at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub input_bindings: BTreeMap<String, Value>,
}

impl PlanNode {
    pub fn kind(&self) -> Result<NodeKind> {
        self.node_type.parse()
    }
}

/// A node's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Table(Table),
    Binary(Vec<u8>),
}

impl Payload {
    /// JSON view used when the payload feeds a downstream node or crosses
    /// the stdio wire. Binary becomes a base64 envelope.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Json(v) => v.clone(),
            Payload::Table(t) => t.to_value(),
            Payload::Binary(bytes) => serde_json::json!({
                "binary_base64": base64::engine::general_purpose::STANDARD.encode(bytes),
                "size_bytes": bytes.len(),
            }),
        }
    }

    /// Inverse of [`Payload::to_value`] for values received off the wire.
    pub fn from_wire(value: Value) -> Result<Self> {
        if let Some(encoded) = binary_envelope(&value) {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| PlexusError::Protocol(format!("invalid base64 payload: {e}")))?;
            return Ok(Payload::Binary(bytes));
        }
        if let Some(table) = Table::from_wire(&value) {
            return Ok(Payload::Table(table));
        }
        Ok(Payload::Json(value))
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Payload::Json(_) => "json",
            Payload::Table(_) => "table",
            Payload::Binary(_) => "binary",
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

impl From<Table> for Payload {
    fn from(table: Table) -> Self {
        Payload::Table(table)
    }
}

fn binary_envelope(value: &Value) -> Option<&str> {
    let obj = value.as_object()?;
    if obj.len() != 2 || !obj.contains_key("size_bytes") {
        return None;
    }
    obj.get("binary_base64")?.as_str()
}

/// A predecessor's output as seen by a downstream agent.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOutput {
    pub artifact: String,
    pub value: Value,
}

/// What an agent knows beyond its own inputs.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub run_id: String,
    /// Direct predecessors' outputs keyed by node id.
    pub upstream: BTreeMap<String, UpstreamOutput>,
}

impl AgentContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            upstream: BTreeMap::new(),
        }
    }

    /// Upstream artifact URIs in node id order.
    pub fn artifacts(&self) -> Vec<String> {
        self.upstream.values().map(|u| u.artifact.clone()).collect()
    }
}

/// Durable run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub plan_id: String,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_query: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Durable node row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub run_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: Status,
    pub output_artifact: Option<String>,
    pub error: Option<String>,
    pub idempotency_key: String,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl NodeRecord {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.start_ms, self.end_ms) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Latency summary over successful nodes, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub p50: i64,
    pub p95: i64,
    pub p99: i64,
    pub max: i64,
    pub mean: f64,
}

impl LatencyStats {
    /// Nearest-rank percentiles over the given samples.
    pub fn from_samples(mut samples: Vec<i64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();
        let rank = |p: f64| -> i64 {
            let idx = ((p / 100.0) * samples.len() as f64).ceil() as usize;
            samples[idx.clamp(1, samples.len()) - 1]
        };
        let sum: i64 = samples.iter().sum();
        Self {
            count: samples.len(),
            p50: rank(50.0),
            p95: rank(95.0),
            p99: rank(99.0),
            max: samples[samples.len() - 1],
            mean: sum as f64 / samples.len() as f64,
        }
    }
}

/// Aggregate ledger metrics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerMetrics {
    pub runs_total: u64,
    pub nodes_by_status: BTreeMap<String, u64>,
    pub latency_ms: LatencyStats,
}

/// Per-run summary assembled from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub plan_id: String,
    pub status: Status,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub artifacts: Vec<String>,
    pub node_count: usize,
    pub success_count: usize,
    pub total_duration_ms: i64,
}

/// A tool as described in a server manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A server's self-description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerManifest {
    pub server: String,
    pub tools: Vec<ToolSpec>,
}

impl ServerManifest {
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_id_format() {
        let id = RunId::new();
        assert!(id.as_str().starts_with("run_"));
        assert_eq!(id.as_str().len(), 12);
        assert!(id.as_str()[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_status_roundtrip() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("done".parse::<Status>().is_err());
    }

    #[test]
    fn test_plan_deserialize() {
        let plan: Plan = serde_json::from_value(json!({
            "plan_id": "p1",
            "flow_type": "trend",
            "nodes": [
                {"id": "q", "type": "tool", "server": "srv_table", "tool": "table.query", "args": {"limit": 5}},
                {"id": "reduce", "type": "agent", "agent": "reducer",
                 "input_bindings": {"data": "artifact://q/output.csv"}}
            ],
            "edges": [["q", "reduce"]],
            "budgets": {"latency_s": 60}
        }))
        .unwrap();
        assert_eq!(plan.nodes.len(), 2);
        assert_eq!(plan.edges[0].source(), "q");
        assert_eq!(plan.edges[0].target(), "reduce");
        let node = |id: &str| plan.nodes.iter().find(|n| n.id == id).unwrap();
        assert_eq!(node("q").kind().unwrap(), NodeKind::Tool);
        assert_eq!(node("reduce").agent.as_deref(), Some("reducer"));
    }

    #[test]
    fn test_unknown_node_kind() {
        let err = "lambda".parse::<NodeKind>().unwrap_err();
        assert!(matches!(err, PlexusError::UnknownNodeType(t) if t == "lambda"));
    }

    #[test]
    fn test_binary_payload_wire_roundtrip() {
        let payload = Payload::Binary(vec![0x89, b'P', b'N', b'G', 0, 1, 2]);
        let wire = payload.to_value();
        assert_eq!(wire["size_bytes"], json!(7));
        assert_eq!(Payload::from_wire(wire).unwrap(), payload);
    }

    #[test]
    fn test_from_wire_leaves_plain_json() {
        let v = json!({"binary_base64": "AAAA", "size_bytes": 3, "extra": true});
        assert_eq!(Payload::from_wire(v.clone()).unwrap(), Payload::Json(v));
    }

    #[test]
    fn test_latency_nearest_rank() {
        let stats = LatencyStats::from_samples((1..=100).collect());
        assert_eq!(stats.count, 100);
        assert_eq!(stats.p50, 50);
        assert_eq!(stats.p95, 95);
        assert_eq!(stats.p99, 99);
        assert_eq!(stats.max, 100);
        assert!((stats.mean - 50.5).abs() < f64::EPSILON);

        let single = LatencyStats::from_samples(vec![7]);
        assert_eq!((single.p50, single.p99, single.max), (7, 7, 7));
        assert_eq!(LatencyStats::from_samples(vec![]), LatencyStats::default());
    }
}
