use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use plexus_core::types::{AgentContext, PlanNode};
use plexus_store::canonical_json;

/// Fingerprint of a node's identity, declared arguments and upstream content.
///
/// Independent of run id and wall-clock time, and of the order of keys in
/// `args` or of `upstream_hashes`.
pub fn idempotency_key(node: &PlanNode, upstream_hashes: &[String]) -> String {
    let args: Vec<Value> = {
        let mut pairs: Vec<(&String, &Value)> = node.args.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs.into_iter().map(|(k, v)| json!([k, v])).collect()
    };
    let mut upstreams = upstream_hashes.to_vec();
    upstreams.sort();

    let key_data = json!({
        "type": node.node_type,
        "server": node.server,
        "tool": node.tool,
        "agent": node.agent,
        "args": args,
        "upstreams": upstreams,
    });

    let digest = Sha256::digest(canonical_json(&key_data).as_bytes());
    format!("{:x}", digest)
}

/// Key for reusing a prior output: the idempotency key extended with the
/// node's resolved inputs and the artifact URIs of its upstream outputs.
///
/// Two nodes share a cache key only when they would receive the same
/// inputs, including literal bindings and artifacts bound from nodes that
/// are not direct predecessors.
pub fn cache_key(idempotency_key: &str, inputs: &Map<String, Value>, ctx: &AgentContext) -> String {
    let key_data = json!({
        "idempotency_key": idempotency_key,
        "inputs": Value::Object(inputs.clone()),
        "upstream_artifacts": ctx.artifacts(),
    });

    let digest = Sha256::digest(canonical_json(&key_data).as_bytes());
    format!("{:x}", digest)
}
