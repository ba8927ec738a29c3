use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use plexus_core::error::Result;
use plexus_core::traits::Agent;
use plexus_core::types::{AgentContext, Payload, ARTIFACT_URI_PREFIX};

/// Produces the run's final typed output, listing the artifacts it was
/// built from.
pub struct ReducerAgent;

impl Agent for ReducerAgent {
    fn name(&self) -> &str {
        "reducer"
    }

    fn run<'a>(
        &'a self,
        ctx: &'a AgentContext,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            let output_type = inputs
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");

            let mut artifacts = ctx.artifacts();
            for value in inputs.values() {
                if let Some(uri) = value.as_str().filter(|s| s.starts_with(ARTIFACT_URI_PREFIX)) {
                    if !artifacts.iter().any(|a| a == uri) {
                        artifacts.push(uri.to_string());
                    }
                }
            }

            Ok(Payload::Json(json!({
                "type": output_type,
                "status": "completed",
                "artifacts": artifacts,
            })))
        })
    }
}
