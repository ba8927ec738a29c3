use std::sync::OnceLock;

use futures::future::BoxFuture;
use regex::RegexSet;
use serde_json::{json, Map, Value};

use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::Agent;
use plexus_core::types::{AgentContext, Payload};

/// Checks that its inputs are non-empty and carry no obvious PII
/// (email addresses, US social security numbers, card numbers).
pub struct ValidatorAgent;

fn pii_patterns() -> Result<&'static RegexSet> {
    static PII: OnceLock<std::result::Result<RegexSet, String>> = OnceLock::new();
    PII.get_or_init(|| {
        RegexSet::new([
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            r"\b\d{3}-\d{2}-\d{4}\b",
            r"\b(?:\d[ -]?){13,16}\b",
        ])
        .map_err(|e| e.to_string())
    })
    .as_ref()
    .map_err(|e| PlexusError::Config(format!("PII patterns: {e}")))
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl Agent for ValidatorAgent {
    fn name(&self) -> &str {
        "validator"
    }

    fn run<'a>(
        &'a self,
        _ctx: &'a AgentContext,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            let patterns = pii_patterns()?;
            let non_empty = !inputs.is_empty();

            let wrapped = Value::Object(inputs);
            let mut strings = Vec::new();
            collect_strings(&wrapped, &mut strings);
            let no_pii = !strings.iter().any(|s| patterns.is_match(s));

            Ok(Payload::Json(json!({
                "valid": non_empty && no_pii,
                "checks": { "non_empty": non_empty, "no_pii": no_pii },
            })))
        })
    }
}
