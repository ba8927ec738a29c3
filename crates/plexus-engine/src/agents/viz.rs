use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use plexus_core::error::Result;
use plexus_core::traits::Agent;
use plexus_core::types::{AgentContext, Payload};
use plexus_core::Table;

/// Builds a line-chart spec from tabular rows: first column on x, second on y.
pub struct VizSpecAgent;

impl VizSpecAgent {
    fn source<'a>(ctx: &'a AgentContext, inputs: &'a Map<String, Value>) -> Option<&'a Value> {
        inputs.get("dataframe_data").or_else(|| {
            ctx.upstream
                .values()
                .map(|u| &u.value)
                .find(|v| v.get("rows").is_some_and(|r| r.is_array()))
        })
    }

    fn spec(table: &Table) -> Value {
        if table.is_empty() {
            return json!({"error": "No data to visualize"});
        }
        let x = table.columns.first().map(String::as_str).unwrap_or("x");
        let y = table.columns.get(1).map(String::as_str).unwrap_or("y");
        json!({
            "type": "plotspec",
            "grammar": "plotly",
            "encoding": { "x": x, "y": y, "mark": "line" },
            "data": table.to_records(),
            "title": format!("{y} over {x}"),
        })
    }
}

impl Agent for VizSpecAgent {
    fn name(&self) -> &str {
        "viz_spec_agent"
    }

    fn run<'a>(
        &'a self,
        ctx: &'a AgentContext,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            let table = Self::source(ctx, &inputs)
                .and_then(|v| Table::from_value(v).ok())
                .unwrap_or_else(|| Table::new(Vec::new()));
            Ok(Payload::Json(Self::spec(&table)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::types::UpstreamOutput;

    #[tokio::test]
    async fn test_spec_from_bound_table() {
        let mut table = Table::new(vec!["week".into(), "orders".into()]);
        table.push_row(vec![json!(1), json!(10)]);
        table.push_row(vec![json!(2), json!(12)]);
        let mut inputs = Map::new();
        inputs.insert("dataframe_data".into(), table.to_value());

        let ctx = AgentContext::new("run_1");
        let out = VizSpecAgent.run(&ctx, inputs).await.unwrap().to_value();
        assert_eq!(out["type"], "plotspec");
        assert_eq!(out["encoding"], json!({"x": "week", "y": "orders", "mark": "line"}));
        assert_eq!(out["title"], "orders over week");
        assert_eq!(out["data"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_falls_back_to_upstream_rows() {
        let mut ctx = AgentContext::new("run_1");
        ctx.upstream.insert(
            "transform".into(),
            UpstreamOutput {
                artifact: "artifact://transform/output.csv".into(),
                value: json!({"columns": ["day", "sales"], "rows": [{"day": "mon", "sales": 3}], "row_count": 1}),
            },
        );
        let out = VizSpecAgent.run(&ctx, Map::new()).await.unwrap().to_value();
        assert_eq!(out["encoding"]["x"], "day");
        assert_eq!(out["encoding"]["y"], "sales");
    }

    #[tokio::test]
    async fn test_no_rows() {
        let mut inputs = Map::new();
        inputs.insert("dataframe_data".into(), json!({"rows": []}));
        let ctx = AgentContext::new("run_1");
        let out = VizSpecAgent.run(&ctx, inputs).await.unwrap().to_value();
        assert_eq!(out, json!({"error": "No data to visualize"}));

        let out = VizSpecAgent.run(&ctx, Map::new()).await.unwrap().to_value();
        assert_eq!(out, json!({"error": "No data to visualize"}));
    }
}
