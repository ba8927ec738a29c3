use std::cmp::Ordering;
use std::path::PathBuf;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Number, Value};

use plexus_core::error::{PlexusError, Result};
use plexus_core::table::Table;
use plexus_core::traits::{method_name, ToolServer};
use plexus_core::types::{Payload, ToolSpec};

use super::{not_found, parse_args, resolve_path};

/// Tabular queries over CSV files and simple frame transforms.
pub struct TableServer {
    data_dir: PathBuf,
    default_source: Option<String>,
}

// ── table.query ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct QueryInput {
    #[serde(default)]
    source: Option<String>,
    /// Column equality filters.
    #[serde(default, rename = "where")]
    filters: Map<String, Value>,
    #[serde(default)]
    columns: Option<Vec<String>>,
    #[serde(default)]
    order_by: Option<String>,
    #[serde(default)]
    descending: bool,
    #[serde(default)]
    limit: Option<usize>,
}

// ── table.transform ─────────────────────────────────────────────

#[derive(Deserialize)]
struct TransformInput {
    #[serde(alias = "dataframe_data")]
    table: Value,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    window: Option<usize>,
    #[serde(default)]
    by: Option<String>,
    /// Shorthand such as `rolling(7).mean()` or `groupby('week').sum()`.
    #[serde(default)]
    script: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Transform {
    RollingMean(usize),
    GroupSum(String),
}

impl TransformInput {
    fn transform(&self) -> Result<Transform> {
        let invalid = |message: String| PlexusError::ToolArguments {
            tool: "table.transform".into(),
            message,
        };
        if let Some(script) = &self.script {
            return parse_script(script).ok_or_else(|| invalid(format!("unsupported script '{script}'")));
        }
        match self.op.as_deref() {
            Some("rolling_mean") => match self.window {
                Some(w) if w > 0 => Ok(Transform::RollingMean(w)),
                _ => Err(invalid("rolling_mean needs a positive 'window'".into())),
            },
            Some("group_sum") => self
                .by
                .clone()
                .map(Transform::GroupSum)
                .ok_or_else(|| invalid("group_sum needs a 'by' column".into())),
            Some(other) => Err(invalid(format!("unknown op '{other}'"))),
            None => Err(invalid("one of 'op' or 'script' is required".into())),
        }
    }
}

fn parse_script(script: &str) -> Option<Transform> {
    let script = script.trim();
    if let Some(rest) = script.strip_prefix("rolling(") {
        let (window, tail) = rest.split_once(')')?;
        if tail != ".mean()" {
            return None;
        }
        let window: usize = window.trim().parse().ok()?;
        return (window > 0).then_some(Transform::RollingMean(window));
    }
    if let Some(rest) = script.strip_prefix("groupby(") {
        let (col, tail) = rest.split_once(')')?;
        if tail != ".sum()" {
            return None;
        }
        let col = col.trim().trim_matches(|c| c == '\'' || c == '"');
        return (!col.is_empty()).then(|| Transform::GroupSum(col.to_string()));
    }
    None
}

impl TableServer {
    pub fn new(data_dir: impl Into<PathBuf>, default_source: Option<&str>) -> Self {
        Self {
            data_dir: data_dir.into(),
            default_source: default_source.map(str::to_string),
        }
    }

    async fn table_query(&self, args: Map<String, Value>) -> Result<Payload> {
        let input: QueryInput = parse_args("table.query", args)?;
        let source = input
            .source
            .clone()
            .or_else(|| self.default_source.clone())
            .ok_or_else(|| PlexusError::ToolArguments {
                tool: "table.query".into(),
                message: "no 'source' given and no default table configured".into(),
            })?;
        let path = resolve_path("table.query", &self.data_dir, &source)?;
        let text = tokio::fs::read_to_string(&path).await?;
        let table = Table::from_csv(&text)?;
        query(table, &input).map(Payload::Table)
    }

    async fn table_transform(&self, args: Map<String, Value>) -> Result<Payload> {
        let input: TransformInput = parse_args("table.transform", args)?;
        let table = Table::from_value(&input.table)?;
        let out = match input.transform()? {
            Transform::RollingMean(window) => rolling_mean(&table, window),
            Transform::GroupSum(by) => group_sum(&table, &by)?,
        };
        Ok(Payload::Table(out))
    }
}

fn query(table: Table, input: &QueryInput) -> Result<Table> {
    let column = |name: &str| {
        table.column_index(name).ok_or_else(|| PlexusError::ToolExecution {
            tool: "table.query".into(),
            message: format!("Unknown column '{name}'"),
        })
    };

    let filters = input
        .filters
        .iter()
        .map(|(name, expected)| Ok((column(name.as_str())?, expected)))
        .collect::<Result<Vec<_>>>()?;
    let mut rows: Vec<Vec<Value>> = table
        .rows
        .iter()
        .filter(|row| filters.iter().all(|(i, expected)| scalar_eq(&row[*i], expected)))
        .cloned()
        .collect();

    if let Some(order_by) = &input.order_by {
        let i = column(order_by.as_str())?;
        rows.sort_by(|a, b| compare(&a[i], &b[i]));
        if input.descending {
            rows.reverse();
        }
    }
    if let Some(limit) = input.limit {
        rows.truncate(limit);
    }

    let selected: Vec<usize> = match &input.columns {
        Some(names) => names.iter().map(|n| column(n.as_str())).collect::<Result<_>>()?,
        None => (0..table.columns.len()).collect(),
    };
    let mut out = Table::new(selected.iter().map(|&i| table.columns[i].clone()).collect());
    for row in rows {
        out.push_row(selected.iter().map(|&i| row[i].clone()).collect());
    }
    Ok(out)
}

/// Loose equality so that `"3"` matches `3` and `3` matches `3.0`.
fn scalar_eq(actual: &Value, expected: &Value) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => match (actual, expected) {
            (Value::String(a), b) | (b, Value::String(a)) if !b.is_string() => {
                a == &b.to_string()
            }
            _ => actual == expected,
        },
    }
}

/// Nulls first, then numbers, then everything else by its text.
fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => text(a).cmp(&text(b)),
        },
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_numeric_column(table: &Table, i: usize) -> bool {
    table.rows.iter().all(|r| r[i].is_null() || r[i].is_number())
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// Trailing-window mean over numeric columns. The first `window - 1` rows
/// have no full window and become null; other columns pass through.
fn rolling_mean(table: &Table, window: usize) -> Table {
    let numeric: Vec<bool> = (0..table.columns.len())
        .map(|i| is_numeric_column(table, i))
        .collect();
    let mut out = Table::new(table.columns.clone());
    for (r, row) in table.rows.iter().enumerate() {
        let values = row
            .iter()
            .enumerate()
            .map(|(c, v)| {
                if !numeric[c] {
                    return v.clone();
                }
                if r + 1 < window {
                    return Value::Null;
                }
                let slice = &table.rows[r + 1 - window..=r];
                let nums: Option<Vec<f64>> = slice.iter().map(|row| row[c].as_f64()).collect();
                match nums {
                    Some(nums) => float(nums.iter().sum::<f64>() / window as f64),
                    None => Value::Null,
                }
            })
            .collect();
        out.push_row(values);
    }
    out
}

/// Sum numeric columns per distinct `by` value, keeping first-seen key order.
/// Non-numeric columns other than the key are dropped.
fn group_sum(table: &Table, by: &str) -> Result<Table> {
    let key = table.column_index(by).ok_or_else(|| PlexusError::ToolExecution {
        tool: "table.transform".into(),
        message: format!("Unknown column '{by}'"),
    })?;
    let summed: Vec<usize> = (0..table.columns.len())
        .filter(|&i| i != key && is_numeric_column(table, i))
        .collect();

    let mut keys: Vec<Value> = Vec::new();
    let mut sums: Vec<Vec<(i64, f64, bool)>> = Vec::new();
    for row in &table.rows {
        let slot = match keys.iter().position(|k| k == &row[key]) {
            Some(pos) => pos,
            None => {
                keys.push(row[key].clone());
                sums.push(vec![(0, 0.0, true); summed.len()]);
                keys.len() - 1
            }
        };
        for (j, &c) in summed.iter().enumerate() {
            let acc = &mut sums[slot][j];
            if let Value::Number(n) = &row[c] {
                acc.1 += n.as_f64().unwrap_or(0.0);
                match n.as_i64() {
                    Some(i) if acc.2 => acc.0 = acc.0.saturating_add(i),
                    _ => acc.2 = false,
                }
            }
        }
    }

    let mut columns = vec![table.columns[key].clone()];
    columns.extend(summed.iter().map(|&i| table.columns[i].clone()));
    let mut out = Table::new(columns);
    for (k, totals) in keys.into_iter().zip(sums) {
        let mut row = vec![k];
        row.extend(totals.into_iter().map(|(int, f, all_int)| {
            if all_int {
                Value::from(int)
            } else {
                float(f)
            }
        }));
        out.push_row(row);
    }
    Ok(out)
}

impl ToolServer for TableServer {
    fn id(&self) -> &str {
        "srv_table"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "table.query".into(),
                description: "Filter, order and project rows of a CSV table".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "source": { "type": "string", "description": "CSV path; defaults to the configured table" },
                        "where": { "type": "object", "description": "Column equality filters" },
                        "columns": { "type": "array", "items": { "type": "string" } },
                        "order_by": { "type": "string" },
                        "descending": { "type": "boolean" },
                        "limit": { "type": "integer", "minimum": 0 }
                    }
                }),
            },
            ToolSpec {
                name: "table.transform".into(),
                description: "Apply rolling_mean or group_sum to a table".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "table": { "type": "object", "description": "Records object with 'rows'" },
                        "op": { "type": "string", "enum": ["rolling_mean", "group_sum"] },
                        "window": { "type": "integer", "minimum": 1 },
                        "by": { "type": "string" },
                        "script": { "type": "string" }
                    },
                    "required": ["table"]
                }),
            },
        ]
    }

    fn call<'a>(
        &'a self,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            match method_name(tool).as_str() {
                "table_query" => self.table_query(args).await,
                "table_transform" => self.table_transform(args).await,
                _ => Err(not_found(self.id(), tool)),
            }
        })
    }
}
