//! Tabular payloads and their CSV encoding.
//!
//! A `Table` is an ordered list of column names plus rows of JSON scalars.
//! It serializes to CSV for the tabular artifact format and to a records
//! object (`{"columns": [..], "rows": [{..}], "row_count": n}`) when it is
//! handed to a tool or agent as input, or sent over the stdio wire.
//!
//! The CSV codec preserves scalar types across a round-trip: unquoted
//! fields are read back as null / bool / integer / float where they parse,
//! and strings that would otherwise be mistaken for one of those are always
//! written quoted.

use serde_json::{Map, Value};

use crate::error::{PlexusError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row. Short rows are padded with nulls, long rows truncated.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// True when every cell is a scalar, so the table survives CSV intact.
    pub fn is_flat(&self) -> bool {
        self.rows
            .iter()
            .flatten()
            .all(|cell| !matches!(cell, Value::Array(_) | Value::Object(_)))
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Build a table from a list of JSON objects. Columns are the union of
    /// keys in first-seen order.
    pub fn from_records(records: &[Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            let obj = record.as_object().ok_or_else(|| {
                PlexusError::UnsupportedFormat("table rows must be JSON objects".into())
            })?;
            for key in obj.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let mut table = Table::new(columns);
        for record in records {
            if let Some(obj) = record.as_object() {
                let row = table
                    .columns
                    .iter()
                    .map(|c| obj.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                table.rows.push(row);
            }
        }
        Ok(table)
    }

    /// Rows as JSON objects keyed by column name.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let obj: Map<String, Value> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect();
                Value::Object(obj)
            })
            .collect()
    }

    /// The records object used for node inputs and the stdio wire.
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "columns": self.columns,
            "rows": self.to_records(),
            "row_count": self.rows.len(),
        })
    }

    /// Recognize the exact records object produced by [`Table::to_value`].
    pub fn from_wire(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != 3 || !obj.get("row_count")?.is_u64() {
            return None;
        }
        let columns: Vec<String> = obj
            .get("columns")?
            .as_array()?
            .iter()
            .map(|c| c.as_str().map(str::to_string))
            .collect::<Option<_>>()?;
        let rows = obj.get("rows")?.as_array()?;

        let mut table = Table::new(columns);
        for record in rows {
            let record = record.as_object()?;
            let row = table
                .columns
                .iter()
                .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            table.rows.push(row);
        }
        Some(table)
    }

    /// Lenient conversion used by tools: accepts the records object (with or
    /// without `columns`) or a bare array of records.
    pub fn from_value(value: &Value) -> Result<Self> {
        if let Some(table) = Table::from_wire(value) {
            return Ok(table);
        }
        let records = match value {
            Value::Array(items) => items.as_slice(),
            Value::Object(obj) => obj
                .get("rows")
                .and_then(|r| r.as_array())
                .map(|r| r.as_slice())
                .ok_or_else(|| {
                    PlexusError::UnsupportedFormat("table object has no 'rows' array".into())
                })?,
            _ => {
                return Err(PlexusError::UnsupportedFormat(
                    "expected a table or an array of records".into(),
                ))
            }
        };

        let mut table = Table::from_records(records)?;
        // Keep the declared column order when the caller supplied one.
        if let Some(declared) = value.get("columns").and_then(|c| c.as_array()) {
            let declared: Vec<String> = declared
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect();
            if declared.len() == table.columns.len()
                && declared.iter().all(|c| table.columns.contains(c))
            {
                table = table.reorder(&declared);
            }
        }
        Ok(table)
    }

    fn reorder(&self, columns: &[String]) -> Table {
        let indices: Vec<usize> = columns
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect();
        Table {
            columns: columns.to_vec(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        }
    }

    /// Serialize as CSV with a header line.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self.columns.iter().map(|c| quote_text(c)).collect();
        out.push_str(&header.join(","));
        out.push('\n');
        for row in &self.rows {
            let fields: Vec<String> = row.iter().map(encode_field).collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    /// Parse CSV produced by [`Table::to_csv`] (or any RFC 4180 style CSV
    /// with a header line).
    pub fn from_csv(input: &str) -> Result<Self> {
        let mut records = parse_csv(input)?.into_iter();
        let header = match records.next() {
            Some(h) => h,
            None => return Ok(Table::default()),
        };
        let columns = header.into_iter().map(|f| f.text).collect();
        let mut table = Table::new(columns);
        for record in records {
            let row = record.into_iter().map(decode_field).collect();
            table.push_row(row);
        }
        Ok(table)
    }
}

struct Field {
    text: String,
    quoted: bool,
}

fn encode_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            if looks_like_scalar(s) {
                quote(s)
            } else {
                quote_text(s)
            }
        }
        other => quote(&other.to_string()),
    }
}

/// Quote only when the text needs it syntactically.
fn quote_text(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) || s.starts_with(' ') || s.ends_with(' ') {
        quote(s)
    } else {
        s.to_string()
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Whether an unquoted field with this text would be read back as a non-string.
fn looks_like_scalar(s: &str) -> bool {
    s.is_empty() || !matches!(decode_unquoted(s), Value::String(_))
}

fn decode_field(field: Field) -> Value {
    if field.quoted {
        Value::String(field.text)
    } else {
        decode_unquoted(&field.text)
    }
}

fn decode_unquoted(text: &str) -> Value {
    if text.is_empty() {
        return Value::Null;
    }
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(u) = text.parse::<u64>() {
        return Value::from(u);
    }
    if let Ok(f) = text.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(text.to_string())
}

fn parse_csv(input: &str) -> Result<Vec<Vec<Field>>> {
    let mut records = Vec::new();
    let mut record: Vec<Field> = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            ',' => {
                record.push(Field {
                    text: std::mem::take(&mut field),
                    quoted,
                });
                quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(Field {
                    text: std::mem::take(&mut field),
                    quoted,
                });
                quoted = false;
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(PlexusError::UnsupportedFormat(
            "unterminated quoted field in CSV".into(),
        ));
    }
    if !field.is_empty() || quoted || !record.is_empty() {
        record.push(Field { text: field, quoted });
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Table {
        let mut t = Table::new(vec!["week".into(), "orders".into(), "region".into()]);
        t.push_row(vec![json!(1), json!(120.5), json!("north")]);
        t.push_row(vec![json!(2), json!(98), json!("south, east")]);
        t.push_row(vec![json!(3), Value::Null, json!("42")]);
        t
    }

    #[test]
    fn test_csv_roundtrip_preserves_types() {
        let table = sample();
        let csv = table.to_csv();
        let parsed = Table::from_csv(&csv).unwrap();
        assert_eq!(parsed, table);
    }

    #[test]
    fn test_is_flat() {
        assert!(sample().is_flat());
        let mut nested = Table::new(vec!["id".into(), "meta".into()]);
        nested.push_row(vec![json!(1), json!({"k": "v"})]);
        assert!(!nested.is_flat());
    }

    #[test]
    fn test_numeric_looking_string_is_quoted() {
        let csv = sample().to_csv();
        assert!(csv.contains("\"42\""));
        assert!(csv.contains("\"south, east\""));
    }

    #[test]
    fn test_embedded_quotes_and_newlines() {
        let mut t = Table::new(vec!["note".into()]);
        t.push_row(vec![json!("said \"hi\"\nthen left")]);
        let parsed = Table::from_csv(&t.to_csv()).unwrap();
        assert_eq!(parsed.rows[0][0], json!("said \"hi\"\nthen left"));
    }

    #[test]
    fn test_from_csv_crlf_without_trailing_newline() {
        let parsed = Table::from_csv("a,b\r\n1,x\r\n2,y").unwrap();
        assert_eq!(parsed.columns, vec!["a", "b"]);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.rows[1], vec![json!(2), json!("y")]);
    }

    #[test]
    fn test_unterminated_quote_is_error() {
        assert!(Table::from_csv("a\n\"oops").is_err());
    }

    #[test]
    fn test_records_roundtrip_through_wire_value() {
        let table = sample();
        let value = table.to_value();
        assert_eq!(value["row_count"], json!(3));
        assert_eq!(value["rows"][0]["region"], json!("north"));
        assert_eq!(Table::from_wire(&value), Some(table));
    }

    #[test]
    fn test_from_wire_rejects_plain_objects() {
        assert!(Table::from_wire(&json!({"rows": [], "columns": []})).is_none());
        assert!(Table::from_wire(&json!({"rows": [], "columns": [], "row_count": 0, "x": 1})).is_none());
    }

    #[test]
    fn test_from_value_accepts_bare_records() {
        let t = Table::from_value(&json!([{"a": 1, "b": 2}, {"a": 3, "c": 4}])).unwrap();
        assert_eq!(t.columns, vec!["a", "b", "c"]);
        assert_eq!(t.rows[1], vec![json!(3), Value::Null, json!(4)]);
    }

    #[test]
    fn test_from_value_keeps_declared_column_order() {
        let v = json!({"columns": ["b", "a"], "rows": [{"a": 1, "b": 2}]});
        let t = Table::from_value(&v).unwrap();
        assert_eq!(t.columns, vec!["b", "a"]);
        assert_eq!(t.rows[0], vec![json!(2), json!(1)]);
    }
}
