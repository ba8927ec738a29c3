use std::sync::OnceLock;

use base64::Engine;
use chrono::NaiveDate;
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::warn;

use plexus_core::error::Result;
use plexus_core::traits::Agent;
use plexus_core::types::{AgentContext, Payload};

const RAW_TEXT_LIMIT: usize = 1000;

/// Pulls invoice fields out of a document handed over as `file_ref`.
///
/// Failures are reported in the output (`extraction_status: "error"`) rather
/// than failing the node.
pub struct ExtractionAgent;

struct InvoicePatterns {
    invoice_number: Regex,
    dates: [Regex; 2],
    total: Regex,
    vendor: Regex,
    pdf_text: Regex,
    pdf_page: Regex,
}

fn patterns() -> std::result::Result<&'static InvoicePatterns, String> {
    static PATTERNS: OnceLock<std::result::Result<InvoicePatterns, String>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let compile = |p: &str| Regex::new(p).map_err(|e| e.to_string());
            Ok(InvoicePatterns {
                invoice_number: compile(r"(?i)(?:invoice|bill)[^\d]*(\d{4,})")?,
                dates: [
                    compile(r"(\d{1,2}[/-]\d{1,2}[/-]\d{2,4})")?,
                    compile(r"(\d{4}[-/]\d{1,2}[-/]\d{1,2})")?,
                ],
                total: compile(r"(?i)total.*?\$?\s*(\d{1,3}(?:[,\.]\d{3})*(?:\.\d{2})?)")?,
                vendor: compile(
                    r"(?i)(?:from|vendor|supplier)[:;\s]+([A-Z][a-zA-Z\s\.&,]+(?:Inc|Ltd|LLC|GmbH|Pvt|LLP|Corp|Company)?\b)",
                )?,
                pdf_text: compile(r"\(((?:[^()\\]|\\.)*)\)\s*Tj")?,
                pdf_page: compile(r"/Type\s*/Page\b")?,
            })
        })
        .as_ref()
        .map_err(Clone::clone)
}

/// Text content of a document plus its page count.
struct Document {
    text: String,
    pages: usize,
}

impl Document {
    fn from_bytes(bytes: &[u8], p: &InvoicePatterns) -> Self {
        if !bytes.starts_with(b"%PDF") {
            let text = String::from_utf8_lossy(bytes).trim().to_string();
            let pages = text.split('\u{c}').count();
            return Self { text, pages };
        }

        // Uncompressed content streams only: text-showing operators carry
        // the literal strings.
        let raw = String::from_utf8_lossy(bytes);
        let lines: Vec<String> = p
            .pdf_text
            .captures_iter(&raw)
            .filter_map(|c| c.get(1))
            .map(|m| unescape_pdf_string(m.as_str()))
            .collect();
        Self {
            text: lines.join("\n").trim().to_string(),
            pages: p.pdf_page.find_iter(&raw).count().max(1),
        }
    }
}

fn unescape_pdf_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Only `YYYY-MM-DD` dates are accepted.
fn valid_iso_date(candidate: &str) -> bool {
    let year_digits = candidate.split('-').next().map(str::len);
    year_digits == Some(4) && NaiveDate::parse_from_str(candidate, "%Y-%m-%d").is_ok()
}

fn parse_invoice(text: &str, p: &InvoicePatterns) -> Map<String, Value> {
    let raw_text = if text.chars().count() > RAW_TEXT_LIMIT {
        format!("{}...", text.chars().take(RAW_TEXT_LIMIT).collect::<String>())
    } else {
        text.to_string()
    };

    let invoice_number = p
        .invoice_number
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| format!("INV-{}", m.as_str()))
        .unwrap_or_else(|| "Not found".to_string());

    let date = p
        .dates
        .iter()
        .filter_map(|re| re.captures(text).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .find(|d| valid_iso_date(d))
        .map(str::to_string)
        .unwrap_or_else(|| "Not found".to_string());

    let total_amount = p
        .total
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .last()
        .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok());

    let vendor = p
        .vendor
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| "Not found".to_string());

    let mut result = Map::new();
    result.insert("invoice_number".into(), json!(invoice_number));
    result.insert("date".into(), json!(date));
    result.insert("total_amount".into(), json!(total_amount));
    result.insert("vendor".into(), json!(vendor));
    result.insert("line_items".into(), json!([]));
    result.insert("raw_text".into(), json!(raw_text));
    result
}

fn extract(inputs: &Map<String, Value>) -> std::result::Result<Value, String> {
    let p = patterns()?;
    let file_ref = inputs
        .get("file_ref")
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
        .ok_or("No file reference provided")?;

    let encoded = file_ref
        .get("bytes_base64")
        .or_else(|| file_ref.get("binary_base64"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or("No PDF content found in file reference")?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("Invalid base64 content: {e}"))?;

    let doc = Document::from_bytes(&bytes, p);
    let mut result = parse_invoice(&doc.text, p);
    let file_type = file_ref
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    result.insert("extraction_status".into(), json!("success"));
    result.insert("pages_processed".into(), json!(doc.pages));
    result.insert("tables_found".into(), json!(0));
    result.insert("line_items_count".into(), json!(0));
    result.insert(
        "file_metadata".into(),
        json!({ "size_bytes": bytes.len(), "file_type": file_type }),
    );
    Ok(Value::Object(result))
}

impl Agent for ExtractionAgent {
    fn name(&self) -> &str {
        "extraction_agent"
    }

    fn run<'a>(
        &'a self,
        ctx: &'a AgentContext,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            let output = extract(&inputs).unwrap_or_else(|error| {
                warn!(run_id = %ctx.run_id, error = %error, "Extraction failed");
                json!({
                    "extraction_status": "error",
                    "error": error,
                    "raw_input_keys": inputs.keys().collect::<Vec<_>>(),
                })
            });
            Ok(Payload::Json(output))
        })
    }
}
