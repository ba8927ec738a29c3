use std::path::PathBuf;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::{method_name, ToolServer};
use plexus_core::types::{Payload, ToolSpec};

use super::{not_found, parse_args};

/// Tracking records kept in a single JSON array file.
pub struct TrackingServer {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

#[derive(Deserialize)]
struct UpsertInput {
    #[serde(default)]
    tracking_id: Option<String>,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl TrackingServer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| PlexusError::ToolExecution {
                tool: "tracking.upsert".into(),
                message: format!("Corrupt tracking file {}: {e}", self.path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, records: &[Value]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn tracking_upsert(&self, args: Map<String, Value>) -> Result<Payload> {
        let input: UpsertInput = parse_args("tracking.upsert", args)?;
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let now = Utc::now().to_rfc3339();

        let tracking_id = input.tracking_id.unwrap_or_else(|| {
            let hex = uuid::Uuid::new_v4().simple().to_string();
            format!("trk_{}", &hex[..8])
        });
        let existing = records
            .iter_mut()
            .filter_map(|r| r.as_object_mut())
            .find(|r| r.get("tracking_id").and_then(|v| v.as_str()) == Some(tracking_id.as_str()));

        let status = match existing {
            Some(record) => {
                record.extend(input.fields);
                record.insert("updated_at".into(), Value::String(now));
                "updated"
            }
            None => {
                let mut record = Map::new();
                record.insert("tracking_id".into(), Value::String(tracking_id.clone()));
                record.insert("created_at".into(), Value::String(now.clone()));
                record.insert("updated_at".into(), Value::String(now));
                record.extend(input.fields);
                records.push(Value::Object(record));
                "created"
            }
        };

        self.save(&records).await?;
        debug!(tracking_id = %tracking_id, status, "Tracking record upserted");
        Ok(Payload::Json(serde_json::json!({
            "tracking_id": tracking_id,
            "status": status,
        })))
    }
}

impl ToolServer for TrackingServer {
    fn id(&self) -> &str {
        "srv_tracking"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        vec![ToolSpec {
            name: "tracking.upsert".into(),
            description: "Create or update a tracking record".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "tracking_id": { "type": "string" },
                    "fields": { "type": "object" }
                }
            }),
        }]
    }

    fn call<'a>(
        &'a self,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(async move {
            match method_name(tool).as_str() {
                "tracking_upsert" => self.tracking_upsert(args).await,
                _ => Err(not_found(self.id(), tool)),
            }
        })
    }
}
