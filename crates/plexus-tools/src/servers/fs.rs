use std::path::PathBuf;

use base64::Engine;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Map, Value};

use plexus_core::error::Result;
use plexus_core::traits::{method_name, ToolServer};
use plexus_core::types::{Payload, ToolSpec};

use super::{not_found, parse_args, resolve_path};

/// File access: `file.read` returns base64 content, `file.bytes` the raw
/// bytes.
pub struct FsServer {
    root: PathBuf,
}

#[derive(Deserialize)]
struct ReadInput {
    path: String,
    #[serde(default)]
    format: Option<String>,
}

impl FsServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn load(&self, tool: &str, path: &str) -> Result<(PathBuf, Vec<u8>)> {
        let resolved = resolve_path(tool, &self.root, path)?;
        let bytes = tokio::fs::read(&resolved).await?;
        Ok((resolved, bytes))
    }

    async fn file_read(&self, args: Map<String, Value>) -> Result<Payload> {
        let input: ReadInput = parse_args("file.read", args)?;
        let (path, bytes) = self.load("file.read", &input.path).await?;
        let format = input.format.unwrap_or_else(|| {
            path.extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        Ok(Payload::Json(serde_json::json!({
            "bytes_base64": base64::engine::general_purpose::STANDARD.encode(&bytes),
            "size": bytes.len(),
            "path": path.display().to_string(),
            "format": format,
        })))
    }

    async fn file_bytes(&self, args: Map<String, Value>) -> Result<Payload> {
        let input: ReadInput = parse_args("file.bytes", args)?;
        let (_, bytes) = self.load("file.bytes", &input.path).await?;
        Ok(Payload::Binary(bytes))
    }
}

impl ToolServer for FsServer {
    fn id(&self) -> &str {
        "srv_fs"
    }

    fn tools(&self) -> Vec<ToolSpec> {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path, relative to the data directory" }
            },
            "required": ["path"]
        });
        vec![
            ToolSpec {
                name: "file.read".into(),
                description: "Read a file and return its base64-encoded bytes".into(),
                input_schema: schema.clone(),
            },
            ToolSpec {
                name: "file.bytes".into(),
                description: "Read a file as a raw binary payload".into(),
                input_schema: schema,
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
                "file_read" => self.file_read(args).await,
                "file_bytes" => self.file_bytes(args).await,
                _ => Err(not_found(self.id(), tool)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::error::PlexusError;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_file_read_base64() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("invoice.pdf"), b"%PDF-1.4 hello").unwrap();
        let server = FsServer::new(dir.path());

        let out = server
            .call("file.read", args(json!({"path": "./invoice.pdf"})))
            .await
            .unwrap();
        let Payload::Json(v) = out else { panic!("expected json") };
        assert_eq!(v["size"], json!(14));
        assert_eq!(v["format"], json!("pdf"));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(v["bytes_base64"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"%PDF-1.4 hello");
    }

    #[tokio::test]
    async fn test_file_bytes_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chart.png"), [0x89, b'P', b'N', b'G']).unwrap();
        let server = FsServer::new(dir.path());

        let out = server
            .call("file.bytes", args(json!({"path": "chart.png"})))
            .await
            .unwrap();
        assert_eq!(out, Payload::Binary(vec![0x89, b'P', b'N', b'G']));

        assert!(matches!(
            server.call("file.read", args(json!({"path": "missing.txt"}))).await,
            Err(PlexusError::ToolExecution { .. })
        ));
        assert!(matches!(
            server.call("file.read", Map::new()).await,
            Err(PlexusError::ToolArguments { .. })
        ));
        assert!(matches!(
            server.call("file.write", Map::new()).await,
            Err(PlexusError::ToolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_paths_confined_to_root() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("data");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(outer.path().join("secret.txt"), b"keep out").unwrap();
        std::fs::write(root.join("nested/ok.txt"), b"fine").unwrap();
        let server = FsServer::new(&root);

        let out = server
            .call("file.bytes", args(json!({"path": "nested/../nested/ok.txt"})))
            .await
            .unwrap();
        assert_eq!(out, Payload::Binary(b"fine".to_vec()));

        let absolute = outer.path().join("secret.txt").display().to_string();
        for path in ["../secret.txt", absolute.as_str()] {
            match server.call("file.read", args(json!({"path": path}))).await {
                Err(PlexusError::ToolExecution { message, .. }) => {
                    assert!(message.contains("escapes"), "{path}: {message}")
                }
                other => panic!("{path}: expected rejection, got {other:?}"),
            }
        }
    }
}
