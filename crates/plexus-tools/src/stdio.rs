use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use plexus_core::config::WorkerConfig;
use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::ToolTransport;
use plexus_core::types::{Payload, ServerManifest};

use crate::rpc::{RpcRequest, RpcResponse};

/// How to spawn a worker process for one server.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl From<&WorkerConfig> for WorkerCommand {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }
}

/// Out-of-process transport: every call spawns a fresh worker, sends one
/// request line and reads one response line.
pub struct StdioTransport {
    workers: HashMap<String, WorkerCommand>,
    /// Fallback for servers without an explicit command; the server id is
    /// appended as the last argument.
    default_worker: Option<WorkerCommand>,
    call_timeout: Duration,
    manifest_timeout: Duration,
    next_id: AtomicU64,
}

impl StdioTransport {
    pub fn new(call_timeout: Duration, manifest_timeout: Duration) -> Self {
        Self {
            workers: HashMap::new(),
            default_worker: None,
            call_timeout,
            manifest_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_worker(mut self, server: impl Into<String>, command: WorkerCommand) -> Self {
        self.workers.insert(server.into(), command);
        self
    }

    pub fn with_default_worker(mut self, command: WorkerCommand) -> Self {
        self.default_worker = Some(command);
        self
    }

    fn worker_for(&self, server: &str) -> Result<WorkerCommand> {
        if let Some(cmd) = self.workers.get(server) {
            return Ok(cmd.clone());
        }
        self.default_worker
            .clone()
            .map(|cmd| cmd.arg(server))
            .ok_or_else(|| PlexusError::ServerNotFound(server.to_string()))
    }

    async fn call(&self, server: &str, tool: &str, args: Map<String, Value>) -> Result<Payload> {
        let worker = self.worker_for(server)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, tool, args);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let mut child = worker
            .command()
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(server, &worker, e))?;
        relay_stderr(server, &mut child);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PlexusError::Protocol("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlexusError::Protocol("worker stdout not captured".into()))?;

        debug!(server, tool, id, "Stdio tool call");
        let mut response_line = String::new();
        // The call timeout covers the request write as well as the response.
        let exchange = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await?;
            // Closing stdin lets the worker see EOF after one request.
            drop(stdin);
            BufReader::new(stdout).read_line(&mut response_line).await
        };
        let read = tokio::time::timeout(self.call_timeout, exchange).await;

        let n = match read {
            Ok(result) => result?,
            Err(_) => {
                warn!(server, tool, timeout = ?self.call_timeout, "Worker timed out, killing");
                let _ = child.kill().await;
                return Err(PlexusError::WorkerTimeout {
                    server: server.to_string(),
                    timeout: self.call_timeout,
                });
            }
        };
        // One response per process; whatever is left gets killed on drop.
        drop(child);

        if n == 0 || response_line.trim().is_empty() {
            return Err(PlexusError::Protocol(format!(
                "No response from worker for {server}"
            )));
        }
        let response: RpcResponse = serde_json::from_str(response_line.trim()).map_err(|e| {
            PlexusError::Protocol(format!("Invalid JSON response from {server}: {e}"))
        })?;
        if response.id != Value::from(id) {
            return Err(PlexusError::Protocol(format!(
                "Response id {} does not match request id {id}",
                response.id
            )));
        }
        if let Some(error) = response.error {
            return Err(PlexusError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        let result = response
            .result
            .ok_or_else(|| PlexusError::Protocol("Response has neither result nor error".into()))?;
        Payload::from_wire(result)
    }

    async fn fetch_manifest(&self, server: &str) -> Result<ServerManifest> {
        let worker = self.worker_for(server)?.arg("--manifest");
        let mut child = worker
            .command()
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(server, &worker, e))?;
        relay_stderr(server, &mut child);

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlexusError::Protocol("worker stdout not captured".into()))?;
        let mut body = String::new();
        let read =
            tokio::time::timeout(self.manifest_timeout, stdout.read_to_string(&mut body)).await;
        match read {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                warn!(server, timeout = ?self.manifest_timeout, "Manifest fetch timed out, killing");
                let _ = child.kill().await;
                return Err(PlexusError::WorkerTimeout {
                    server: server.to_string(),
                    timeout: self.manifest_timeout,
                });
            }
        }
        let _ = child.wait().await;

        if body.trim().is_empty() {
            return Err(PlexusError::Protocol(format!("No manifest from {server}")));
        }
        serde_json::from_str(body.trim())
            .map_err(|e| PlexusError::Protocol(format!("Invalid manifest JSON from {server}: {e}")))
    }
}

fn spawn_error(server: &str, worker: &WorkerCommand, e: std::io::Error) -> PlexusError {
    PlexusError::Protocol(format!(
        "Failed to spawn worker for {server} ({}): {e}",
        worker.program
    ))
}

/// Forward the worker's stderr to our log, line by line.
fn relay_stderr(server: &str, child: &mut Child) {
    if let Some(stderr) = child.stderr.take() {
        let server = server.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %server, "worker: {}", line);
            }
        });
    }
}

impl ToolTransport for StdioTransport {
    fn name(&self) -> &str {
        "stdio"
    }

    fn call_tool<'a>(
        &'a self,
        server: &'a str,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        Box::pin(self.call(server, tool, args))
    }

    fn manifest<'a>(&'a self, server: &'a str) -> BoxFuture<'a, Result<ServerManifest>> {
        Box::pin(self.fetch_manifest(server))
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("sh").arg("-c").arg(script)
    }

    fn transport() -> StdioTransport {
        StdioTransport::new(Duration::from_secs(5), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_success_response() {
        let t = transport().with_worker(
            "srv_sh",
            sh(r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'"#),
        );
        let out = t.call_tool("srv_sh", "x.y", Map::new()).await.unwrap();
        assert_eq!(out, Payload::Json(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_error_response_keeps_code() {
        let t = transport().with_worker(
            "srv_sh",
            sh(r#"read line; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Tool x.y not found"}}'"#),
        );
        match t.call_tool("srv_sh", "x.y", Map::new()).await {
            Err(PlexusError::Rpc { code, .. }) => assert_eq!(code, -32601),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stderr_does_not_confuse_response() {
        let t = transport().with_worker(
            "srv_sh",
            sh(r#"read line; echo noise >&2; echo '{"jsonrpc":"2.0","id":1,"result":[1]}'"#),
        );
        let out = t.call_tool("srv_sh", "x.y", Map::new()).await.unwrap();
        assert_eq!(out, Payload::Json(json!([1])));
    }

    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let t = StdioTransport::new(Duration::from_millis(200), Duration::from_secs(1))
            .with_worker("srv_slow", sh("sleep 30"));
        let start = std::time::Instant::now();
        let err = t.call_tool("srv_slow", "x.y", Map::new()).await.unwrap_err();
        assert!(matches!(err, PlexusError::WorkerTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_covers_blocked_request_write() {
        // The worker never reads stdin, so a request larger than the pipe
        // buffer blocks the write.
        let t = StdioTransport::new(Duration::from_millis(200), Duration::from_secs(1))
            .with_worker("srv_deaf", sh("sleep 5"));
        let mut args = Map::new();
        args.insert("blob".into(), json!("x".repeat(1024 * 1024)));

        let start = std::time::Instant::now();
        let err = t.call_tool("srv_deaf", "x.y", args).await.unwrap_err();
        assert!(matches!(err, PlexusError::WorkerTimeout { .. }), "got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_malformed_and_missing_responses() {
        let t = transport()
            .with_worker("srv_garbage", sh("read line; echo 'not json'"))
            .with_worker("srv_silent", sh("read line; exit 0"));
        assert!(matches!(
            t.call_tool("srv_garbage", "x", Map::new()).await,
            Err(PlexusError::Protocol(_))
        ));
        assert!(matches!(
            t.call_tool("srv_silent", "x", Map::new()).await,
            Err(PlexusError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_server_without_default() {
        assert!(matches!(
            transport().call_tool("srv_none", "x", Map::new()).await,
            Err(PlexusError::ServerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manifest_flag_is_appended() {
        // `$0` is the first arg after the script, i.e. "--manifest"
        let t = transport().with_worker(
            "srv_sh",
            sh(r#"[ "$0" = "--manifest" ] && printf '{\n  "server": "srv_sh",\n  "tools": []\n}\n'"#),
        );
        let manifest = t.manifest("srv_sh").await.unwrap();
        assert_eq!(manifest.server, "srv_sh");
        assert!(manifest.tools.is_empty());
    }
}
