//! Worker side of the stdio protocol.
//!
//! A worker reads JSON-RPC requests line by line until EOF and answers each
//! with exactly one response line. Nothing but protocol lines may be written
//! to the response stream; diagnostics go through `tracing`, which the binary
//! points at stderr in worker mode.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use plexus_core::error::Result;
use plexus_core::traits::ToolServer;

use crate::rpc::{RpcRequest, RpcResponse, INVALID_REQUEST, PARSE_ERROR};

/// Serve requests from `reader` until EOF, writing responses to `writer`.
pub async fn serve<R, W>(server: &dyn ToolServer, reader: R, mut writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(server, &line).await;
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn handle_line(server: &dyn ToolServer, line: &str) -> RpcResponse {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(server = server.id(), error = %e, "Unparseable request line");
            return RpcResponse::failure(Value::Null, PARSE_ERROR, format!("Parse error: {e}"));
        }
    };

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            return RpcResponse::failure(id, INVALID_REQUEST, format!("Invalid request: {e}"));
        }
    };

    debug!(server = server.id(), method = %request.method, "Serving request");
    match server.call(&request.method, request.params).await {
        Ok(payload) => RpcResponse::success(request.id, payload.to_value()),
        Err(e) => {
            warn!(server = server.id(), method = %request.method, error = %e, "Tool call failed");
            RpcResponse::from_error(request.id, &e)
        }
    }
}

/// Print a server's manifest as pretty JSON followed by a newline.
pub async fn write_manifest<W>(server: &dyn ToolServer, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = serde_json::to_string_pretty(&server.manifest())?;
    out.push('\n');
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Run a worker over the process's stdin/stdout.
pub async fn run_stdio_worker(server: &dyn ToolServer, manifest_only: bool) -> Result<()> {
    let stdout = tokio::io::stdout();
    if manifest_only {
        return write_manifest(server, stdout).await;
    }
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(server, stdin, stdout).await
}
