use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::debug;

use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::ToolTransport;
use plexus_core::types::{Payload, ServerManifest};

use crate::registry::ServerRegistry;

/// In-process transport: calls go straight to registered server objects.
/// Binary payloads pass through unencoded.
pub struct DirectTransport {
    registry: Arc<ServerRegistry>,
}

impl DirectTransport {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }
}

impl ToolTransport for DirectTransport {
    fn name(&self) -> &str {
        "direct"
    }

    fn call_tool<'a>(
        &'a self,
        server: &'a str,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>> {
        // Undeclared servers and tools fail before anything is dispatched.
        let target = match self.registry.get(server) {
            Some(s) => s,
            None => {
                let err = PlexusError::ServerNotFound(server.to_string());
                return Box::pin(async move { Err(err) });
            }
        };
        if !target.manifest().has_tool(tool) {
            let err = PlexusError::ToolNotFound {
                server: server.to_string(),
                tool: tool.to_string(),
            };
            return Box::pin(async move { Err(err) });
        }

        Box::pin(async move {
            debug!(server, tool, "Direct tool call");
            target.call(tool, args).await
        })
    }

    fn manifest<'a>(&'a self, server: &'a str) -> BoxFuture<'a, Result<ServerManifest>> {
        Box::pin(async move {
            self.registry
                .get(server)
                .map(|s| s.manifest())
                .ok_or_else(|| PlexusError::ServerNotFound(server.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_test_utils::{EchoServer, SleepServer};
    use serde_json::json;

    fn transport() -> DirectTransport {
        let mut registry = ServerRegistry::new();
        registry.register(EchoServer::new("srv_echo"));
        registry.register(SleepServer::new("srv_sleep"));
        DirectTransport::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_call_known_tool() {
        let t = transport();
        let mut args = Map::new();
        args.insert("msg".into(), json!("hi"));
        let out = t.call_tool("srv_echo", "echo.args", args).await.unwrap();
        assert_eq!(out, Payload::Json(json!({"msg": "hi"})));
    }

    #[tokio::test]
    async fn test_binary_passes_through() {
        let t = transport();
        let out = t.call_tool("srv_echo", "echo.bytes", Map::new()).await.unwrap();
        assert!(matches!(out, Payload::Binary(_)));
    }

    #[tokio::test]
    async fn test_unknown_server_and_tool() {
        let t = transport();
        assert!(matches!(
            t.call_tool("srv_nope", "x", Map::new()).await,
            Err(PlexusError::ServerNotFound(_))
        ));
        assert!(matches!(
            t.call_tool("srv_echo", "echo.missing", Map::new()).await,
            Err(PlexusError::ToolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_manifest() {
        let t = transport();
        let m = t.manifest("srv_sleep").await.unwrap();
        assert_eq!(m.server, "srv_sleep");
        assert!(m.has_tool("sleep.wait"));
        assert!(t.manifest("srv_nope").await.is_err());
    }
}
