use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{AgentContext, Payload, ServerManifest, ToolSpec};

/// A named provider of tools, hosted in-process or behind a stdio worker.
pub trait ToolServer: Send + Sync + 'static {
    /// Server identity (e.g., "srv_fs").
    fn id(&self) -> &str;

    /// Tools this server declares.
    fn tools(&self) -> Vec<ToolSpec>;

    /// Invoke a declared tool by its dotted name.
    fn call<'a>(&'a self, tool: &'a str, args: Map<String, Value>)
        -> BoxFuture<'a, Result<Payload>>;

    fn manifest(&self) -> ServerManifest {
        ServerManifest {
            server: self.id().to_string(),
            tools: self.tools(),
        }
    }
}

/// The capability the executor calls tools through. Direct and stdio
/// transports are interchangeable implementations.
pub trait ToolTransport: Send + Sync + 'static {
    /// Transport name for logs ("direct", "stdio").
    fn name(&self) -> &str;

    fn call_tool<'a>(
        &'a self,
        server: &'a str,
        tool: &'a str,
        args: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>>;

    fn manifest<'a>(&'a self, server: &'a str) -> BoxFuture<'a, Result<ServerManifest>>;
}

/// A local agent function, selected by name from a fixed set.
pub trait Agent: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run with the node's resolved inputs. `ctx` carries the run id and the
    /// outputs of the node's direct predecessors.
    fn run<'a>(
        &'a self,
        ctx: &'a AgentContext,
        inputs: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Payload>>;
}

/// Dotted tool names map to method names with underscores.
pub fn method_name(tool: &str) -> String {
    tool.replace('.', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_name() {
        assert_eq!(method_name("file.read"), "file_read");
        assert_eq!(method_name("table.transform.v2"), "table_transform_v2");
        assert_eq!(method_name("plain"), "plain");
    }
}
