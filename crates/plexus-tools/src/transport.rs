use std::sync::Arc;

use tracing::info;

use plexus_core::config::{TransportConfig, TransportMode};
use plexus_core::traits::ToolTransport;

use crate::direct::DirectTransport;
use crate::registry::ServerRegistry;
use crate::stdio::{StdioTransport, WorkerCommand};

/// Select the transport once, at construction time.
///
/// `default_worker` is how stdio workers are spawned for servers with no
/// `[transport.workers.<id>]` entry; the server id is appended to it.
pub fn build_transport(
    config: &TransportConfig,
    registry: Arc<ServerRegistry>,
    default_worker: Option<WorkerCommand>,
) -> Arc<dyn ToolTransport> {
    match config.mode {
        TransportMode::Direct => {
            info!(servers = ?registry.ids(), "Using direct transport");
            Arc::new(DirectTransport::new(registry))
        }
        TransportMode::Stdio => {
            let mut transport =
                StdioTransport::new(config.call_timeout(), config.manifest_timeout());
            for (server, worker) in &config.workers {
                transport = transport.with_worker(server.clone(), WorkerCommand::from(worker));
            }
            if let Some(default) = default_worker {
                transport = transport.with_default_worker(default);
            }
            info!(overrides = config.workers.len(), "Using stdio transport");
            Arc::new(transport)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selects_transport() {
        let registry = Arc::new(ServerRegistry::new());
        let mut config = TransportConfig::default();
        assert_eq!(build_transport(&config, registry.clone(), None).name(), "direct");

        config.mode = TransportMode::Stdio;
        let t = build_transport(&config, registry, Some(WorkerCommand::new("plexus")));
        assert_eq!(t.name(), "stdio");
    }
}
