use std::collections::BTreeMap;
use std::sync::Arc;

use plexus_core::config::ServersConfig;
use plexus_core::traits::ToolServer;
use plexus_core::types::ServerManifest;

use crate::servers::{FsServer, TableServer, TrackingServer};

/// Registry of in-process tool servers, keyed by server id.
#[derive(Default, Clone)]
pub struct ServerRegistry {
    servers: BTreeMap<String, Arc<dyn ToolServer>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server, replacing any previous one with the same id.
    pub fn register(&mut self, server: impl ToolServer) {
        self.register_arc(Arc::new(server));
    }

    pub fn register_arc(&mut self, server: Arc<dyn ToolServer>) {
        self.servers.insert(server.id().to_string(), server);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ToolServer>> {
        self.servers.get(id).cloned()
    }

    /// Server ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.servers.keys().map(|s| s.as_str()).collect()
    }

    pub fn manifests(&self) -> Vec<ServerManifest> {
        self.servers.values().map(|s| s.manifest()).collect()
    }

    /// Create a registry with the built-in servers.
    pub fn with_builtins(config: &ServersConfig) -> Self {
        let mut registry = Self::new();
        registry.register(FsServer::new(&config.data_dir));
        registry.register(TrackingServer::new(&config.tracking_path));
        registry.register(TableServer::new(&config.data_dir, config.table_path.as_deref()));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = ServerRegistry::with_builtins(&ServersConfig::default());
        assert_eq!(registry.ids(), vec!["srv_fs", "srv_table", "srv_tracking"]);
        for manifest in registry.manifests() {
            assert!(!manifest.tools.is_empty(), "{} has no tools", manifest.server);
            for tool in &manifest.tools {
                assert!(!tool.name.is_empty());
                assert!(tool.input_schema.is_object());
            }
        }
        assert!(registry.get("srv_missing").is_none());
    }
}
