//! Local agent functions dispatched by `agent` nodes.

pub mod extraction;
pub mod reducer;
pub mod validator;
pub mod viz;

pub use extraction::ExtractionAgent;
pub use reducer::ReducerAgent;
pub use validator::ValidatorAgent;
pub use viz::VizSpecAgent;

use std::collections::BTreeMap;
use std::sync::Arc;

use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::Agent;

/// The fixed set of agents a plan may name.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: impl Agent) {
        self.agents.insert(agent.name().to_string(), Arc::new(agent));
    }

    /// Look up an agent; an unknown name is fatal for the node.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| PlexusError::UnknownAgent(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.keys().map(|s| s.as_str()).collect()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(VizSpecAgent);
        registry.register(ExtractionAgent);
        registry.register(ValidatorAgent);
        registry.register(ReducerAgent);
        registry
    }
}
