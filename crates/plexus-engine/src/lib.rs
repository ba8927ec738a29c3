pub mod agents;
pub mod executor;
pub mod graph;
pub mod idempotency;
pub mod orchestrator;

pub use agents::AgentRegistry;
pub use executor::DagExecutor;
pub use graph::PlanGraph;
pub use idempotency::idempotency_key;
pub use orchestrator::Orchestrator;
