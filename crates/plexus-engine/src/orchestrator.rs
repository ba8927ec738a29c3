use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info};

use plexus_core::config::AppConfig;
use plexus_core::error::{PlexusError, Result};
use plexus_core::traits::ToolTransport;
use plexus_core::types::{
    LedgerMetrics, NodeRecord, Plan, RunId, RunRecord, RunReport, ServerManifest,
};
use plexus_store::{ArtifactStore, Ledger};

use crate::agents::AgentRegistry;
use crate::executor::DagExecutor;

/// Submission and query surface over the executor, ledger and artifact
/// store. Cheap to clone; clones share the same backends.
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<Ledger>,
    artifacts: Arc<ArtifactStore>,
    executor: Arc<DagExecutor>,
}

impl Orchestrator {
    pub fn new(ledger: Arc<Ledger>, artifacts: Arc<ArtifactStore>, executor: DagExecutor) -> Self {
        Self {
            ledger,
            artifacts,
            executor: Arc::new(executor),
        }
    }

    /// Open the ledger and artifact store named by the config and wire an
    /// executor around the given transport.
    pub fn from_config(config: &AppConfig, transport: Arc<dyn ToolTransport>) -> Result<Self> {
        let ledger = Arc::new(Ledger::open(&config.database_path())?);
        let artifacts = Arc::new(ArtifactStore::new(config.artifacts_path()));
        let executor = DagExecutor::new(
            ledger.clone(),
            artifacts.clone(),
            transport,
            Arc::new(AgentRegistry::with_builtins()),
        )
        .with_config(&config.executor);
        Ok(Self::new(ledger, artifacts, executor))
    }

    /// Record a new `pending` run for the plan.
    pub fn submit(&self, plan: &Plan, input_query: &Value) -> Result<String> {
        let run_id = RunId::new().to_string();
        self.ledger.create_run(&run_id, &plan.plan_id, input_query)?;
        info!(run_id = %run_id, plan_id = %plan.plan_id, "Run submitted");
        Ok(run_id)
    }

    pub async fn execute(&self, run_id: &str, plan: &Plan) -> Result<Value> {
        self.executor.execute(run_id, plan).await
    }

    /// Execute in a background task. The outcome is also in the ledger.
    pub fn spawn(&self, run_id: String, plan: Plan) -> JoinHandle<Result<Value>> {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.execute(&run_id, &plan).await;
            if let Err(e) = &outcome {
                error!(run_id = %run_id, error = %e, "Background run failed");
            }
            outcome
        })
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunRecord> {
        self.ledger
            .get_run(run_id)?
            .ok_or_else(|| PlexusError::RunNotFound(run_id.to_string()))
    }

    pub fn get_nodes(&self, run_id: &str) -> Result<Vec<NodeRecord>> {
        self.get_run(run_id)?;
        self.ledger.list_nodes(run_id)
    }

    pub fn get_metrics(&self) -> Result<LedgerMetrics> {
        self.ledger.metrics()
    }

    pub fn report(&self, run_id: &str) -> Result<RunReport> {
        self.ledger.report(run_id)
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.ledger.list_runs(limit)
    }

    /// Every artifact URI written under a run.
    pub fn artifacts(&self, run_id: &str) -> Result<Vec<String>> {
        self.artifacts.list(run_id)
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn manifest(&self, server: &str) -> Result<ServerManifest> {
        self.executor.transport().manifest(server).await
    }
}
