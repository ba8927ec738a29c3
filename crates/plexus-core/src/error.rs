use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlexusError {
    // Plan errors
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Plan contains cycles")]
    PlanCycle,

    // Node errors
    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Timeout after {timeout:?} waiting for node '{node}'")]
    NodeTimeout { node: String, timeout: Duration },

    // Tool errors
    #[error("Unknown server: {0}")]
    ServerNotFound(String),

    #[error("Tool {tool} not found on {server}")]
    ToolNotFound { server: String, tool: String },

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Invalid tool arguments for {tool}: {message}")]
    ToolArguments { tool: String, message: String },

    // Protocol errors (stdio transport)
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("Worker timeout after {timeout:?}: {server}")]
    WorkerTimeout { server: String, timeout: Duration },

    // Storage errors
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Invalid artifact URI: {0}")]
    InvalidArtifactUri(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Database error: {0}")]
    Database(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is already {status}")]
    InvalidRunState { run_id: String, status: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlexusError>;
