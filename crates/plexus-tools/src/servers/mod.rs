pub mod fs;
pub mod table;
pub mod tracking;

pub use fs::FsServer;
pub use table::TableServer;
pub use tracking::TrackingServer;

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use plexus_core::error::{PlexusError, Result};

/// Deserialize tool arguments into a typed input struct.
pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, args: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(args)).map_err(|e| PlexusError::ToolArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn not_found(server: &str, tool: &str) -> PlexusError {
    PlexusError::ToolNotFound {
        server: server.to_string(),
        tool: tool.to_string(),
    }
}

/// Resolve a tool-supplied path under `root`. The canonical result must stay
/// inside the canonical root, so absolute paths, `..` and symlinks cannot
/// reach files elsewhere.
pub(crate) fn resolve_path(tool: &str, root: &Path, path: &str) -> Result<PathBuf> {
    let failure = |message: String| PlexusError::ToolExecution {
        tool: tool.to_string(),
        message,
    };
    let root = root
        .canonicalize()
        .map_err(|e| failure(format!("Data directory {} unavailable: {e}", root.display())))?;
    let resolved = root
        .join(path)
        .canonicalize()
        .map_err(|_| failure(format!("File not found: {path}")))?;
    if !resolved.starts_with(&root) {
        return Err(failure(format!("Path escapes the data directory: {path}")));
    }
    Ok(resolved)
}
