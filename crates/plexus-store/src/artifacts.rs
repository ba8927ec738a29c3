//! Filesystem artifact store.
//!
//! Artifacts live at `<base>/<run_id>/<node_id>/<filename>.<ext>` and are
//! addressed as `artifact://<node_id>/<filename>.<ext>`, always relative to
//! a run. Writes overwrite in place; each write lands through a temp file and
//! a rename so readers never observe a partial file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use plexus_core::error::{PlexusError, Result};
use plexus_core::table::Table;
use plexus_core::types::{Payload, ARTIFACT_URI_PREFIX};

/// Default filename for a node's output.
pub const DEFAULT_FILENAME: &str = "output";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactFormat {
    /// Structured data.
    Json,
    /// Tabular data.
    Csv,
    /// Raster image.
    Png,
    /// Binary document.
    Pdf,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Json => "json",
            ArtifactFormat::Csv => "csv",
            ArtifactFormat::Png => "png",
            ArtifactFormat::Pdf => "pdf",
        }
    }

    /// Format chosen by payload shape. Tables holding nested cells are
    /// stored as their records object.
    pub fn for_payload(payload: &Payload) -> Self {
        match payload {
            Payload::Json(_) => ArtifactFormat::Json,
            Payload::Table(t) if t.is_flat() => ArtifactFormat::Csv,
            Payload::Table(_) => ArtifactFormat::Json,
            Payload::Binary(bytes) if bytes.starts_with(b"%PDF") => ArtifactFormat::Pdf,
            Payload::Binary(_) => ArtifactFormat::Png,
        }
    }
}

impl FromStr for ArtifactFormat {
    type Err = PlexusError;

    fn from_str(ext: &str) -> Result<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "json" => Ok(ArtifactFormat::Json),
            "csv" => Ok(ArtifactFormat::Csv),
            "png" => Ok(ArtifactFormat::Png),
            "pdf" => Ok(ArtifactFormat::Pdf),
            other => Err(PlexusError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Parsed `artifact://<node_id>/<filename>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUri {
    pub node_id: String,
    pub filename: String,
    pub format: ArtifactFormat,
}

impl ArtifactUri {
    pub fn new(node_id: &str, filename: &str, format: ArtifactFormat) -> Self {
        Self {
            node_id: node_id.to_string(),
            filename: filename.to_string(),
            format,
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || PlexusError::InvalidArtifactUri(uri.to_string());

        let rest = uri.strip_prefix(ARTIFACT_URI_PREFIX).ok_or_else(invalid)?;
        let (node_id, file) = rest.split_once('/').ok_or_else(invalid)?;
        let (filename, ext) = file.rsplit_once('.').ok_or_else(invalid)?;
        if !is_path_segment(node_id) || !is_path_segment(filename) {
            return Err(invalid());
        }

        Ok(Self {
            node_id: node_id.to_string(),
            filename: filename.to_string(),
            format: ext.parse()?,
        })
    }

    fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.node_id).join(format!("{}.{}", self.filename, self.format))
    }
}

impl fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}/{}.{}",
            ARTIFACT_URI_PREFIX, self.node_id, self.filename, self.format
        )
    }
}

fn is_path_segment(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
}

/// Run-scoped artifact storage rooted at a base directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        if !is_path_segment(run_id) {
            return Err(PlexusError::InvalidArtifactUri(format!(
                "invalid run id '{run_id}'"
            )));
        }
        Ok(self.base.join(run_id))
    }

    /// Write a node's output under the default filename.
    pub fn write(
        &self,
        run_id: &str,
        node_id: &str,
        data: &Payload,
        format: ArtifactFormat,
    ) -> Result<String> {
        self.write_named(run_id, node_id, DEFAULT_FILENAME, data, format)
    }

    pub fn write_named(
        &self,
        run_id: &str,
        node_id: &str,
        filename: &str,
        data: &Payload,
        format: ArtifactFormat,
    ) -> Result<String> {
        if !is_path_segment(node_id) || !is_path_segment(filename) {
            return Err(PlexusError::InvalidArtifactUri(format!(
                "{node_id}/{filename}.{format}"
            )));
        }
        let uri = ArtifactUri::new(node_id, filename, format);
        let bytes = encode(data, format)?;
        let path = self.run_dir(run_id)?.join(uri.relative_path());
        write_atomic(&path, &bytes)?;

        debug!(run_id, uri = %uri, bytes = bytes.len(), "Artifact written");
        Ok(uri.to_string())
    }

    /// Read an artifact, resolved under the given run's namespace.
    pub fn read(&self, uri: &str, run_id: &str) -> Result<Payload> {
        let parsed = ArtifactUri::parse(uri)?;
        let path = self.run_dir(run_id)?.join(parsed.relative_path());
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PlexusError::ArtifactNotFound(format!("{run_id}:{uri}")))
            }
            Err(e) => return Err(e.into()),
        };
        decode(bytes, parsed.format)
    }

    /// Copy an artifact from one run's namespace into another node's
    /// namespace, keeping its filename and format.
    pub fn copy_into(
        &self,
        source_run: &str,
        source_uri: &str,
        target_run: &str,
        target_node: &str,
    ) -> Result<String> {
        let src = ArtifactUri::parse(source_uri)?;
        let dst = ArtifactUri::new(target_node, &src.filename, src.format);
        let src_path = self.run_dir(source_run)?.join(src.relative_path());
        let bytes = std::fs::read(&src_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PlexusError::ArtifactNotFound(format!("{source_run}:{source_uri}"))
            }
            _ => e.into(),
        })?;
        write_atomic(&self.run_dir(target_run)?.join(dst.relative_path()), &bytes)?;
        Ok(dst.to_string())
    }

    /// All artifact URIs written for a run, sorted.
    pub fn list(&self, run_id: &str) -> Result<Vec<String>> {
        let run_dir = self.run_dir(run_id)?;
        let mut uris = Vec::new();
        let nodes = match std::fs::read_dir(&run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(uris),
            Err(e) => return Err(e.into()),
        };

        for node in nodes {
            let node = node?;
            if !node.file_type()?.is_dir() {
                continue;
            }
            let node_id = node.file_name().to_string_lossy().to_string();
            for file in std::fs::read_dir(node.path())? {
                let name = file?.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let uri = format!("{ARTIFACT_URI_PREFIX}{node_id}/{name}");
                if ArtifactUri::parse(&uri).is_ok() {
                    uris.push(uri);
                }
            }
        }
        uris.sort();
        Ok(uris)
    }
}

fn encode(data: &Payload, format: ArtifactFormat) -> Result<Vec<u8>> {
    match (format, data) {
        (ArtifactFormat::Json, Payload::Json(v)) => Ok(serde_json::to_vec_pretty(v)?),
        (ArtifactFormat::Json, Payload::Table(t)) => Ok(serde_json::to_vec_pretty(&t.to_value())?),
        (ArtifactFormat::Csv, Payload::Table(t)) => csv_bytes(t),
        (ArtifactFormat::Csv, Payload::Json(v)) => csv_bytes(&Table::from_value(v)?),
        (ArtifactFormat::Png | ArtifactFormat::Pdf, Payload::Binary(b)) => Ok(b.clone()),
        (format, data) => Err(PlexusError::UnsupportedFormat(format!(
            "cannot write {} payload as {}",
            data.kind_str(),
            format
        ))),
    }
}

fn csv_bytes(table: &Table) -> Result<Vec<u8>> {
    if !table.is_flat() {
        return Err(PlexusError::UnsupportedFormat(
            "csv cannot hold nested array or object cells".into(),
        ));
    }
    Ok(table.to_csv().into_bytes())
}

fn decode(bytes: Vec<u8>, format: ArtifactFormat) -> Result<Payload> {
    match format {
        ArtifactFormat::Json => Ok(Payload::Json(serde_json::from_slice(&bytes)?)),
        ArtifactFormat::Csv => {
            let text = String::from_utf8(bytes)
                .map_err(|e| PlexusError::UnsupportedFormat(format!("csv is not UTF-8: {e}")))?;
            Ok(Payload::Table(Table::from_csv(&text)?))
        }
        ArtifactFormat::Png | ArtifactFormat::Pdf => Ok(Payload::Binary(bytes)),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PlexusError::InvalidArtifactUri(path.display().to_string()))?;
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Deterministic content digest (hex SHA-256).
///
/// Structured data hashes its canonical sorted-key JSON, tables hash their
/// CSV text, binary hashes the raw bytes.
pub fn content_hash(data: &Payload) -> String {
    let mut hasher = Sha256::new();
    match data {
        Payload::Json(v) => hasher.update(canonical_json(v).as_bytes()),
        Payload::Table(t) => hasher.update(t.to_csv().as_bytes()),
        Payload::Binary(b) => hasher.update(b),
    }
    format!("{:x}", hasher.finalize())
}

/// Compact JSON with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&obj[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
