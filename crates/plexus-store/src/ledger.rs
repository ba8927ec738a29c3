use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use plexus_core::error::{PlexusError, Result};
use plexus_core::types::{LatencyStats, LedgerMetrics, NodeRecord, RunRecord, RunReport, Status};

/// Optional fields applied alongside a node status change. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub output_artifact: Option<String>,
    pub error: Option<String>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
    pub cache_key: Option<String>,
}

impl NodeUpdate {
    pub fn started(start_ms: i64) -> Self {
        Self {
            start_ms: Some(start_ms),
            ..Self::default()
        }
    }

    pub fn succeeded(end_ms: i64, artifact: String) -> Self {
        Self {
            end_ms: Some(end_ms),
            output_artifact: Some(artifact),
            ..Self::default()
        }
    }

    /// Record the key under which this node's output may be reused.
    pub fn with_cache_key(mut self, cache_key: String) -> Self {
        self.cache_key = Some(cache_key);
        self
    }

    pub fn failed(end_ms: i64, error: String) -> Self {
        Self {
            end_ms: Some(end_ms),
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Durable run and node ledger backed by SQLite.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open or create the ledger database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PlexusError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        Self::init(conn, path)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, Path::new(":memory:"))
    }

    fn init(conn: Connection, path: &Path) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                plan_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                input_query TEXT NOT NULL,
                result TEXT,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS nodes (
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                output_artifact TEXT,
                error TEXT,
                idempotency_key TEXT NOT NULL,
                start_ms INTEGER,
                end_ms INTEGER,
                cache_key TEXT,
                PRIMARY KEY (run_id, node_id)
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_cache_key
                ON nodes(cache_key, status);",
        )
        .map_err(db_err)?;

        debug!(path = %path.display(), "Ledger opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PlexusError::Database(e.to_string()))
    }

    // ── Runs ─────────────────────────────────────────────────────

    /// Record a new run in `pending`.
    pub fn create_run(&self, run_id: &str, plan_id: &str, input_query: &Value) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO runs (run_id, plan_id, status, created_at, input_query)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                plan_id,
                Status::Pending.as_str(),
                Utc::now().to_rfc3339(),
                input_query.to_string(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Set a run's status. `running` stamps `started_at`; a terminal status
    /// stamps `finished_at`. Result and error are only written when given.
    pub fn update_run_status(
        &self,
        run_id: &str,
        status: Status,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let started = (status == Status::Running).then(|| now.clone());
        let finished = status.is_terminal().then_some(now);

        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET
                    status = ?2,
                    started_at = COALESCE(started_at, ?3),
                    finished_at = COALESCE(?4, finished_at),
                    result = COALESCE(?5, result),
                    error = COALESCE(?6, error)
                 WHERE run_id = ?1",
                params![
                    run_id,
                    status.as_str(),
                    started,
                    finished,
                    result.map(|r| r.to_string()),
                    error,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(PlexusError::RunNotFound(run_id.to_string()));
        }
        Ok(())
    }

    /// Move a run from `pending` to `running`. Fails without side effects
    /// when the run is missing or already past `pending`.
    pub fn start_run(&self, run_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE runs SET status = ?2, started_at = ?3
                 WHERE run_id = ?1 AND status = ?4",
                params![
                    run_id,
                    Status::Running.as_str(),
                    Utc::now().to_rfc3339(),
                    Status::Pending.as_str(),
                ],
            )
            .map_err(db_err)?;
        if changed == 1 {
            return Ok(());
        }

        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        match status {
            None => Err(PlexusError::RunNotFound(run_id.to_string())),
            Some(status) => Err(PlexusError::InvalidRunState {
                run_id: run_id.to_string(),
                status,
            }),
        }
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, plan_id, status, created_at, started_at, finished_at,
                    input_query, result, error
             FROM runs WHERE run_id = ?1",
            params![run_id],
            run_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, plan_id, status, created_at, started_at, finished_at,
                        input_query, result, error
                 FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], run_from_row)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    // ── Nodes ────────────────────────────────────────────────────

    /// Record a node in `pending`. Each node is created once per run.
    pub fn create_node(
        &self,
        run_id: &str,
        node_id: &str,
        node_type: &str,
        idempotency_key: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO nodes (run_id, node_id, node_type, status, idempotency_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                node_id,
                node_type,
                Status::Pending.as_str(),
                idempotency_key,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Set a node's status. Timestamps already recorded are never replaced.
    pub fn update_node_status(
        &self,
        run_id: &str,
        node_id: &str,
        status: Status,
        update: NodeUpdate,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE nodes SET
                    status = ?3,
                    output_artifact = COALESCE(?4, output_artifact),
                    error = COALESCE(?5, error),
                    start_ms = COALESCE(start_ms, ?6),
                    end_ms = COALESCE(end_ms, ?7),
                    cache_key = COALESCE(?8, cache_key)
                 WHERE run_id = ?1 AND node_id = ?2",
                params![
                    run_id,
                    node_id,
                    status.as_str(),
                    update.output_artifact,
                    update.error,
                    update.start_ms,
                    update.end_ms,
                    update.cache_key,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(PlexusError::Database(format!(
                "No node record for {run_id}/{node_id}"
            )));
        }
        Ok(())
    }

    pub fn get_node(&self, run_id: &str, node_id: &str) -> Result<Option<NodeRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, node_id, node_type, status, output_artifact, error,
                    idempotency_key, start_ms, end_ms
             FROM nodes WHERE run_id = ?1 AND node_id = ?2",
            params![run_id, node_id],
            node_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    /// Nodes of a run in creation order.
    pub fn list_nodes(&self, run_id: &str) -> Result<Vec<NodeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, node_id, node_type, status, output_artifact, error,
                        idempotency_key, start_ms, end_ms
                 FROM nodes WHERE run_id = ?1 ORDER BY rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![run_id], node_from_row)
            .map_err(db_err)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)
    }

    /// Latest successful node recorded under this cache key, optionally
    /// limited to a single run.
    pub fn find_cached(
        &self,
        cache_key: &str,
        run_id: Option<&str>,
    ) -> Result<Option<NodeRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT run_id, node_id, node_type, status, output_artifact, error,
                    idempotency_key, start_ms, end_ms
             FROM nodes
             WHERE cache_key = ?1 AND status = ?2
               AND output_artifact IS NOT NULL
               AND (?3 IS NULL OR run_id = ?3)
             ORDER BY end_ms DESC, rowid DESC LIMIT 1",
            params![cache_key, Status::Success.as_str(), run_id],
            node_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    // ── Aggregates ───────────────────────────────────────────────

    /// Run count, node counts by status, and latency over successful nodes.
    pub fn metrics(&self) -> Result<LedgerMetrics> {
        let conn = self.lock()?;

        let runs_total: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .map_err(db_err)?;

        let mut nodes_by_status: BTreeMap<String, u64> = Status::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM nodes GROUP BY status")
            .map_err(db_err)?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?;
        for entry in counts {
            let (status, count) = entry.map_err(db_err)?;
            nodes_by_status.insert(status, count as u64);
        }

        let mut stmt = conn
            .prepare(
                "SELECT end_ms - start_ms FROM nodes
                 WHERE status = ?1 AND start_ms IS NOT NULL AND end_ms IS NOT NULL",
            )
            .map_err(db_err)?;
        let samples = stmt
            .query_map(params![Status::Success.as_str()], |row| row.get::<_, i64>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(LedgerMetrics {
            runs_total: runs_total as u64,
            nodes_by_status,
            latency_ms: LatencyStats::from_samples(samples),
        })
    }

    /// Summary of one run, rebuilt entirely from stored rows.
    pub fn report(&self, run_id: &str) -> Result<RunReport> {
        let run = self
            .get_run(run_id)?
            .ok_or_else(|| PlexusError::RunNotFound(run_id.to_string()))?;
        let nodes = self.list_nodes(run_id)?;

        Ok(RunReport {
            run_id: run.run_id,
            plan_id: run.plan_id,
            status: run.status,
            result: run.result,
            error: run.error,
            artifacts: nodes
                .iter()
                .filter_map(|n| n.output_artifact.clone())
                .collect(),
            node_count: nodes.len(),
            success_count: nodes.iter().filter(|n| n.status == Status::Success).count(),
            total_duration_ms: nodes.iter().filter_map(|n| n.duration_ms()).sum(),
        })
    }
}

fn db_err(e: rusqlite::Error) -> PlexusError {
    PlexusError::Database(e.to_string())
}

fn status_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Status> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: PlexusError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    idx,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    })
    .transpose()
}

fn json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        plan_id: row.get(1)?,
        status: status_col(row, 2)?,
        created_at: time_col(row, 3)?.unwrap_or_else(Utc::now),
        started_at: time_col(row, 4)?,
        finished_at: time_col(row, 5)?,
        input_query: json_col(row, 6)?.unwrap_or(Value::Null),
        result: json_col(row, 7)?,
        error: row.get(8)?,
    })
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        run_id: row.get(0)?,
        node_id: row.get(1)?,
        node_type: row.get(2)?,
        status: status_col(row, 3)?,
        output_artifact: row.get(4)?,
        error: row.get(5)?,
        idempotency_key: row.get(6)?,
        start_ms: row.get(7)?,
        end_ms: row.get(8)?,
    })
}
