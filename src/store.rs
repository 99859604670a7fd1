//! Append-only SQLite store of (input, output) pairs.
//!
//! Every operation opens its own connection and closes it before returning;
//! no handle outlives a call. Concurrent writers from separate processes are
//! serialized by SQLite's file lock, with a busy timeout instead of failing
//! fast.

use crate::{error::Result, types::ConversationRecord, RelayError};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS conversation (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    input TEXT,
    output TEXT
)";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the conversation store at a filesystem path.
///
/// Cheap to clone; holds only the path.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    path: PathBuf,
}

impl ConversationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::Persistence(format!("create dir {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(&self.path).map_err(|e| {
            RelayError::Persistence(format!("open {}: {e}", self.path.display()))
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Create the `conversation` table if it does not exist. Safe to repeat.
    pub fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(CREATE_TABLE)
            .map_err(|e| RelayError::Persistence(format!("schema: {e}")))?;
        info!(path = %self.path.display(), "conversation schema ready");
        Ok(())
    }

    /// Insert a new row and return its id. Never updates an existing row.
    pub fn append(&self, input: &str, output: &str) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO conversation (input, output) VALUES (?1, ?2)",
            params![input, output],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, "conversation appended");
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<Option<ConversationRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                "SELECT id, input, output FROM conversation WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ConversationRecord {
                        id: row.get(0)?,
                        input: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        output: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Every row, in id order.
    pub fn all(&self) -> Result<Vec<ConversationRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT id, input, output FROM conversation ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConversationRecord {
                    id: row.get(0)?,
                    input: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    output: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.connect()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM conversation", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Write every row to `destination` as a JSON list of `[id, input, output]`.
    pub fn dump_all(&self, destination: impl AsRef<Path>) -> Result<usize> {
        let destination = destination.as_ref();
        let rows = self.all()?;
        let payload: Vec<_> = rows
            .iter()
            .map(|r| json!([r.id, r.input, r.output]))
            .collect();
        let text = serde_json::to_string(&payload)?;
        std::fs::write(destination, text).map_err(|e| {
            RelayError::Persistence(format!("write {}: {e}", destination.display()))
        })?;
        info!(rows = rows.len(), path = %destination.display(), "conversation store dumped");
        Ok(rows.len())
    }
}
