use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Transaction};

use crate::error::StoreResult;
use crate::isolation::IsolationLevel;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to the service database. Cheap to clone; connections are opened
/// per operation.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Opens (creating if needed) the database file and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Self { path };
        let conn = db.connect()?;
        // journal_mode returns a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        init_schema(&conn)?;
        tracing::debug!(path = %db.path.display(), "database ready");
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> StoreResult<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        Ok(conn)
    }

    /// Starts a transaction on `conn` at `isolation`.
    pub fn begin<'c>(
        conn: &'c mut Connection,
        isolation: IsolationLevel,
    ) -> StoreResult<Transaction<'c>> {
        let behavior = isolation.transaction_behavior()?;
        Ok(conn.transaction_with_behavior(behavior)?)
    }

    /// Round trip used by the health endpoint.
    pub fn ping(&self) -> StoreResult<String> {
        let conn = self.connect()?;
        Ok(conn.query_row("SELECT CURRENT_TIMESTAMP", [], |row| row.get(0))?)
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            sign_in_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL REFERENCES users(id),
            label TEXT NOT NULL,
            done INTEGER NOT NULL DEFAULT 0,
            image_url TEXT,
            image_metadata TEXT,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_owner_created
            ON tasks(owner_id, created_at DESC);",
    )?;
    Ok(())
}
