use rusqlite::Connection;
use std::path::Path;
use tokio::task;
use crate::error::{GraphMemError, Result};

/// Database connection wrapper
pub struct Db {
    path: std::path::PathBuf,
}

impl Db {
    /// Create a new database connection manager
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            path: db_path.as_ref().to_path_buf(),
        }
    }

    /// Open a new database connection with optimized pragmas
    pub fn open_connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| GraphMemError::StoreUnavailable(format!("open {}: {}", self.path.display(), e)))?;
        set_pragmas(&conn)?;
        Ok(conn)
    }

    /// Execute a closure with a database connection in a blocking task
    pub async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)
                .map_err(|e| GraphMemError::StoreUnavailable(format!("open {}: {}", path.display(), e)))?;
            set_pragmas(&conn)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| GraphMemError::StoreUnavailable(format!("blocking task failed: {}", e)))?
    }
}

/// WAL for concurrent readers during writes, NORMAL sync for speed,
/// foreign keys for referential integrity, busy timeout so concurrent
/// episode writers queue instead of failing immediately.
fn set_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA foreign_keys = ON; \
         PRAGMA temp_store = MEMORY; \
         PRAGMA cache_size = -65536; \
         PRAGMA busy_timeout = 5000;"
    )?;
    Ok(())
}

pub mod migrate;
