/*!
 * SQLite connection handle.
 *
 * rusqlite is synchronous. Every async caller goes through `execute_async`
 * or `transaction_async`, which run on tokio's blocking pool and serialize
 * on one shared connection.
 */

use anyhow::{Context, Result, anyhow};
use log::{debug, info};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::schema;

const DB_FILENAME: &str = "threadrelay.db";
const DATA_DIRNAME: &str = "threadrelay";
const IN_MEMORY: &str = ":memory:";

/// How long a writer waits on a file lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the pipeline database. Clones share the connection.
#[derive(Clone)]
pub struct DatabaseConnection {
    db_path: PathBuf,
    connection: Arc<Mutex<Connection>>,
}

impl DatabaseConnection {
    /// Open `threadrelay.db` in the platform data directory
    pub fn new_default() -> Result<Self> {
        Self::new(Self::default_database_path()?)
    }

    /// Open or create the database file at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Cannot create database directory {:?}", parent))?;
        }

        info!("Opening pipeline database {:?}", db_path);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Cannot open database {:?}", db_path))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::wrap(conn, db_path)
    }

    /// Private database that lives as long as the handle
    pub fn new_in_memory() -> Result<Self> {
        debug!("Opening in-memory pipeline database");
        let conn = Connection::open_in_memory().context("Cannot open in-memory database")?;
        Self::wrap(conn, PathBuf::from(IN_MEMORY))
    }

    fn wrap(conn: Connection, db_path: PathBuf) -> Result<Self> {
        schema::initialize_schema(&conn)?;
        Ok(Self {
            db_path,
            connection: Arc::new(Mutex::new(conn)),
        })
    }

    /// `<data dir>/threadrelay/threadrelay.db`
    pub fn default_database_path() -> Result<PathBuf> {
        dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
            .map(|base| base.join(DATA_DIRNAME).join(DB_FILENAME))
            .ok_or_else(|| anyhow!("No data directory available for the database"))
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.as_os_str() == IN_MEMORY
    }

    fn lock(connection: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        connection
            .lock()
            .map_err(|e| anyhow!("Database connection lock poisoned: {}", e))
    }

    /// Run `f` against the connection on the blocking pool
    pub async fn execute_async<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Self::lock(&connection)?;
            f(&conn)
        })
        .await
        .context("Database worker panicked")?
    }

    /// Run `f` inside one transaction; an error rolls everything back
    pub async fn transaction_async<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::lock(&connection)?;
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
        .context("Database transaction worker panicked")?
    }
}
