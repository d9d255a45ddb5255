//! Persistence layer: one pooled SQLite connection shared by the request
//! handlers, the outbox worker pool, and the scheduler jobs.

pub mod audit;
pub mod events;
pub mod locks;
pub mod mapping;
pub mod outbox;
pub mod tasks;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Storage handle for the relay.
///
/// Every coordination primitive in the system bottoms out here: the outbox
/// batch claim and the advisory job locks both run as exclusive transactions
/// on this connection, which is what makes a claimed row or a held lock
/// invisible to every other worker.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the store at `path` and prepare it for a worker
    /// pool: WAL journaling with relaxed syncs, enforced foreign keys, and a
    /// busy timeout sized for outbox tick contention.
    ///
    /// Advisory job locks left behind by a previous process are cleared;
    /// nothing else survives a restart as "held".
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open database at {:?}", path.as_ref()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )
        .context("failed to configure database connection")?;

        let db = Self::bootstrap(conn)?;
        db.clear_job_locks()
            .context("failed to clear stale job locks")?;
        Ok(db)
    }

    /// In-memory store for tests: same schema, no WAL, no lock carry-over to
    /// worry about.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::bootstrap(conn)
    }

    /// Run migrations on a configured connection and wrap it in the handle.
    fn bootstrap(mut conn: Connection) -> Result<Self> {
        embedded::migrations::runner()
            .run(&mut conn)
            .context("schema migration failed")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a read or single-statement write against the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Run a multi-statement transaction against the connection. The outbox
    /// claim and the producer's task-plus-intents commit go through here.
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock().unwrap();
        f(&mut conn)
    }
}

/// Current wall-clock time in unix milliseconds, the timestamp unit used
/// throughout the store.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// UTC day stamp (YYYY-MM-DD) for a millisecond timestamp; the nudge
/// idempotency key is scoped by this.
pub fn day_stamp(ts_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts_ms)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}
