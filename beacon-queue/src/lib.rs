//! Durable offline queue.
//!
//! Every poll result lands in a single SQLite table together with a
//! `claimed` flag. A publish cycle claims every pending row at once, tries
//! to forward them and then either deletes or releases exactly the rows it
//! claimed, which gives at-least-once delivery across restarts and uplink
//! outages.
//!
//! The connection is synchronous; all operations run on the blocking
//! thread pool so they never stall the runtime.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use beacon_util::fs::ensure_parent;

mod record;
pub use record::QueuedRecord;
use record::{decode_timestamp, encode_timestamp};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    address TEXT NOT NULL,
    response TEXT NOT NULL,
    method TEXT NOT NULL,
    claimed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS messages_claimed ON messages (claimed);
CREATE INDEX IF NOT EXISTS messages_timestamp ON messages (timestamp);
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("queue connection lock poisoned")]
    Poisoned,
}

/// Which rows [`Queue::clear`] removes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearScope {
    /// Every row, pending or claimed
    All,
    /// Only rows claimed by a publish cycle, pending rows are kept
    ClaimedOnly,
}

/// Handle to the offline queue
///
/// Cloning is cheap, all clones share the same connection.
#[derive(Clone, Debug)]
pub struct Queue {
    conn: Arc<Mutex<Connection>>,
}

impl Queue {
    /// Open the queue database at `path`, creating file and schema as needed
    ///
    /// Rows left claimed by a previous process are released so the next
    /// publish cycle picks them up again.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let path = path.into();
        run_blocking(move || {
            ensure_parent(&path)?;
            let conn = Connection::open(&path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update_and_check(None, "journal_mode", "wal", |row| {
                row.get::<_, String>(0)
            })?;
            Self::initialize(conn, Some(&path))
        })
        .await
    }

    /// Open a queue that lives in memory only
    pub fn open_in_memory() -> Result<Self, QueueError> {
        Self::initialize(Connection::open_in_memory()?, None)
    }

    fn initialize(conn: Connection, path: Option<&Path>) -> Result<Self, QueueError> {
        conn.execute_batch(SCHEMA)?;

        let released = conn.execute("UPDATE messages SET claimed = 0 WHERE claimed = 1", [])?;
        if released > 0 {
            info!(released, "released records claimed by a previous run");
        }
        if let Some(path) = path {
            debug!("queue ready at {}", path.display());
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, T>(&self, f: F) -> Result<T, QueueError>
    where
        F: FnOnce(&mut Connection) -> Result<T, QueueError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        run_blocking(move || {
            let mut conn = conn.lock().map_err(|_| QueueError::Poisoned)?;
            f(&mut conn)
        })
        .await
    }

    /// Persist poll results as pending records
    ///
    /// All records are written in one transaction, either every record is
    /// stored or the error is returned.
    pub async fn append(
        &self,
        records: Vec<Value>,
        address: &str,
        method: &str,
    ) -> Result<usize, QueueError> {
        self.append_at(records, address, method, Utc::now()).await
    }

    /// Like [`Queue::append`] with an explicit capture timestamp
    #[instrument(skip_all, fields(records = records.len(), address = %address, method = %method), err)]
    pub async fn append_at(
        &self,
        records: Vec<Value>,
        address: &str,
        method: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let address = address.to_owned();
        let method = method.to_owned();
        let timestamp = encode_timestamp(&timestamp);
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (timestamp, address, response, method, claimed)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                )?;
                for record in &records {
                    let response = serde_json::to_string(record)?;
                    stmt.execute(params![timestamp, address, response, method])?;
                }
            }
            tx.commit()?;
            Ok(records.len())
        })
        .await
    }

    /// Mark every pending record as claimed and return them in insertion order
    ///
    /// Only one publish cycle may hold a claim at a time; callers are
    /// expected to follow up with [`Queue::delete_claimed`] or
    /// [`Queue::release_claimed`] for the ids of the returned records.
    #[instrument(skip_all, err)]
    pub async fn claim_pending(&self) -> Result<Vec<QueuedRecord>, QueueError> {
        let records: Vec<QueuedRecord> = self
            .run(|conn| {
                let tx = conn.transaction()?;
                let rows = {
                    let mut stmt = tx.prepare(
                        "SELECT id, timestamp, address, response, method
                         FROM messages WHERE claimed = 0 ORDER BY id",
                    )?;
                    stmt.query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?
                };
                tx.execute("UPDATE messages SET claimed = 1 WHERE claimed = 0", [])?;
                tx.commit()?;

                rows.into_iter()
                    .map(|(id, timestamp, address, response, method)| {
                        Ok(QueuedRecord {
                            id,
                            timestamp: decode_timestamp(&timestamp)?,
                            address,
                            response,
                            method,
                        })
                    })
                    .collect()
            })
            .await?;
        debug!(claimed = records.len(), "claimed pending records");
        Ok(records)
    }

    /// Return the given claimed records to the pending set
    ///
    /// Rows claimed by anyone else, or already gone, are left alone.
    #[instrument(skip_all, fields(records = ids.len()), err)]
    pub async fn release_claimed(&self, ids: &[i64]) -> Result<usize, QueueError> {
        self.for_each_id("UPDATE messages SET claimed = 0 WHERE id = ?1 AND claimed = 1", ids)
            .await
    }

    /// Permanently remove the given claimed records
    #[instrument(skip_all, fields(records = ids.len()), err)]
    pub async fn delete_claimed(&self, ids: &[i64]) -> Result<usize, QueueError> {
        self.for_each_id("DELETE FROM messages WHERE id = ?1 AND claimed = 1", ids)
            .await
    }

    async fn for_each_id(&self, sql: &'static str, ids: &[i64]) -> Result<usize, QueueError> {
        let ids = ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt = tx.prepare(sql)?;
                for id in &ids {
                    changed += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }

    /// Drop the `trim_batch_size` oldest records once the queue holds more
    /// than `excess_threshold` of them
    ///
    /// Returns the number of removed records, zero when the queue is within
    /// bounds.
    #[instrument(skip(self), err)]
    pub async fn trim(
        &self,
        excess_threshold: usize,
        trim_batch_size: usize,
    ) -> Result<usize, QueueError> {
        self.run(move |conn| {
            let count = count(conn, "SELECT COUNT(*) FROM messages")?;
            debug!(count, "offline records");
            if count <= excess_threshold {
                return Ok(0);
            }

            info!(
                "offline records ({count}) exceeded maximum of {excess_threshold}, trimming {trim_batch_size}"
            );
            let removed = conn.execute(
                "DELETE FROM messages WHERE id IN (
                    SELECT id FROM messages ORDER BY timestamp ASC, id ASC LIMIT ?1
                )",
                params![trim_batch_size as i64],
            )?;
            conn.execute_batch("VACUUM")?;
            Ok(removed)
        })
        .await
    }

    /// Administrative bulk delete, compacting the database afterwards
    #[instrument(skip(self), err)]
    pub async fn clear(&self, scope: ClearScope) -> Result<usize, QueueError> {
        self.run(move |conn| {
            let removed = match scope {
                ClearScope::All => conn.execute("DELETE FROM messages", [])?,
                ClearScope::ClaimedOnly => {
                    conn.execute("DELETE FROM messages WHERE claimed = 1", [])?
                }
            };
            conn.execute_batch("VACUUM")?;
            info!(removed, "cleared offline records");
            Ok(removed)
        })
        .await
    }

    /// Total number of stored records
    pub async fn len(&self) -> Result<usize, QueueError> {
        self.run(|conn| count(conn, "SELECT COUNT(*) FROM messages"))
            .await
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        self.len().await.map(|len| len == 0)
    }

    /// Number of records not claimed by a publish cycle
    pub async fn pending_len(&self) -> Result<usize, QueueError> {
        self.run(|conn| count(conn, "SELECT COUNT(*) FROM messages WHERE claimed = 0"))
            .await
    }
}

fn count(conn: &Connection, sql: &str) -> Result<usize, QueueError> {
    let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(count as usize)
}

async fn run_blocking<F, T>(f: F) -> Result<T, QueueError>
where
    F: FnOnce() -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.spawn_blocking(f).await.map_err(io::Error::from)?,
        Err(_) => f(),
    }
}
