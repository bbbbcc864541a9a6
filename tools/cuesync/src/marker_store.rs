use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::errors::CuesyncError;
use crate::logging::append_run_log;
use crate::markers::MarkerSink;
use crate::runtime::ClockReading;
use crate::types::{FrameRecord, Marker};

const WRITE_QUEUE_DEPTH: usize = 4096;
const MAX_BATCH: usize = 256;

type StoreResult<T> = Result<T, CuesyncError>;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMarker {
    pub source: String,
    pub label: String,
    pub timestamp: ClockReading,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFrame {
    pub source: String,
    pub frame_index: u64,
    pub timestamp: ClockReading,
}

#[derive(Debug)]
enum WriteCmd {
    Marker {
        source: String,
        label: String,
        timestamp: f64,
    },
    Frame {
        source: String,
        frame_index: u64,
        timestamp: f64,
    },
    Session {
        session_id: String,
        fingerprint: String,
        seed: u64,
    },
    Flush {
        reply: oneshot::Sender<StoreResult<u64>>,
    },
}

/// SQLite-backed marker log shared by every process of a session.
///
/// Writes go through a bounded queue to a dedicated writer thread; callers never
/// wait on disk. `flush` waits until everything queued before it is committed.
pub struct SqliteMarkerStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
    dropped: AtomicU64,
}

impl Drop for SqliteMarkerStore {
    fn drop(&mut self) {
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl SqliteMarkerStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "marker_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CuesyncError::Database(e.to_string()))?;
            }
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| CuesyncError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(CuesyncError::Database(format!(
                    "marker database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(CuesyncError::Database(format!(
                    "marker database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn)?;

        let (write_tx, mut write_rx) = mpsc::channel::<WriteCmd>(WRITE_QUEUE_DEPTH);
        let writer_join = thread::spawn(move || {
            let mut committed: u64 = 0;
            while let Some(first) = write_rx.blocking_recv() {
                let mut batch = vec![first];
                while batch.len() < MAX_BATCH {
                    match write_rx.try_recv() {
                        Ok(cmd) => batch.push(cmd),
                        Err(_) => break,
                    }
                }
                let (result, replies) = write_batch(&mut write_conn, batch);
                match &result {
                    Ok(rows) => committed += rows,
                    Err(error) => append_run_log(
                        "error",
                        "marker_store.batch.failed",
                        json!({ "error": error.to_string() }),
                    ),
                }
                for reply in replies {
                    let _ = reply.send(match &result {
                        Ok(_) => Ok(committed),
                        Err(error) => Err(CuesyncError::Database(error.to_string())),
                    });
                }
            }
        });

        Ok(Self {
            write_tx: Some(write_tx),
            writer_join: Some(writer_join),
            db_path: path,
            dropped: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Rows refused because the writer queue was full or closed.
    pub fn dropped_rows(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, cmd: WriteCmd) -> StoreResult<()> {
        let tx = self
            .write_tx
            .as_ref()
            .ok_or_else(|| CuesyncError::Database("store is closed".to_string()))?;
        tx.try_send(cmd).map_err(|error| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match error {
                TrySendError::Full(_) => {
                    CuesyncError::Database("marker write queue is full".to_string())
                }
                TrySendError::Closed(_) => {
                    CuesyncError::Database("marker writer has stopped".to_string())
                }
            }
        })
    }

    pub fn append_marker(&self, source: &str, marker: &Marker) -> StoreResult<()> {
        self.enqueue(WriteCmd::Marker {
            source: source.to_string(),
            label: marker.label.clone(),
            timestamp: marker.timestamp.as_secs(),
        })
    }

    pub fn append_frame(&self, source: &str, frame: &FrameRecord) -> StoreResult<()> {
        self.enqueue(WriteCmd::Frame {
            source: source.to_string(),
            frame_index: frame.frame_index,
            timestamp: frame.timestamp.as_secs(),
        })
    }

    pub fn register_session(
        &self,
        session_id: &str,
        fingerprint: &str,
        seed: u64,
    ) -> StoreResult<()> {
        self.enqueue(WriteCmd::Session {
            session_id: session_id.to_string(),
            fingerprint: fingerprint.to_string(),
            seed,
        })
    }

    /// Block until every row queued so far is committed. Returns rows committed
    /// by this store since it was opened.
    pub fn flush(&self) -> StoreResult<u64> {
        let tx = self
            .write_tx
            .as_ref()
            .ok_or_else(|| CuesyncError::Database("store is closed".to_string()))?;
        let (reply, rx) = oneshot::channel();
        tx.blocking_send(WriteCmd::Flush { reply })
            .map_err(|_| CuesyncError::Database("marker writer has stopped".to_string()))?;
        rx.blocking_recv()
            .map_err(|_| CuesyncError::Database("marker writer dropped flush reply".to_string()))?
    }

    pub fn list_markers(&self, source: Option<&str>) -> StoreResult<Vec<StoredMarker>> {
        read_markers(&self.db_path, source)
    }

    pub fn session_fingerprint(&self, session_id: &str) -> StoreResult<Option<String>> {
        let conn = open_read_only(&self.db_path)?;
        conn.query_row(
            "SELECT fingerprint FROM sessions WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

impl MarkerSink for SqliteMarkerStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn record_marker(&self, source: &str, marker: &Marker) -> Result<(), CuesyncError> {
        self.append_marker(source, marker)
    }

    fn record_frame(&self, source: &str, frame: &FrameRecord) -> Result<(), CuesyncError> {
        self.append_frame(source, frame)
    }
}

/// Markers ordered by timestamp, ties broken by insertion order.
pub fn read_markers(path: &Path, source: Option<&str>) -> StoreResult<Vec<StoredMarker>> {
    let conn = open_read_only(path)?;
    let mut stmt = conn
        .prepare(
            "SELECT source, label, timestamp FROM markers
             WHERE (?1 IS NULL OR source = ?1)
             ORDER BY timestamp ASC, id ASC",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![source], |row| {
            Ok(StoredMarker {
                source: row.get(0)?,
                label: row.get(1)?,
                timestamp: ClockReading::from_secs(row.get(2)?),
            })
        })
        .map_err(db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
}

pub fn read_frames(path: &Path, source: Option<&str>) -> StoreResult<Vec<StoredFrame>> {
    let conn = open_read_only(path)?;
    let mut stmt = conn
        .prepare(
            "SELECT source, frame_index, timestamp FROM frames
             WHERE (?1 IS NULL OR source = ?1)
             ORDER BY source ASC, frame_index ASC, id ASC",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![source], |row| {
            let index: i64 = row.get(1)?;
            Ok(StoredFrame {
                source: row.get(0)?,
                frame_index: index.max(0) as u64,
                timestamp: ClockReading::from_secs(row.get(2)?),
            })
        })
        .map_err(db_err)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
}

fn open_read_only(path: &Path) -> StoreResult<Connection> {
    if !path.exists() {
        return Err(CuesyncError::Database(format!(
            "marker database not found: {}",
            path.display()
        )));
    }
    let conn =
        Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(3))
        .map_err(db_err)?;
    Ok(conn)
}

fn write_batch(
    conn: &mut Connection,
    batch: Vec<WriteCmd>,
) -> (StoreResult<u64>, Vec<oneshot::Sender<StoreResult<u64>>>) {
    let mut replies = Vec::new();
    let mut rows = Vec::with_capacity(batch.len());
    for cmd in batch {
        match cmd {
            WriteCmd::Flush { reply } => replies.push(reply),
            other => rows.push(other),
        }
    }
    if rows.is_empty() {
        return (Ok(0), replies);
    }
    let result = conn
        .transaction()
        .map_err(db_err)
        .and_then(|tx| insert_rows(&tx, &rows).and_then(|n| tx.commit().map(|_| n).map_err(db_err)));
    (result, replies)
}

fn insert_rows(tx: &Transaction<'_>, rows: &[WriteCmd]) -> StoreResult<u64> {
    let now = system_time_unix();
    let mut written = 0_u64;
    for row in rows {
        match row {
            WriteCmd::Marker {
                source,
                label,
                timestamp,
            } => {
                tx.execute(
                    "INSERT INTO markers(source, label, timestamp, written_at) VALUES (?1, ?2, ?3, ?4)",
                    params![source, label, timestamp, now],
                )
                .map_err(db_err)?;
            }
            WriteCmd::Frame {
                source,
                frame_index,
                timestamp,
            } => {
                tx.execute(
                    "INSERT INTO frames(source, frame_index, timestamp) VALUES (?1, ?2, ?3)",
                    params![source, *frame_index as i64, timestamp],
                )
                .map_err(db_err)?;
            }
            WriteCmd::Session {
                session_id,
                fingerprint,
                seed,
            } => {
                tx.execute(
                    "INSERT OR REPLACE INTO sessions(session_id, fingerprint, seed, started_at) VALUES (?1, ?2, ?3, ?4)",
                    params![session_id, fingerprint, *seed as i64, now],
                )
                .map_err(db_err)?;
            }
            WriteCmd::Flush { .. } => continue,
        }
        written += 1;
    }
    Ok(written)
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [
        (1_i64, include_str!("../migrations/0001_markers.sql")),
        (2_i64, include_str!("../migrations/0002_sessions.sql")),
    ];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let exists = tx
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        append_run_log(
            "info",
            "marker_store.migration.applying",
            json!({ "version": version }),
        );
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, system_time_unix()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        append_run_log(
            "info",
            "marker_store.migration.applied",
            json!({ "version": version }),
        );
    }

    Ok(())
}

fn system_time_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn db_err(error: rusqlite::Error) -> CuesyncError {
    CuesyncError::Database(error.to_string())
}
