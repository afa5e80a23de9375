use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::auth::PayloadEncryption;
use crate::error::{DbError, DbResult};

mod queue;

pub use queue::{EnqueueOutcome, NewTask, QueuedTask};

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation; the caller still returns Err.
pub(crate) fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check the data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check the data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

/// Run one `ADD COLUMN` migration step. A column left behind by an
/// interrupted earlier run is fine; any other failure aborts the migration.
fn add_column(conn: &Connection, sql: &str) -> DbResult<()> {
    match conn.execute(sql, []) {
        Ok(_) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => {
            warn!("[DB] Column already present, skipping: {}", sql);
            Ok(())
        }
        Err(e) => {
            log_io_error_if_any("migration", &e);
            error!("[DB] Migration step failed: {}: {}", sql, e);
            Err(e.into())
        }
    }
}

/// Convert store errors into messages the UI can show as-is.
pub fn user_message(e: &DbError) -> String {
    use rusqlite::ffi::ErrorCode;
    match e {
        DbError::Sqlite(rusqlite::Error::SqliteFailure(ffi_err, _)) => match ffi_err.code {
            ErrorCode::DiskFull => "Data sync unavailable (Disk Full?)".to_string(),
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                "Data sync unavailable (Permission denied?)".to_string()
            }
            ErrorCode::SystemIoFailure => "Data sync unavailable (I/O error?)".to_string(),
            _ => format!("Local storage error: {}", e),
        },
        other => format!("Local storage error: {}", other),
    }
}

/// Persisted form of the timer singleton (`timer_state`, id = 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerRow {
    /// "stopped" | "running" | "paused"
    pub state: String,
    pub accumulated_seconds: u64,
    pub session_started_at: Option<i64>,
    pub day_start: i64,
    pub restored_from_running: bool,
    /// Session seconds measured on the monotonic clock at `saved_at`.
    pub session_elapsed_at_save: u64,
    /// Wall time of the write (heartbeat).
    pub saved_at: i64,
}

/// Embedded transactional store: `timer_state`, `sync_queue`, `app_meta`.
pub struct Database {
    pub(crate) conn: Mutex<Connection>,
    pub(crate) encryption: PayloadEncryption,
    install_id: String,
}

impl Database {
    /// Lock the connection, mapping a poisoned mutex to an error.
    fn lock_conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    pub fn new(db_path: &Path) -> DbResult<Self> {
        let conn = Connection::open(db_path)?;

        // Integrity check on startup: detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| match e.sqlite_error_code() {
                Some(rusqlite::ErrorCode::NotADatabase) | Some(rusqlite::ErrorCode::DatabaseCorrupt) => {
                    DbError::Corrupted(e.to_string())
                }
                _ => DbError::Sqlite(e),
            })?;
        if !integrity.eq_ignore_ascii_case("ok") {
            return Err(DbError::Corrupted(integrity));
        }

        if let Err(e) = conn.pragma_update(None, "journal_mode", "WAL") {
            warn!(
                "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                e
            );
        }
        // Safe with WAL; fewer fsyncs during sync bursts
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        // Writers from the sync thread and the UI thread wait instead of failing fast
        let _ = conn.busy_timeout(std::time::Duration::from_secs(5));

        let encryption =
            PayloadEncryption::new(db_path.parent()).map_err(DbError::Encryption)?;

        let mut db = Self {
            conn: Mutex::new(conn),
            encryption,
            install_id: String::new(),
        };
        db.run_migrations()?;
        db.install_id = db.load_or_create_install_id()?;
        Ok(db)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    /// Versioned migrations using the SQLite user_version pragma.
    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS timer_state (
                    id INTEGER PRIMARY KEY CHECK (id = 0),
                    state TEXT NOT NULL,
                    accumulated_seconds INTEGER NOT NULL DEFAULT 0,
                    session_started_at INTEGER,
                    day_start INTEGER NOT NULL,
                    restored_from_running INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS sync_queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    operation TEXT NOT NULL,
                    entry_key TEXT NOT NULL,
                    dedup_key TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    priority INTEGER NOT NULL DEFAULT 1,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    next_retry_at INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    last_attempt_at INTEGER,
                    error_message TEXT,
                    idempotency_key TEXT
                );
                CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT);
                CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status, next_retry_at);
                CREATE INDEX IF NOT EXISTS idx_sync_queue_dedup ON sync_queue(dedup_key, status);",
            )?;
        }

        // Migration 2: heartbeat for crash recovery, remote-confirmation marker
        if current < 2 {
            add_column(
                &conn,
                "ALTER TABLE timer_state ADD COLUMN session_elapsed_at_save INTEGER NOT NULL DEFAULT 0",
            )?;
            add_column(
                &conn,
                "ALTER TABLE timer_state ADD COLUMN saved_at INTEGER NOT NULL DEFAULT 0",
            )?;
            add_column(
                &conn,
                "ALTER TABLE sync_queue ADD COLUMN remote_confirmed_at INTEGER",
            )?;
            add_column(&conn, "ALTER TABLE sync_queue ADD COLUMN remote_entry_id TEXT")?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_entry ON sync_queue(entry_key, status)",
                [],
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Write the timer singleton in one IMMEDIATE transaction.
    pub fn save_timer_state(&self, row: &TimerRow) -> DbResult<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| {
                log_io_error_if_any("save_timer_state begin", &e);
                e
            })?;

        tx.execute(
            "INSERT INTO timer_state (id, state, accumulated_seconds, session_started_at, day_start,
                                      restored_from_running, session_elapsed_at_save, saved_at)
             VALUES (0, ?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                state = ?1,
                accumulated_seconds = ?2,
                session_started_at = ?3,
                day_start = ?4,
                restored_from_running = ?5,
                session_elapsed_at_save = ?6,
                saved_at = ?7",
            params![
                row.state,
                to_sql_secs(row.accumulated_seconds),
                row.session_started_at,
                row.day_start,
                row.restored_from_running,
                to_sql_secs(row.session_elapsed_at_save),
                row.saved_at,
            ],
        )
        .map_err(|e| {
            log_io_error_if_any("save_timer_state", &e);
            error!("[DB] Failed to save timer state: {}. Rolling back.", e);
            e
        })?;

        tx.commit().map_err(|e| {
            log_io_error_if_any("save_timer_state commit", &e);
            error!("[DB] Failed to commit timer state: {}", e);
            e
        })?;
        Ok(())
    }

    pub fn load_timer_state(&self) -> DbResult<Option<TimerRow>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT state, accumulated_seconds, session_started_at, day_start,
                        restored_from_running, session_elapsed_at_save, saved_at
                 FROM timer_state WHERE id = 0",
                [],
                |row| {
                    Ok(TimerRow {
                        state: row.get(0)?,
                        accumulated_seconds: from_sql_secs(row.get(1)?),
                        session_started_at: row.get(2)?,
                        day_start: row.get(3)?,
                        restored_from_running: row.get(4)?,
                        session_elapsed_at_save: from_sql_secs(row.get(5)?),
                        saved_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_app_meta(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM app_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_app_meta(&self, key: &str, value: &str) -> DbResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    /// Per-installation id used to make idempotency keys globally unique.
    pub fn install_id(&self) -> &str {
        &self.install_id
    }

    fn load_or_create_install_id(&self) -> DbResult<String> {
        if let Some(id) = self.get_app_meta(meta::INSTALL_ID)? {
            if !id.is_empty() {
                return Ok(id);
            }
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set_app_meta(meta::INSTALL_ID, &id)?;
        info!("[DB] Generated install id {}", id);
        Ok(id)
    }

    /// Server id for a client-side entry key, once the create call confirmed it.
    pub fn entry_server_id(&self, entry_key: &str) -> DbResult<Option<String>> {
        self.get_app_meta(&meta::entry_mapping(entry_key))
    }

    pub fn meta_i64(&self, key: &str) -> DbResult<Option<i64>> {
        Ok(self
            .get_app_meta(key)?
            .and_then(|v| v.trim().parse::<i64>().ok()))
    }
}

/// Keys used in `app_meta`.
pub mod meta {
    pub const LAST_SYNC_AT: &str = "last_sync_at";
    pub const INSTALL_ID: &str = "install_id";
    pub const DROPPED_COUNT: &str = "dropped_count";
    pub const LAST_DROP_REASON: &str = "last_drop_reason";
    pub const ACTIVE_ENTRY_KEY: &str = "active_entry_key";

    pub fn entry_mapping(entry_key: &str) -> String {
        format!("entry:{}", entry_key)
    }
}

/// SQLite integers are i64; seconds are stored clamped.
pub(crate) fn to_sql_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_secs(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
