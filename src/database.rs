use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

use crate::models::UncreditedSession;
use chrono::Utc;
use rusqlite::Error::InvalidParameterName;

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation: caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check app data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check app data directory is writable.",
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

/// Convert rusqlite errors to user-friendly messages.
/// Disk full / read-only errors surface as "Timer storage unavailable (Disk Full?)".
pub fn storage_error_to_user_message(e: &rusqlite::Error) -> String {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => "Timer storage unavailable (Disk Full?)".to_string(),
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                "Timer storage unavailable (Permission denied?)".to_string()
            }
            ErrorCode::SystemIoFailure => "Timer storage unavailable (I/O error?)".to_string(),
            _ => format!("Database error: {}", e),
        }
    } else {
        format!("Database error: {}", e)
    }
}

/// Менеджер базы данных
/// Хранит slot snapshot (app_meta), локальный ledger и uncredited сессии
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    pub(crate) fn lock_conn(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock. \
                 Please restart the application to recover.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: Integrity check on startup, detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        // WAL: snapshot переживает crash посреди записи
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| {
                warn!(
                    "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                    e
                );
            })
            .ok();
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        // Параллельный writer (другой процесс CLI) ждет lock, а не падает сразу
        let _ = conn.busy_timeout(std::time::Duration::from_secs(5));

        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| {
                warn!("[DB] Failed to enable foreign keys: {}. Continuing.", e);
            })
            .ok();

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    /// Versioned migrations using SQLite user_version pragma.
    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT)",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS timer_sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                duration_seconds INTEGER,
                date TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS daily_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                hours REAL NOT NULL DEFAULT 0,
                notes TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(user_id, date)
            )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_timer_sessions_user_date ON timer_sessions(user_id, date)",
                [],
            )?;
        }

        // Migration 2: uncredited_sessions
        if current < 2 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS uncredited_sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                date TEXT NOT NULL,
                duration_seconds INTEGER NOT NULL,
                hours REAL NOT NULL,
                reason TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            )",
                [],
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Выполнить `f` внутри BEGIN IMMEDIATE транзакции.
    /// Ok → COMMIT, Err → ROLLBACK. Write lock берется сразу, поэтому
    /// read-modify-write внутри `f` не теряет параллельные обновления.
    pub fn in_immediate_transaction<T, E, F>(&self, context: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<rusqlite::Error>,
    {
        let conn = self.lock_conn()?;

        conn.execute("BEGIN IMMEDIATE TRANSACTION", [])
            .map_err(|e| {
                log_io_error_if_any(context, &e);
                error!("[DB] {}: failed to begin transaction: {}", context, e);
                e
            })?;

        match f(&conn) {
            Ok(value) => {
                if let Err(e) = conn.execute("COMMIT", []) {
                    log_io_error_if_any(context, &e);
                    error!("[DB] {}: failed to commit transaction: {}", context, e);
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Получить значение из app_meta
    pub fn get_app_meta(&self, key: &str) -> SqliteResult<Option<String>> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT value FROM app_meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map(Option::flatten)
    }

    /// Записать значение в app_meta
    pub fn set_app_meta(&self, key: &str, value: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )
        .map_err(|e| {
            log_io_error_if_any("set_app_meta", &e);
            e
        })?;
        Ok(())
    }

    pub fn delete_app_meta(&self, key: &str) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM app_meta WHERE key = ?1", params![key])
            .map_err(|e| {
                log_io_error_if_any("delete_app_meta", &e);
                e
            })?;
        Ok(())
    }

    /// Записать сессию, которая завершена, но не зачислена в дневной лог.
    /// Повторная запись той же сессии обновляет причину.
    pub fn record_uncredited(&self, entry: &UncreditedSession) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO uncredited_sessions (session_id, user_id, date, duration_seconds, hours, reason, recorded_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
     ON CONFLICT(session_id) DO UPDATE SET
        reason = ?6,
        recorded_at = ?7",
            params![
                entry.session_id,
                entry.user_id,
                entry.date,
                entry.duration_seconds,
                entry.hours,
                entry.reason,
                entry.recorded_at
            ],
        )
        .map_err(|e| {
            log_io_error_if_any("record_uncredited", &e);
            e
        })?;
        Ok(())
    }

    pub fn list_uncredited(&self, user_id: &str) -> SqliteResult<Vec<UncreditedSession>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, date, duration_seconds, hours, reason, recorded_at
             FROM uncredited_sessions
             WHERE user_id = ?1
             ORDER BY recorded_at DESC",
        )?;

        let rows = stmt.query_map(params![user_id], |row| {
            Ok(UncreditedSession {
                session_id: row.get(0)?,
                user_id: row.get(1)?,
                date: row.get(2)?,
                duration_seconds: row.get(3)?,
                hours: row.get(4)?,
                reason: row.get(5)?,
                recorded_at: row.get(6)?,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Unix timestamp для created_at / updated_at колонок
    pub(crate) fn now_timestamp() -> i64 {
        Utc::now().timestamp()
    }
}
