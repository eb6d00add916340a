use super::{checked_daily_total, daily_log_note, Ledger, LedgerError, DAILY_CAP_HOURS};
use crate::clock::format_date;
use crate::database::Database;
use crate::engine::round_hours;
use crate::models::{DailyLog, TimerSession};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

/// Ledger поверх локальной SQLite (offline режим CLI и тесты).
/// Те же правила, что и у удаленного: лимит 12ч, аддитивное обновление дневного лога.
pub struct SqliteLedger {
    db: Arc<Database>,
    cap_hours: f64,
}

impl SqliteLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cap_hours: DAILY_CAP_HOURS,
        }
    }

    pub fn with_cap(mut self, cap_hours: f64) -> Self {
        self.cap_hours = cap_hours;
        self
    }

    pub fn session(&self, session_id: &str) -> Result<Option<TimerSession>, LedgerError> {
        let conn = self.db.lock_conn()?;
        let session = conn
            .query_row(
                "SELECT id, user_id, start_time, end_time, duration_seconds, date, created_at
                 FROM timer_sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(TimerSession {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        duration_seconds: row.get(4)?,
                        date: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(session)
    }

    pub fn daily_log(&self, user_id: &str, date: NaiveDate) -> Result<Option<DailyLog>, LedgerError> {
        let conn = self.db.lock_conn()?;
        let log = conn
            .query_row(
                "SELECT id, user_id, date, hours, notes, created_at, updated_at
                 FROM daily_logs WHERE user_id = ?1 AND date = ?2",
                params![user_id, format_date(date)],
                |row| {
                    Ok(DailyLog {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        date: row.get(2)?,
                        hours: row.get(3)?,
                        notes: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(log)
    }

    /// Прямое редактирование дневного лога (как из экрана DailyLog)
    pub fn set_daily_hours(&self, user_id: &str, date: NaiveDate, hours: f64) -> Result<(), LedgerError> {
        let now = Database::now_timestamp();
        let conn = self.db.lock_conn()?;
        conn.execute(
            "INSERT INTO daily_logs (user_id, date, hours, notes, created_at, updated_at)
     VALUES (?1, ?2, ?3, NULL, ?4, ?4)
     ON CONFLICT(user_id, date) DO UPDATE SET
        hours = ?3,
        updated_at = ?4",
            params![user_id, format_date(date), hours, now],
        )?;
        Ok(())
    }
}

/// Случайный id сессии (16 байт hex)
fn new_session_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn create_session(
        &self,
        user_id: &str,
        start_time: DateTime<FixedOffset>,
        date: NaiveDate,
    ) -> Result<String, LedgerError> {
        let id = new_session_id();
        let conn = self.db.lock_conn()?;
        conn.execute(
            "INSERT INTO timer_sessions (id, user_id, start_time, date, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                user_id,
                start_time.to_rfc3339(),
                format_date(date),
                Database::now_timestamp()
            ],
        )?;
        debug!("[LEDGER] Created local session {} for {}", id, user_id);
        Ok(id)
    }

    async fn finalize_session(
        &self,
        user_id: &str,
        session_id: &str,
        end_time: DateTime<FixedOffset>,
        duration_seconds: u64,
    ) -> Result<(), LedgerError> {
        let conn = self.db.lock_conn()?;
        let updated = conn.execute(
            "UPDATE timer_sessions SET end_time = ?1, duration_seconds = ?2
     WHERE id = ?3 AND user_id = ?4",
            params![end_time.to_rfc3339(), duration_seconds, session_id, user_id],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    async fn add_hours_to_daily_log(
        &self,
        user_id: &str,
        date: NaiveDate,
        hours: f64,
    ) -> Result<f64, LedgerError> {
        let date_str = format_date(date);
        let rounded = round_hours(hours);
        let cap = self.cap_hours;

        let new_total = self
            .db
            .in_immediate_transaction("add_hours_to_daily_log", |conn| -> Result<f64, LedgerError> {
                let existing: Option<(i64, f64)> = conn
                    .query_row(
                        "SELECT id, hours FROM daily_logs WHERE user_id = ?1 AND date = ?2",
                        params![user_id, date_str],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let now = Database::now_timestamp();

                match existing {
                    Some((id, current)) => {
                        let total = checked_daily_total(current, rounded, cap)?;
                        conn.execute(
                            "UPDATE daily_logs SET hours = ?1, notes = ?2, updated_at = ?3 WHERE id = ?4",
                            params![total, daily_log_note(rounded, true), now, id],
                        )?;
                        Ok(total)
                    }
                    None => {
                        let total = checked_daily_total(0.0, rounded, cap)?;
                        conn.execute(
                            "INSERT INTO daily_logs (user_id, date, hours, notes, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                            params![user_id, date_str, total, daily_log_note(rounded, false), now],
                        )?;
                        Ok(total)
                    }
                }
            })?;

        info!(
            "[LEDGER] Daily log {} for {}: +{:.2}h → {:.2}h",
            date_str, user_id, rounded, new_total
        );
        Ok(new_total)
    }

    async fn daily_hours(&self, user_id: &str, date: NaiveDate) -> Result<f64, LedgerError> {
        Ok(self.daily_log(user_id, date)?.map(|log| log.hours).unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn create_test_ledger() -> (SqliteLedger, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Arc::new(Database::new(db_path.to_str().unwrap()).unwrap());
        (SqliteLedger::new(db), temp_dir)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2026, 10, 14, h, m, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_finalize_session() {
        let (ledger, _temp_dir) = create_test_ledger();

        let id = ledger.create_session("user-1", at(9, 0), day()).await.unwrap();
        assert_eq!(id.len(), 32);

        let session = ledger.session(&id).unwrap().unwrap();
        assert_eq!(session.date, "2026-10-14");
        assert_eq!(session.end_time, None);
        assert!(session.start_time.ends_with("+05:30"));

        ledger
            .finalize_session("user-1", &id, at(10, 0), 3600)
            .await
            .unwrap();
        let session = ledger.session(&id).unwrap().unwrap();
        assert_eq!(session.duration_seconds, Some(3600));
        assert!(session.end_time.is_some());
    }

    #[tokio::test]
    async fn test_finalize_unknown_or_foreign_session_is_not_found() {
        let (ledger, _temp_dir) = create_test_ledger();
        let id = ledger.create_session("user-1", at(9, 0), day()).await.unwrap();

        let foreign = ledger.finalize_session("user-2", &id, at(10, 0), 60).await;
        assert!(matches!(foreign, Err(LedgerError::NotFound(_))));

        let missing = ledger.finalize_session("user-1", "nope", at(10, 0), 60).await;
        assert!(matches!(missing, Err(LedgerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_daily_log_created_lazily_then_updated_additively() {
        let (ledger, _temp_dir) = create_test_ledger();
        assert_eq!(ledger.daily_hours("user-1", day()).await.unwrap(), 0.0);

        let total = ledger.add_hours_to_daily_log("user-1", day(), 1.25).await.unwrap();
        assert_eq!(total, 1.25);
        let log = ledger.daily_log("user-1", day()).unwrap().unwrap();
        assert_eq!(log.notes.as_deref(), Some("Automated Timer Session - 1.25h"));

        let total = ledger.add_hours_to_daily_log("user-1", day(), 0.5).await.unwrap();
        assert_eq!(total, 1.75);
        let log = ledger.daily_log("user-1", day()).unwrap().unwrap();
        assert_eq!(log.notes.as_deref(), Some("Automated Timer Session - 0.50h added"));

        // другой пользователь не видит чужие часы
        assert_eq!(ledger.daily_hours("user-2", day()).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_cap_boundary_on_existing_row() {
        let (ledger, _temp_dir) = create_test_ledger();
        ledger.set_daily_hours("user-1", day(), 11.5).unwrap();

        let rejected = ledger.add_hours_to_daily_log("user-1", day(), 0.6).await;
        assert!(matches!(rejected, Err(LedgerError::CapExceeded { .. })));
        assert_eq!(ledger.daily_hours("user-1", day()).await.unwrap(), 11.5);

        let total = ledger.add_hours_to_daily_log("user-1", day(), 0.5).await.unwrap();
        assert_eq!(total, 12.0);
        assert_eq!(ledger.daily_hours("user-1", day()).await.unwrap(), 12.0);
    }

    #[tokio::test]
    async fn test_hand_edited_row_is_not_normalised() {
        let (ledger, _temp_dir) = create_test_ledger();
        ledger.set_daily_hours("user-1", day(), 11.994).unwrap();

        let rejected = ledger.add_hours_to_daily_log("user-1", day(), 0.01).await;
        assert!(matches!(rejected, Err(LedgerError::CapExceeded { .. })));
        assert_eq!(ledger.daily_hours("user-1", day()).await.unwrap(), 11.994);

        ledger.set_daily_hours("user-1", day(), 3.333).unwrap();
        let total = ledger.add_hours_to_daily_log("user-1", day(), 0.5).await.unwrap();
        assert_eq!(total, 3.833);
    }

    #[tokio::test]
    async fn test_cap_rejects_oversized_first_session() {
        let (ledger, _temp_dir) = create_test_ledger();
        let rejected = ledger.add_hours_to_daily_log("user-1", day(), 12.5).await;
        assert!(matches!(rejected, Err(LedgerError::CapExceeded { .. })));
        assert!(ledger.daily_log("user-1", day()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_cap() {
        let (ledger, _temp_dir) = create_test_ledger();
        let ledger = ledger.with_cap(1.0);
        assert!(ledger.add_hours_to_daily_log("user-1", day(), 1.0).await.is_ok());
        assert!(ledger.add_hours_to_daily_log("user-1", day(), 0.01).await.is_err());
    }
}
