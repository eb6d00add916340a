use crate::models::UncreditedSession;
use crate::snapshot::StoreError;
use crate::Database;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
mod http;
mod local;
pub use http::HttpLedger;
pub use local::SqliteLedger;

/// Дневной лимит зачисленных часов
pub const DAILY_CAP_HOURS: f64 = 12.0;

/// Ошибки ledger (для разбора и логирования)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Network: {0}")]
    Network(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Auth: {0}")]
    Auth(String),
    #[error(
        "Adding {adding:.2} hours would exceed the {cap:.0}-hour daily limit. \
         Current: {current:.2}h, attempted total: {attempted:.2}h"
    )]
    CapExceeded {
        current: f64,
        adding: f64,
        attempted: f64,
        cap: f64,
    },
    #[error("Timer session {0} not found")]
    NotFound(String),
    #[error("Concurrent update: {0}")]
    Conflict(String),
    #[error("Parse response: {0}")]
    Parse(String),
    #[error("DB: {0}")]
    Db(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Db(crate::database::storage_error_to_user_message(&e))
    }
}

/// Remote record of sessions and the per-day aggregate.
/// `add_hours_to_daily_log` is a single logical read-modify-write step and
/// rejects totals above the cap with [`LedgerError::CapExceeded`].
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create_session(
        &self,
        user_id: &str,
        start_time: DateTime<FixedOffset>,
        date: NaiveDate,
    ) -> Result<String, LedgerError>;

    async fn finalize_session(
        &self,
        user_id: &str,
        session_id: &str,
        end_time: DateTime<FixedOffset>,
        duration_seconds: u64,
    ) -> Result<(), LedgerError>;

    /// Returns the new daily total
    async fn add_hours_to_daily_log(
        &self,
        user_id: &str,
        date: NaiveDate,
        hours: f64,
    ) -> Result<f64, LedgerError>;

    /// Current credited hours for the day (0 when no row exists)
    async fn daily_hours(&self, user_id: &str, date: NaiveDate) -> Result<f64, LedgerError>;
}

/// Sink for sessions that ended but could not be credited.
pub trait UncreditedLog: Send + Sync {
    fn record(&self, entry: &UncreditedSession) -> Result<(), StoreError>;
}

impl UncreditedLog for Database {
    fn record(&self, entry: &UncreditedSession) -> Result<(), StoreError> {
        self.record_uncredited(entry)
            .map_err(|e| StoreError::Storage(crate::database::storage_error_to_user_message(&e)))
    }
}

/// Часы → миллионные доли часа. Лимит считается в целых, чтобы 11.5 + 0.5 == 12.0 без float drift.
/// Шаг мельче сотых: строку, отредактированную вручную до 11.994, не округляем.
pub fn to_micro_hours(hours: f64) -> i64 {
    (hours * 1_000_000.0).round() as i64
}

pub fn from_micro_hours(micro: i64) -> f64 {
    micro as f64 / 1_000_000.0
}

/// Новая сумма за день или CapExceeded, если `current + adding > cap`.
pub fn checked_daily_total(current: f64, adding: f64, cap: f64) -> Result<f64, LedgerError> {
    let current_u = to_micro_hours(current);
    let adding_u = to_micro_hours(adding);
    let attempted_u = current_u.saturating_add(adding_u);

    if attempted_u > to_micro_hours(cap) {
        return Err(LedgerError::CapExceeded {
            current: from_micro_hours(current_u),
            adding: from_micro_hours(adding_u),
            attempted: from_micro_hours(attempted_u),
            cap,
        });
    }
    Ok(from_micro_hours(attempted_u))
}

/// Notes written on the daily row, kept in the format the dashboards already show.
pub(crate) fn daily_log_note(hours: f64, existing_row: bool) -> String {
    if existing_row {
        format!("Automated Timer Session - {:.2}h added", hours)
    } else {
        format!("Automated Timer Session - {:.2}h", hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_boundary_exactly_twelve_is_accepted() {
        assert_eq!(checked_daily_total(11.5, 0.5, DAILY_CAP_HOURS), Ok(12.0));
    }

    #[test]
    fn test_cap_exceeded_reports_current_and_attempted() {
        let err = checked_daily_total(11.5, 0.6, DAILY_CAP_HOURS).unwrap_err();
        match &err {
            LedgerError::CapExceeded {
                current,
                adding,
                attempted,
                ..
            } => {
                assert_eq!(*current, 11.5);
                assert_eq!(*adding, 0.6);
                assert_eq!(*attempted, 12.1);
            }
            other => panic!("Expected CapExceeded, got {:?}", other),
        }
        let message = err.to_string();
        assert!(message.contains("11.50h"));
        assert!(message.contains("12.10h"));
        assert!(message.contains("12-hour"));
    }

    #[test]
    fn test_float_sums_do_not_drift() {
        // 0.1 + 0.2 в f64 = 0.30000000000000004
        assert_eq!(checked_daily_total(0.1, 0.2, DAILY_CAP_HOURS), Ok(0.3));
        assert_eq!(checked_daily_total(11.99, 0.01, DAILY_CAP_HOURS), Ok(12.0));
    }

    #[test]
    fn test_hand_edited_total_keeps_its_precision() {
        assert_eq!(checked_daily_total(3.333, 0.5, DAILY_CAP_HOURS), Ok(3.833));
        // 11.994 + 0.01 = 12.004, выше лимита; сотые дали бы ровно 12.00
        assert!(matches!(
            checked_daily_total(11.994, 0.01, DAILY_CAP_HOURS),
            Err(LedgerError::CapExceeded { .. })
        ));
        assert_eq!(checked_daily_total(11.994, 0.006, DAILY_CAP_HOURS), Ok(12.0));
    }

    #[test]
    fn test_single_session_above_cap_on_empty_day() {
        assert!(matches!(
            checked_daily_total(0.0, 12.01, DAILY_CAP_HOURS),
            Err(LedgerError::CapExceeded { .. })
        ));
    }
}
