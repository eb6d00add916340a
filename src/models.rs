use serde::{Deserialize, Serialize};

/// Запись сессии таймера (timer_sessions)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSession {
    pub id: String,
    pub user_id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_seconds: Option<u64>,
    pub date: String,
    pub created_at: i64,
}

/// Дневной агрегат часов (daily_logs), одна строка на (user, date)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyLog {
    pub id: i64,
    pub user_id: String,
    pub date: String,
    pub hours: f64,
    pub notes: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Session that was finalized remotely but whose hours never reached a daily log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncreditedSession {
    pub session_id: String,
    pub user_id: String,
    pub date: String,
    pub duration_seconds: u64,
    pub hours: f64,
    pub reason: String,
    pub recorded_at: i64,
}

/// Результат обновления токена
#[derive(Debug)]
pub struct TokenRefreshResult {
    pub access_token: String,
    pub refresh_token: Option<String>,
}
