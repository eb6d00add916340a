use crate::engine::TimerState;
use crate::Database;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Fixed key of the single snapshot slot
pub const SNAPSHOT_KEY: &str = "hourforge-timer-v2";

/// Durable timing state of the active session.
/// Serialized with the field names the host stores expect:
/// `sessionId`, `realStartTime`, `totalPausedDuration`, `state`, `date`, `lastPauseTime?`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub session_id: String,
    /// Unix timestamp (мс) начала сессии, не меняется до конца сессии
    pub real_start_time: i64,
    /// Суммарная пауза (мс)
    pub total_paused_duration: u64,
    pub state: TimerState,
    /// YYYY-MM-DD по фиксированному сдвигу
    pub date: String,
    /// Unix timestamp (мс) начала текущей паузы; только для Paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pause_time: Option<i64>,
}

impl TimerSnapshot {
    pub fn started(session_id: String, real_start_time: i64, date: String) -> Self {
        Self {
            session_id,
            real_start_time,
            total_paused_duration: 0,
            state: TimerState::Running,
            date,
            last_pause_time: None,
        }
    }

    /// Running → Paused at `now_ms`
    pub fn paused_at(&self, now_ms: i64) -> Self {
        Self {
            state: TimerState::Paused,
            last_pause_time: Some(now_ms),
            ..self.clone()
        }
    }

    /// Paused → Running at `now_ms`, folding the finished pause into the total.
    pub fn resumed_at(&self, now_ms: i64) -> Self {
        let pause_ms = self
            .last_pause_time
            .map(|at| now_ms.saturating_sub(at).max(0) as u64)
            .unwrap_or(0);
        Self {
            state: TimerState::Running,
            total_paused_duration: self.total_paused_duration.saturating_add(pause_ms),
            last_pause_time: None,
            ..self.clone()
        }
    }

    /// Сессия закрыта; restore и start такой snapshot не подхватывают
    pub fn finished(&self) -> Self {
        Self {
            state: TimerState::Idle,
            last_pause_time: None,
            ..self.clone()
        }
    }

    /// lastPauseTime iff paused; a live session always has a remote id.
    pub fn is_consistent(&self) -> bool {
        let pause_marker_ok = match self.state {
            TimerState::Paused => self.last_pause_time.is_some(),
            TimerState::Running | TimerState::Idle => self.last_pause_time.is_none(),
        };
        let session_ok = self.state == TimerState::Idle || !self.session_id.is_empty();
        pause_marker_ok && session_ok && !self.date.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to serialize timer snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Timer snapshot storage unavailable: {0}")]
    Storage(String),
}

/// Single-slot, last-write-wins persistence of the timer snapshot.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &TimerSnapshot) -> Result<(), StoreError>;
    /// Malformed or unreadable value → None, never an error
    fn load(&self) -> Option<TimerSnapshot>;
    fn clear(&self) -> Result<(), StoreError>;
}

pub fn encode_snapshot(snapshot: &TimerSnapshot) -> Result<String, StoreError> {
    Ok(serde_json::to_string(snapshot)?)
}

/// Разбор сохраненного snapshot. Любая ошибка = snapshot отсутствует.
pub fn decode_snapshot(raw: &str) -> Option<TimerSnapshot> {
    match serde_json::from_str::<TimerSnapshot>(raw) {
        Ok(snapshot) if snapshot.is_consistent() => Some(snapshot),
        Ok(snapshot) => {
            warn!(
                "[SNAPSHOT] Stored snapshot violates invariants (state={}, lastPauseTime={:?}), ignoring",
                snapshot.state, snapshot.last_pause_time
            );
            None
        }
        Err(e) => {
            warn!("[SNAPSHOT] Malformed stored snapshot, ignoring: {}", e);
            None
        }
    }
}

impl SnapshotStore for Database {
    fn save(&self, snapshot: &TimerSnapshot) -> Result<(), StoreError> {
        let raw = encode_snapshot(snapshot)?;
        self.set_app_meta(SNAPSHOT_KEY, &raw)
            .map_err(|e| StoreError::Storage(crate::database::storage_error_to_user_message(&e)))?;
        debug!("[SNAPSHOT] Saved: {}", raw);
        Ok(())
    }

    fn load(&self) -> Option<TimerSnapshot> {
        match self.get_app_meta(SNAPSHOT_KEY) {
            Ok(Some(raw)) => decode_snapshot(&raw),
            Ok(None) => None,
            Err(e) => {
                warn!("[SNAPSHOT] Failed to read snapshot slot: {}", e);
                None
            }
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.delete_app_meta(SNAPSHOT_KEY)
            .map_err(|e| StoreError::Storage(crate::database::storage_error_to_user_message(&e)))?;
        debug!("[SNAPSHOT] Cleared");
        Ok(())
    }
}

/// In-process slot holding the encoded JSON, same codec as the durable stores.
#[derive(Default)]
pub struct MemorySnapshotStore {
    slot: Mutex<Option<String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an arbitrary raw value into the slot (simulates foreign or corrupted writes).
    pub fn put_raw(&self, raw: impl Into<String>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(raw.into());
    }

    pub fn raw(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, snapshot: &TimerSnapshot) -> Result<(), StoreError> {
        let raw = encode_snapshot(snapshot)?;
        *self
            .slot
            .lock()
            .map_err(|e| StoreError::Storage(format!("Mutex poisoned: {}", e)))? = Some(raw);
        Ok(())
    }

    fn load(&self) -> Option<TimerSnapshot> {
        let raw = self.slot.lock().ok()?.clone()?;
        decode_snapshot(&raw)
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self
            .slot
            .lock()
            .map_err(|e| StoreError::Storage(format!("Mutex poisoned: {}", e)))? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> TimerSnapshot {
        TimerSnapshot::started("abc".into(), 1_700_000_000_000, "2026-10-14".into())
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = MemorySnapshotStore::new();
        let snapshot = running().paused_at(1_700_000_100_000);
        store.save(&snapshot).unwrap();
        assert_eq!(store.load(), Some(snapshot));
    }

    #[test]
    fn test_load_after_clear_is_none() {
        let store = MemorySnapshotStore::new();
        store.save(&running()).unwrap();
        store.clear().unwrap();
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_finished_snapshot_is_idle_and_loadable() {
        let store = MemorySnapshotStore::new();
        let finished = running().paused_at(1_700_000_100_000).finished();
        assert_eq!(finished.state, TimerState::Idle);
        assert_eq!(finished.last_pause_time, None);
        store.save(&finished).unwrap();
        assert_eq!(store.load(), Some(finished));
    }

    #[test]
    fn test_wire_field_names() {
        let raw = encode_snapshot(&running()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["realStartTime"], 1_700_000_000_000i64);
        assert_eq!(value["totalPausedDuration"], 0);
        assert_eq!(value["state"], "running");
        assert_eq!(value["date"], "2026-10-14");
        // lastPauseTime отсутствует вне паузы
        assert!(value.get("lastPauseTime").is_none());
    }

    #[test]
    fn test_reads_snapshot_written_by_browser_host() {
        let raw = r#"{"sessionId":"s-1","realStartTime":1700000000000,"totalPausedDuration":60000,"state":"paused","date":"2026-10-14","lastPauseTime":1700000200000}"#;
        let snapshot = decode_snapshot(raw).unwrap();
        assert_eq!(snapshot.state, TimerState::Paused);
        assert_eq!(snapshot.total_paused_duration, 60_000);
        assert_eq!(snapshot.last_pause_time, Some(1_700_000_200_000));
    }

    #[test]
    fn test_malformed_value_loads_as_none() {
        let store = MemorySnapshotStore::new();
        store.put_raw("{not json");
        assert_eq!(store.load(), None);

        store.put_raw(r#"{"sessionId":"x","state":"running"}"#);
        assert_eq!(store.load(), None);

        store.put_raw(r#"{"sessionId":"x","realStartTime":1,"totalPausedDuration":-5,"state":"running","date":"2026-10-14"}"#);
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_inconsistent_snapshot_loads_as_none() {
        let store = MemorySnapshotStore::new();
        // paused без lastPauseTime
        store.put_raw(r#"{"sessionId":"x","realStartTime":1,"totalPausedDuration":0,"state":"paused","date":"2026-10-14"}"#);
        assert_eq!(store.load(), None);

        // running с пустым sessionId
        store.put_raw(r#"{"sessionId":"","realStartTime":1,"totalPausedDuration":0,"state":"running","date":"2026-10-14"}"#);
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_resume_folds_pause_into_total() {
        let paused = running().paused_at(1_700_000_100_000);
        let resumed = paused.resumed_at(1_700_000_160_000);
        assert_eq!(resumed.state, TimerState::Running);
        assert_eq!(resumed.total_paused_duration, 60_000);
        assert_eq!(resumed.last_pause_time, None);
        assert_eq!(resumed.real_start_time, paused.real_start_time);
    }

    #[test]
    fn test_resume_with_backwards_clock_never_decreases_total() {
        let paused = running().paused_at(1_700_000_100_000);
        let resumed = paused.resumed_at(1_700_000_050_000);
        assert_eq!(resumed.total_paused_duration, 0);
    }
}
