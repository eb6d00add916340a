use crate::engine::TimerState;
use crate::snapshot::TimerSnapshot;

/// Секунды текущей сессии без пауз, строго из timestamp'ов snapshot.
/// Не зависит от того, сколько раз сработал тикер.
pub fn elapsed_seconds(snapshot: &TimerSnapshot, now_ms: i64) -> u64 {
    let until = match snapshot.state {
        TimerState::Idle => return 0,
        TimerState::Running => now_ms,
        TimerState::Paused => snapshot.last_pause_time.unwrap_or(now_ms),
    };
    let paused = i64::try_from(snapshot.total_paused_duration).unwrap_or(i64::MAX);
    let active_ms = until
        .saturating_sub(snapshot.real_start_time)
        .saturating_sub(paused);

    // Часы переведены назад → 0, не отрицательное значение
    if active_ms <= 0 {
        return 0;
    }
    (active_ms / 1000) as u64
}

/// Округление до сотых часа
pub fn round_hours(hours: f64) -> f64 {
    (hours * 100.0).round() / 100.0
}

pub fn seconds_to_hours(seconds: u64) -> f64 {
    round_hours(seconds as f64 / 3600.0)
}

pub fn format_hms(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn running() -> TimerSnapshot {
        TimerSnapshot::started("s".into(), T0, "2026-10-14".into())
    }

    #[test]
    fn test_running_elapsed_floors_to_seconds() {
        assert_eq!(elapsed_seconds(&running(), T0 + 59_999), 59);
        assert_eq!(elapsed_seconds(&running(), T0 + 60_000), 60);
    }

    #[test]
    fn test_paused_elapsed_is_frozen_at_pause() {
        let paused = running().paused_at(T0 + 100_000);
        assert_eq!(elapsed_seconds(&paused, T0 + 100_000), 100);
        assert_eq!(elapsed_seconds(&paused, T0 + 900_000), 100);
    }

    #[test]
    fn test_pauses_are_excluded() {
        let resumed = running().paused_at(T0 + 100_000).resumed_at(T0 + 160_000);
        assert_eq!(elapsed_seconds(&resumed, T0 + 220_000), 160);
    }

    #[test]
    fn test_clock_before_start_clamps_to_zero() {
        assert_eq!(elapsed_seconds(&running(), T0 - 5_000), 0);
    }

    #[test]
    fn test_idle_is_zero() {
        let idle = TimerSnapshot {
            state: TimerState::Idle,
            ..running()
        };
        assert_eq!(elapsed_seconds(&idle, T0 + 10_000), 0);
    }

    #[test]
    fn test_hours_and_formatting() {
        assert_eq!(seconds_to_hours(160), 0.04);
        assert_eq!(seconds_to_hours(60), 0.02);
        assert_eq!(seconds_to_hours(5400), 1.5);
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(3_725), "01:02:05");
        assert_eq!(format_hms(45_000), "12:30:00");
    }
}
