use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Offset, Utc};
use std::sync::Mutex;

/// Источник wall-clock времени для таймера.
/// Позволяет подменять время в тестах (ManualClock).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Unix timestamp в миллисекундах (формат snapshot)
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock driven by hand. Used by tests to simulate suspended processes,
/// reloads and day boundaries without sleeping.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Определение «сегодня»: UTC + фиксированный сдвиг.
/// Один и тот же сдвиг используется для start, restore и end, поэтому
/// day rollover и дневной лимит считаются по одной календарной дате.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayPolicy {
    offset: FixedOffset,
}

impl DayPolicy {
    /// IST (UTC+05:30)
    pub const DEFAULT_OFFSET_MINUTES: i32 = 330;

    pub fn from_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn local_time(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    pub fn date_of(&self, at: DateTime<Utc>) -> NaiveDate {
        self.local_time(at).date_naive()
    }

    pub fn date_string(&self, at: DateTime<Utc>) -> String {
        format_date(self.date_of(at))
    }
}

impl Default for DayPolicy {
    fn default() -> Self {
        Self::from_offset_minutes(Self::DEFAULT_OFFSET_MINUTES).unwrap_or(Self {
            offset: Utc.fix(),
        })
    }
}

/// Canonical date format shared by the snapshot, the ledger and the CLI.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_policy_rolls_over_at_local_midnight() {
        let policy = DayPolicy::default();
        // 18:29 UTC = 23:59 IST
        let before = Utc.with_ymd_and_hms(2026, 10, 13, 18, 29, 0).unwrap();
        // 18:31 UTC = 00:01 IST следующего дня
        let after = Utc.with_ymd_and_hms(2026, 10, 13, 18, 31, 0).unwrap();

        assert_eq!(policy.date_string(before), "2026-10-13");
        assert_eq!(policy.date_string(after), "2026-10-14");
    }

    #[test]
    fn test_day_policy_custom_offset() {
        let utc = DayPolicy::from_offset_minutes(0).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 13, 23, 0, 0).unwrap();
        assert_eq!(utc.date_string(at), "2026-10-13");

        let minus_five = DayPolicy::from_offset_minutes(-300).unwrap();
        let early = Utc.with_ymd_and_hms(2026, 10, 14, 2, 0, 0).unwrap();
        assert_eq!(minus_five.date_string(early), "2026-10-13");
    }

    #[test]
    fn test_day_policy_rejects_out_of_range_offset() {
        assert!(DayPolicy::from_offset_minutes(24 * 60).is_none());
        assert!(DayPolicy::from_offset_minutes(i32::MAX).is_none());
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance_secs(90);
        assert_eq!(clock.now_millis() - start.timestamp_millis(), 90_000);
    }
}
