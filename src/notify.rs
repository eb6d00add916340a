use serde::Serialize;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    Start,
    Pause,
    Resume,
    End,
    Reset,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// User-facing status message produced by the timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub kind: NoticeKind,
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn new(kind: NoticeKind, level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            kind,
            level,
            message: message.into(),
        }
    }

    fn dedupe_key(&self) -> (NoticeKind, &str) {
        (self.kind, self.message.as_str())
    }
}

/// Защита от дублирующихся уведомлений.
/// Одинаковое (kind, message) внутри окна пропускается; после окна снова допускается.
pub struct NotificationGate {
    window_ms: i64,
    last: Mutex<Option<(NoticeKind, String, i64)>>,
}

impl NotificationGate {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms: window_ms.max(0),
            last: Mutex::new(None),
        }
    }

    /// Returns true when the notice should be shown.
    pub fn admit(&self, notice: &Notice, now_ms: i64) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((kind, message, at)) = last.as_ref() {
            let within_window = now_ms.saturating_sub(*at) < self.window_ms;
            if within_window && (*kind, message.as_str()) == notice.dedupe_key() {
                return false;
            }
        }

        *last = Some((notice.kind, notice.message.clone(), now_ms));
        true
    }
}
