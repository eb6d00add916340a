use crate::auth::AuthManager;
use crate::clock::{Clock, DayPolicy, SystemClock};
use crate::config::TimerConfig;
use crate::ipc::events;
use crate::ledger::{Ledger, LedgerError, UncreditedLog};
use crate::notify::{Notice, NoticeKind, NoticeLevel, NotificationGate};
use crate::snapshot::{SnapshotStore, StoreError, TimerSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};
mod core;
mod db;
mod elapsed;
mod ticker;
pub use elapsed::{elapsed_seconds, format_hms, round_hours, seconds_to_hours};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Timer Engine - строгая FSM поверх абсолютных timestamp'ов.
/// Snapshot в памяти и в store - единственный источник истины;
/// тикер только перерисовывает значение.
pub struct TimerEngine {
    /// Текущая сессия (None = Idle)
    pub(crate) snapshot: Arc<Mutex<Option<TimerSnapshot>>>,
    /// Последнее отображаемое значение (обновляется тикером)
    pub(crate) displayed_seconds: Arc<AtomicU64>,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) auth: Arc<AuthManager>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Куда писать сессии, отклоненные дневным лимитом
    pub(crate) uncredited: Option<Arc<dyn UncreditedLog>>,
    pub(crate) gate: NotificationGate,
    pub(crate) events: broadcast::Sender<TimerEvent>,
    pub(crate) ticker: Mutex<Option<JoinHandle<()>>>,
    /// Single-flight: одна операция за раз
    pub(crate) busy: AtomicBool,
    pub(crate) config: TimerConfig,
    pub(crate) day_policy: DayPolicy,
}

/// Состояние таймера
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerState {
    Idle,
    Running,
    Paused,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerState::Idle => write!(f, "idle"),
            TimerState::Running => write!(f, "running"),
            TimerState::Paused => write!(f, "paused"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("Please sign in to use the timer")]
    NotAuthenticated,
    #[error("Timer is already running or paused (state: {0})")]
    AlreadyActive(TimerState),
    #[error("Another timer operation is in progress")]
    Busy,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Internal timer error: {0}")]
    Internal(String),
}

/// Результат end()
#[derive(Debug, Clone, PartialEq)]
pub enum EndOutcome {
    /// Таймер и так был idle
    NothingToEnd,
    /// Сессия короче минимума, ничего не записано
    Discarded { elapsed_seconds: u64 },
    Committed {
        session_id: String,
        elapsed_seconds: u64,
        hours: f64,
        daily_total: f64,
    },
}

/// Результат restore()
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Нет пользователя; сохраненный snapshot не тронут
    SignedOut,
    Fresh,
    /// Snapshot был за другой день и удален
    DiscardedStale { date: String },
    Resumed {
        state: TimerState,
        elapsed_seconds: u64,
    },
}

/// Ответ для UI/CLI, всегда пересчитывается из timestamp'ов
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerStatus {
    pub state: TimerState,
    pub elapsed_seconds: u64,
    pub hours: f64,
    pub formatted: String,
    pub session_id: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    Tick { elapsed_seconds: u64 },
    Notice(Notice),
    /// Сессия зачислена в дневной лог
    SessionSaved,
}

impl TimerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TimerEvent::Tick { .. } => events::TIMER_TICK,
            TimerEvent::Notice(_) => events::TIMER_NOTICE,
            TimerEvent::SessionSaved => events::TIMER_SAVED,
        }
    }
}

impl TimerEngine {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        ledger: Arc<dyn Ledger>,
        auth: Arc<AuthManager>,
    ) -> Self {
        let config = TimerConfig::default();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            snapshot: Arc::new(Mutex::new(None)),
            displayed_seconds: Arc::new(AtomicU64::new(0)),
            store,
            ledger,
            auth,
            clock: Arc::new(SystemClock),
            uncredited: None,
            gate: NotificationGate::new(config.notice_window_ms),
            events,
            ticker: Mutex::new(None),
            busy: AtomicBool::new(false),
            day_policy: config.day_policy(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: TimerConfig) -> Self {
        self.gate = NotificationGate::new(config.notice_window_ms);
        self.day_policy = config.day_policy();
        self.config = config;
        self
    }

    pub fn with_uncredited_log(mut self, log: Arc<dyn UncreditedLog>) -> Self {
        self.uncredited = Some(log);
        self
    }

    /// Подписка на тики, уведомления и сигнал сохранения сессии
    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.events.subscribe()
    }

    pub fn day_policy(&self) -> DayPolicy {
        self.day_policy
    }

    /// Безопасная блокировка snapshot с обработкой poisoned mutex
    pub(crate) fn lock_snapshot(&self) -> Result<MutexGuard<'_, Option<TimerSnapshot>>, TimerError> {
        self.snapshot
            .lock()
            .map_err(|e| TimerError::Internal(format!("Mutex poisoned: {}", e)))
    }

    pub(crate) fn current_snapshot(&self) -> Result<Option<TimerSnapshot>, TimerError> {
        Ok(self.lock_snapshot()?.clone())
    }

    pub(crate) fn set_snapshot(&self, snapshot: Option<TimerSnapshot>) -> Result<(), TimerError> {
        *self.lock_snapshot()? = snapshot;
        Ok(())
    }

    pub fn state(&self) -> Result<TimerState, TimerError> {
        Ok(self
            .lock_snapshot()?
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(TimerState::Idle))
    }

    /// Значение, которое последним показал тикер
    pub fn displayed_seconds(&self) -> u64 {
        self.displayed_seconds.load(Ordering::Relaxed)
    }

    /// Занять single-flight флаг; вызывающий обязан сбросить его через scopeguard
    pub(crate) fn try_begin(&self, operation: &str) -> Result<(), TimerError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[TIMER] {} rejected: another operation in progress", operation);
            return Err(TimerError::Busy);
        }
        Ok(())
    }

    pub(crate) fn notify(&self, kind: NoticeKind, level: NoticeLevel, message: impl Into<String>) {
        let notice = Notice::new(kind, level, message);
        if !self.gate.admit(&notice, self.clock.now_millis()) {
            debug!("[NOTIFY] Suppressed duplicate: {}", notice.message);
            return;
        }
        info!("[NOTIFY] {:?}/{:?}: {}", notice.kind, notice.level, notice.message);
        // Нет подписчиков - не ошибка
        let _ = self.events.send(TimerEvent::Notice(notice));
    }
}

impl Drop for TimerEngine {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}
