use crate::auth::AuthManager;
use crate::engine::{elapsed_seconds, RestoreOutcome, TimerEngine, TimerState};
use crate::ledger::Ledger;
use crate::notify::{NoticeKind, NoticeLevel};
use crate::Database;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn};

impl TimerEngine {
    /// Инициализация с базой данных: snapshot slot и uncredited журнал в SQLite
    pub fn with_db(db: Arc<Database>, ledger: Arc<dyn Ledger>, auth: Arc<AuthManager>) -> Self {
        Self::new(db.clone(), ledger, auth).with_uncredited_log(db)
    }

    /// Восстановить сессию из store (один раз при запуске).
    /// GUARD: НИКОГДА не падает; любая проблема = старт с Idle
    pub async fn restore(&self) -> RestoreOutcome {
        if self.auth.current_user().await.is_none() {
            // Snapshot не трогаем: он принадлежит тому, кто войдет
            info!("[RECOVERY] No authenticated user, leaving stored session untouched");
            return RestoreOutcome::SignedOut;
        }

        match self.current_snapshot() {
            Ok(Some(active)) => {
                warn!(
                    "[RECOVERY] Session {} already active in memory, skipping restore",
                    active.session_id
                );
                return RestoreOutcome::Resumed {
                    state: active.state,
                    elapsed_seconds: elapsed_seconds(&active, self.clock.now_millis()),
                };
            }
            Ok(None) => {}
            Err(e) => {
                error!("[RECOVERY] {}. Starting with default state.", e);
                return RestoreOutcome::Fresh;
            }
        }

        self.adopt_stored_session()
    }

    /// Сессия из store → память: stale удаляется, idle игнорируется, активная подхватывается.
    /// Вызывается только когда в памяти сессии нет.
    pub(crate) fn adopt_stored_session(&self) -> RestoreOutcome {
        let Some(snapshot) = self.store.load() else {
            // Нет сохраненного состояния - это нормально для первого запуска
            info!("[RECOVERY] No saved session found, starting fresh");
            return RestoreOutcome::Fresh;
        };

        let now = self.clock.now();
        let today = self.day_policy.date_string(now);

        if snapshot.date != today {
            info!(
                "[RECOVERY] Day changed ({} → {}), discarding session {}",
                snapshot.date, today, snapshot.session_id
            );
            if let Err(e) = self.store.clear() {
                error!("[RECOVERY] Failed to clear stale snapshot: {}", e);
            }
            self.displayed_seconds.store(0, Ordering::Relaxed);
            return RestoreOutcome::DiscardedStale {
                date: snapshot.date,
            };
        }

        if snapshot.state == TimerState::Idle {
            info!("[RECOVERY] Saved session is idle, starting fresh");
            return RestoreOutcome::Fresh;
        }

        // Пересчет сразу, не дожидаясь первого тика
        let elapsed = elapsed_seconds(&snapshot, now.timestamp_millis());
        let state = snapshot.state;
        let session_id = snapshot.session_id.clone();
        if let Err(e) = self.set_snapshot(Some(snapshot)) {
            error!("[RECOVERY] {}. Starting with default state.", e);
            return RestoreOutcome::Fresh;
        }
        self.displayed_seconds.store(elapsed, Ordering::Relaxed);
        if state == TimerState::Running {
            self.start_ticker();
        }

        info!(
            "[RECOVERY] Restored session {}: state={}, elapsed={}s",
            session_id, state, elapsed
        );
        self.notify(NoticeKind::Restore, NoticeLevel::Info, "Timer session restored!");
        RestoreOutcome::Resumed {
            state,
            elapsed_seconds: elapsed,
        }
    }
}
