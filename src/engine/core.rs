use crate::clock::format_date;
use crate::database::Database;
use crate::engine::{
    elapsed_seconds, format_hms, seconds_to_hours, EndOutcome, RestoreOutcome, TimerEngine,
    TimerError, TimerEvent, TimerState, TimerStatus,
};
use crate::ledger::LedgerError;
use crate::models::UncreditedSession;
use crate::notify::{NoticeKind, NoticeLevel};
use crate::snapshot::TimerSnapshot;
use chrono::{DateTime, Utc};
use scopeguard::guard;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

const SIGN_IN_MESSAGE: &str = "Please sign in to use the timer";

impl TimerEngine {
    /// Переход: Idle → Running.
    /// Сначала удаленная сессия, потом snapshot: при ошибке сети ничего не сохраняется.
    pub async fn start(&self) -> Result<(), TimerError> {
        let Some(user_id) = self.auth.current_user().await else {
            warn!("[TIMER] Start rejected: no authenticated user");
            self.notify(NoticeKind::Start, NoticeLevel::Error, SIGN_IN_MESSAGE);
            return Err(TimerError::NotAuthenticated);
        };

        self.try_begin("start")?;
        let _guard = guard((), |_| {
            self.busy.store(false, Ordering::Release);
        });

        let state = self.state()?;
        if state != TimerState::Idle {
            warn!("[FSM] Invalid transition: {} → running (session already active)", state);
            self.notify(
                NoticeKind::Start,
                NoticeLevel::Error,
                "Timer is already running or paused",
            );
            return Err(TimerError::AlreadyActive(state));
        }

        // В памяти пусто, но в store может лежать сегодняшняя сессия (restore без входа)
        if let RestoreOutcome::Resumed { state, .. } = self.adopt_stored_session() {
            warn!("[FSM] Invalid transition: {} → running (stored session adopted)", state);
            self.notify(
                NoticeKind::Start,
                NoticeLevel::Error,
                "Timer is already running or paused",
            );
            return Err(TimerError::AlreadyActive(state));
        }

        // Один и тот же момент для удаленной записи и для snapshot
        let now = self.clock.now();
        let date = self.day_policy.date_of(now);
        let session_id = match self
            .ledger
            .create_session(&user_id, self.day_policy.local_time(now), date)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("[TIMER] Failed to create remote session: {}", e);
                self.notify(
                    NoticeKind::Start,
                    NoticeLevel::Error,
                    "Failed to start timer. Please try again.",
                );
                return Err(e.into());
            }
        };

        let snapshot = TimerSnapshot::started(session_id, now.timestamp_millis(), format_date(date));
        if let Err(e) = self.store.save(&snapshot) {
            error!(
                "[TIMER] Session {} created but snapshot could not be saved: {}",
                snapshot.session_id, e
            );
            self.notify(
                NoticeKind::Start,
                NoticeLevel::Error,
                "Failed to start timer. Please try again.",
            );
            return Err(e.into());
        }

        info!(
            "[FSM] idle → running (session {}, date {})",
            snapshot.session_id, snapshot.date
        );
        self.set_snapshot(Some(snapshot))?;
        self.displayed_seconds.store(0, Ordering::Relaxed);
        self.start_ticker();
        self.notify(NoticeKind::Start, NoticeLevel::Success, "Timer started!");
        Ok(())
    }

    /// Переход: Running → Paused. В другом состоянии - no-op.
    pub fn pause(&self) -> Result<(), TimerError> {
        self.try_begin("pause")?;
        let _guard = guard((), |_| {
            self.busy.store(false, Ordering::Release);
        });

        let current = match self.current_snapshot()? {
            Some(s) if s.state == TimerState::Running => s,
            other => {
                debug!(
                    "[FSM] Ignored pause in state {}",
                    other.map(|s| s.state).unwrap_or(TimerState::Idle)
                );
                return Ok(());
            }
        };

        let now_ms = self.clock.now_millis();
        let paused = current.paused_at(now_ms);
        // Сначала store, потом память
        self.store.save(&paused)?;
        self.stop_ticker();

        let elapsed = elapsed_seconds(&paused, now_ms);
        self.displayed_seconds.store(elapsed, Ordering::Relaxed);
        self.set_snapshot(Some(paused))?;

        info!("[FSM] running → paused at {}s", elapsed);
        self.notify(NoticeKind::Pause, NoticeLevel::Info, "Timer paused");
        Ok(())
    }

    /// Переход: Paused → Running. В другом состоянии - no-op.
    pub fn resume(&self) -> Result<(), TimerError> {
        self.try_begin("resume")?;
        let _guard = guard((), |_| {
            self.busy.store(false, Ordering::Release);
        });

        let current = match self.current_snapshot()? {
            Some(s) if s.state == TimerState::Paused => s,
            other => {
                debug!(
                    "[FSM] Ignored resume in state {}",
                    other.map(|s| s.state).unwrap_or(TimerState::Idle)
                );
                return Ok(());
            }
        };

        let now_ms = self.clock.now_millis();
        let resumed = current.resumed_at(now_ms);
        self.store.save(&resumed)?;

        let elapsed = elapsed_seconds(&resumed, now_ms);
        self.displayed_seconds.store(elapsed, Ordering::Relaxed);
        self.set_snapshot(Some(resumed))?;
        self.start_ticker();

        info!("[FSM] paused → running at {}s", elapsed);
        self.notify(NoticeKind::Resume, NoticeLevel::Success, "Timer resumed!");
        Ok(())
    }

    /// Переход: Running | Paused → Idle с зачислением часов за сегодня.
    pub async fn end(&self) -> Result<EndOutcome, TimerError> {
        let Some(user_id) = self.auth.current_user().await else {
            warn!("[TIMER] End rejected: no authenticated user");
            self.notify(NoticeKind::End, NoticeLevel::Error, SIGN_IN_MESSAGE);
            return Err(TimerError::NotAuthenticated);
        };

        self.try_begin("end")?;
        let _guard = guard((), |_| {
            self.busy.store(false, Ordering::Release);
        });

        let current = match self.current_snapshot()? {
            Some(s) if s.state != TimerState::Idle => s,
            _ => {
                debug!("[FSM] Ignored end: timer is idle");
                return Ok(EndOutcome::NothingToEnd);
            }
        };
        let was_running = current.state == TimerState::Running;
        self.stop_ticker();

        let now = self.clock.now();
        // Для Paused идущая пауза уже учтена: отсчет до lastPauseTime
        let elapsed = elapsed_seconds(&current, now.timestamp_millis());

        if elapsed < self.config.min_session_seconds {
            if let Err(e) = self.store.clear() {
                self.resume_after_failed_end(was_running);
                return Err(e.into());
            }
            self.set_snapshot(None)?;
            self.displayed_seconds.store(0, Ordering::Relaxed);
            info!(
                "[FSM] {} → idle, session {} discarded ({}s < {}s)",
                current.state, current.session_id, elapsed, self.config.min_session_seconds
            );
            self.notify(
                NoticeKind::End,
                NoticeLevel::Info,
                "Session too short (less than 1 minute). Not saved.",
            );
            return Ok(EndOutcome::Discarded {
                elapsed_seconds: elapsed,
            });
        }

        let hours = seconds_to_hours(elapsed);
        // Часы идут в лог дня окончания сессии
        let today = self.day_policy.date_of(now);

        let credited = self
            .credit_session(&user_id, &current.session_id, now, elapsed, hours)
            .await;

        match credited {
            Ok(daily_total) => {
                self.finish_session(&current);
                info!(
                    "[FSM] {} → idle, session {} committed: {}s = {:.2}h, total today {:.2}h",
                    current.state, current.session_id, elapsed, hours, daily_total
                );
                self.notify(
                    NoticeKind::End,
                    NoticeLevel::Success,
                    format!(
                        "Session saved! Added {:.2}h to today's log. Total today: {:.2}h",
                        hours, daily_total
                    ),
                );
                let _ = self.events.send(TimerEvent::SessionSaved);
                Ok(EndOutcome::Committed {
                    session_id: current.session_id,
                    elapsed_seconds: elapsed,
                    hours,
                    daily_total,
                })
            }
            Err(err @ LedgerError::CapExceeded { .. }) => {
                // Сессия уже завершена удаленно; повтор end никогда не пройдет лимит
                warn!(
                    "[TIMER] Session {} finalized but not credited: {}",
                    current.session_id, err
                );
                self.record_uncredited(&user_id, &current, format_date(today), elapsed, hours, &err);
                self.finish_session(&current);
                self.notify(
                    NoticeKind::End,
                    NoticeLevel::Error,
                    format!("Session ended but not credited. {}", err),
                );
                Err(err.into())
            }
            Err(err) => {
                error!(
                    "[TIMER] Failed to save session {}: {}. Snapshot kept for retry",
                    current.session_id, err
                );
                self.resume_after_failed_end(was_running);
                self.notify(
                    NoticeKind::End,
                    NoticeLevel::Error,
                    format!("Failed to save session. Please try again. ({})", err),
                );
                Err(err.into())
            }
        }
    }

    /// Любое состояние → Idle без удаленной записи
    pub fn reset(&self) -> Result<(), TimerError> {
        self.try_begin("reset")?;
        let _guard = guard((), |_| {
            self.busy.store(false, Ordering::Release);
        });

        let previous = self.state()?;
        // Store первым: при ошибке движок остается в прежнем состоянии вместе с тикером
        self.store.clear()?;
        self.stop_ticker();
        self.set_snapshot(None)?;
        self.displayed_seconds.store(0, Ordering::Relaxed);

        info!("[FSM] {} → idle (reset)", previous);
        self.notify(NoticeKind::Reset, NoticeLevel::Info, "Timer reset");
        Ok(())
    }

    /// Одна кнопка: idle → start, running → pause, paused → resume
    pub async fn toggle(&self) -> Result<(), TimerError> {
        match self.state()? {
            TimerState::Idle => self.start().await,
            TimerState::Running => self.pause(),
            TimerState::Paused => self.resume(),
        }
    }

    /// Текущее состояние, пересчитанное из timestamp'ов прямо сейчас
    pub fn status(&self) -> Result<TimerStatus, TimerError> {
        let snapshot = self.current_snapshot()?;
        let elapsed = snapshot
            .as_ref()
            .map(|s| elapsed_seconds(s, self.clock.now_millis()))
            .unwrap_or(0);
        Ok(TimerStatus {
            state: snapshot.as_ref().map(|s| s.state).unwrap_or(TimerState::Idle),
            elapsed_seconds: elapsed,
            hours: seconds_to_hours(elapsed),
            formatted: format_hms(elapsed),
            session_id: snapshot.as_ref().map(|s| s.session_id.clone()),
            date: snapshot.map(|s| s.date),
        })
    }

    /// Сколько часов уже зачислено сегодня
    pub async fn today_hours(&self) -> Result<f64, TimerError> {
        let user_id = self
            .auth
            .current_user()
            .await
            .ok_or(TimerError::NotAuthenticated)?;
        let today = self.day_policy.date_of(self.clock.now());
        Ok(self.ledger.daily_hours(&user_id, today).await?)
    }

    /// finalize (идемпотентная перезапись) → добавить часы в лог дня окончания
    async fn credit_session(
        &self,
        user_id: &str,
        session_id: &str,
        ended_at: DateTime<Utc>,
        elapsed: u64,
        hours: f64,
    ) -> Result<f64, LedgerError> {
        self.ledger
            .finalize_session(user_id, session_id, self.day_policy.local_time(ended_at), elapsed)
            .await?;
        self.ledger
            .add_hours_to_daily_log(user_id, self.day_policy.date_of(ended_at), hours)
            .await
    }

    /// Snapshot больше не нужен: сессия зачислена или зачислена быть не может.
    fn finish_session(&self, finished: &TimerSnapshot) {
        if let Err(e) = self.store.clear() {
            error!(
                "[TIMER] Session {} finished but snapshot could not be cleared: {}",
                finished.session_id, e
            );
            // Хотя бы пометить idle, иначе следующий start подхватит уже зачисленную сессию
            if let Err(e) = self.store.save(&finished.finished()) {
                error!(
                    "[TIMER] Session {} could not be marked finished either: {}",
                    finished.session_id, e
                );
            }
        }
        if let Err(e) = self.set_snapshot(None) {
            error!("[TIMER] Failed to reset in-memory session: {}", e);
        }
        self.displayed_seconds.store(0, Ordering::Relaxed);
    }

    /// Snapshot не тронут; возвращаем тикер, если сессия шла
    fn resume_after_failed_end(&self, was_running: bool) {
        if was_running {
            self.start_ticker();
        }
    }

    fn record_uncredited(
        &self,
        user_id: &str,
        snapshot: &TimerSnapshot,
        date: String,
        elapsed: u64,
        hours: f64,
        reason: &LedgerError,
    ) {
        let Some(log) = &self.uncredited else {
            warn!(
                "[TIMER] No uncredited log configured, session {} ({:.2}h) only logged",
                snapshot.session_id, hours
            );
            return;
        };
        let entry = UncreditedSession {
            session_id: snapshot.session_id.clone(),
            user_id: user_id.to_string(),
            date,
            duration_seconds: elapsed,
            hours,
            reason: reason.to_string(),
            recorded_at: Database::now_timestamp(),
        };
        if let Err(e) = log.record(&entry) {
            error!(
                "[TIMER] Failed to record uncredited session {}: {}",
                snapshot.session_id, e
            );
        }
    }
}
