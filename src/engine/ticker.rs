use crate::engine::{elapsed_seconds, TimerEngine, TimerEvent, TimerState};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::debug;

impl TimerEngine {
    /// Запустить тикер отображения. Только пересчитывает значение из snapshot,
    /// сам ничего не накапливает. Завершается сам, когда состояние не Running.
    pub(crate) fn start_ticker(&self) {
        self.stop_ticker();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!("[TIMER] No async runtime, display ticker not started");
                return;
            }
        };

        let snapshot = self.snapshot.clone();
        let clock = self.clock.clone();
        let displayed = self.displayed_seconds.clone();
        let events = self.events.clone();
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));

        let task = handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let current = {
                    let guard = snapshot.lock().unwrap_or_else(|e| e.into_inner());
                    match guard.as_ref() {
                        Some(s) if s.state == TimerState::Running => {
                            elapsed_seconds(s, clock.now_millis())
                        }
                        _ => break,
                    }
                };
                if displayed.swap(current, Ordering::Relaxed) != current {
                    let _ = events.send(TimerEvent::Tick {
                        elapsed_seconds: current,
                    });
                }
            }
            debug!("[TIMER] Display ticker finished");
        });

        match self.ticker.lock() {
            Ok(mut slot) => *slot = Some(task),
            Err(e) => {
                task.abort();
                debug!("[TIMER] Ticker slot poisoned, ticker not started: {}", e);
            }
        }
    }

    pub(crate) fn stop_ticker(&self) {
        let mut slot = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker
            .lock()
            .map(|slot| slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}
