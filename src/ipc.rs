//! Centralized event names.
//! Prevents typos between the engine and whatever host listens to it.

/// Event names carried on the engine's broadcast channel
pub mod events {
    /// Display refresh while the timer runs. Never a source of truth.
    pub const TIMER_TICK: &str = "timer-tick";
    /// Gated user-facing status message
    pub const TIMER_NOTICE: &str = "timer-notice";
    /// Emitted once per committed session; listeners re-fetch aggregates.
    pub const TIMER_SAVED: &str = "timer-saved";
}
