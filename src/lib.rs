//! Persistent work-session timer: a crash-safe idle/running/paused state machine
//! whose elapsed time is derived from absolute timestamps, with sessions and
//! per-day hour totals recorded in a ledger under a 12-hour daily cap.

pub mod auth;
pub mod clock;
pub mod config;
pub mod database;
pub mod engine;
pub mod ipc;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod snapshot;

pub use database::Database;
pub use engine::{TimerEngine, TimerError, TimerEvent, TimerState};


/// Logging: RUST_LOG или `info` по умолчанию; пишем в stderr, stdout остается для вывода CLI.
/// Повторный вызов ничего не делает.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
