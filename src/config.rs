use crate::clock::DayPolicy;
use crate::ledger::DAILY_CAP_HOURS;
use std::path::PathBuf;
use std::str::FromStr;
use std::{env, io};
use tracing::warn;

/// Конфигурация ledger клиента (api_base_url, ключ, таймауты, app_version)
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub api_base_url: String,
    /// Project API key sent as `apikey` header
    pub api_key: Option<String>,
    pub http_timeout_secs: u64,
    /// App version sent in X-App-Version header for debugging version skew
    pub app_version: String,
    pub daily_cap_hours: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:54321".to_string(),
            api_key: None,
            http_timeout_secs: 30,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            daily_cap_hours: DAILY_CAP_HOURS,
        }
    }
}

/// Timer rules: day boundary, minimum session length, display refresh rate.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    pub utc_offset_minutes: i32,
    /// Sessions shorter than this are discarded on end
    pub min_session_seconds: u64,
    pub tick_interval_ms: u64,
    /// Identical notices inside this window are shown once
    pub notice_window_ms: i64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: DayPolicy::DEFAULT_OFFSET_MINUTES,
            min_session_seconds: 60,
            tick_interval_ms: 100,
            notice_window_ms: 1000,
        }
    }
}

impl TimerConfig {
    pub fn day_policy(&self) -> DayPolicy {
        DayPolicy::from_offset_minutes(self.utc_offset_minutes).unwrap_or_else(|| {
            warn!(
                "[CONFIG] Invalid UTC offset {} minutes, falling back to default",
                self.utc_offset_minutes
            );
            DayPolicy::default()
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub db_path: Option<PathBuf>,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub ledger: LedgerConfig,
    pub timer: TimerConfig,
}

impl AppConfig {
    /// Собрать конфигурацию из переменных окружения HOURFORGE_*
    /// Невалидные значения логируются и заменяются дефолтами.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.db_path = env_string("HOURFORGE_DB_PATH").map(PathBuf::from);
        config.user_id = env_string("HOURFORGE_USER_ID");
        config.access_token = env_string("HOURFORGE_ACCESS_TOKEN");
        config.refresh_token = env_string("HOURFORGE_REFRESH_TOKEN");

        if let Some(url) = env_string("HOURFORGE_API_URL") {
            config.ledger.api_base_url = url.trim_end_matches('/').to_string();
        }
        config.ledger.api_key = env_string("HOURFORGE_API_KEY");
        if let Some(secs) = env_parsed("HOURFORGE_HTTP_TIMEOUT_SECS") {
            config.ledger.http_timeout_secs = secs;
        }
        if let Some(minutes) = env_parsed("HOURFORGE_UTC_OFFSET_MINUTES") {
            config.timer.utc_offset_minutes = minutes;
        }

        config
    }

    /// Путь к БД: явный HOURFORGE_DB_PATH или `<data dir>/hourforge.db`
    pub fn resolve_db_path(&self) -> io::Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(default_data_dir()?.join("hourforge.db")),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("[CONFIG] Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}

/// $XDG_STATE_HOME/hourforge, $HOME/.local/state/hourforge or %APPDATA%\hourforge
pub fn default_data_dir() -> io::Result<PathBuf> {
    let base = if cfg!(windows) {
        env::var("APPDATA").map(PathBuf::from).ok()
    } else {
        env::var("XDG_STATE_HOME")
            .map(PathBuf::from)
            .or_else(|_| env::var("HOME").map(|home| PathBuf::from(home).join(".local/state")))
            .ok()
    };
    let mut path = base.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "Couldn't find neither XDG_STATE_HOME, HOME nor APPDATA",
        )
    })?;
    path.push("hourforge");

    match std::fs::create_dir_all(&path) {
        Ok(_) => Ok(path),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(path),
        Err(e) => Err(e),
    }
}
