use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use hourforge_lib::auth::{AuthManager, UserSession};
use hourforge_lib::config::AppConfig;
use hourforge_lib::engine::{format_hms, EndOutcome, TimerStatus};
use hourforge_lib::ledger::{HttpLedger, Ledger, SqliteLedger};
use hourforge_lib::notify::NoticeKind;
use hourforge_lib::{Database, TimerEngine, TimerEvent, TimerState};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Parser)]
#[command(name = "hourforge", version, about = "Persistent work-session timer")]
struct Cli {
    /// SQLite file with the timer snapshot and the local ledger
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Record sessions in the remote ledger (HOURFORGE_API_URL) instead of the local database
    #[arg(long, global = true)]
    remote: bool,

    /// Signed-in user id (overrides HOURFORGE_USER_ID)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new session
    Start,
    Pause,
    Resume,
    /// End the session and credit its hours to today's log
    End,
    /// Drop the session without recording anything
    Reset,
    /// Start, pause or resume depending on the current state
    Toggle,
    Status,
    /// Show the running timer until Ctrl+C
    Watch,
    /// Hours already credited today
    Today,
    /// Sessions that ended but were rejected by the daily cap
    Uncredited,
}

#[tokio::main]
async fn main() -> Result<()> {
    hourforge_lib::init_logging();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if cli.db.is_some() {
        config.db_path = cli.db.clone();
    }
    if cli.user.is_some() {
        config.user_id = cli.user.clone();
    }

    let db_path = config
        .resolve_db_path()
        .context("Failed to resolve database path")?;
    let db = Arc::new(
        Database::new(&db_path.to_string_lossy())
            .with_context(|| format!("Failed to open database {}", db_path.display()))?,
    );

    let auth = Arc::new(AuthManager::new(
        config.ledger.api_base_url.clone(),
        config.ledger.api_key.clone(),
    ));
    if let Some(user_id) = config.user_id.clone() {
        auth.set_session(Some(UserSession {
            user_id,
            access_token: config.access_token.clone(),
            refresh_token: config.refresh_token.clone(),
        }))
        .await;
    }

    let ledger: Arc<dyn Ledger> = if cli.remote {
        Arc::new(HttpLedger::new(config.ledger.clone(), auth.clone()))
    } else {
        Arc::new(SqliteLedger::new(db.clone()).with_cap(config.ledger.daily_cap_hours))
    };

    let engine = TimerEngine::with_db(db.clone(), ledger, auth).with_config(config.timer.clone());
    let mut events = engine.subscribe();

    let restored = engine.restore().await;
    debug!("[TIMER] Restore outcome: {:?}", restored);

    let result = run(&cli, &engine, &db, config.user_id.as_deref(), &mut events).await;
    print_notices(&mut events);
    result
}

async fn run(
    cli: &Cli,
    engine: &TimerEngine,
    db: &Database,
    user_id: Option<&str>,
    events: &mut broadcast::Receiver<TimerEvent>,
) -> Result<()> {
    match cli.command {
        Command::Start => {
            engine.start().await?;
            print_status(&engine.status()?, cli.json)
        }
        Command::Pause => {
            engine.pause()?;
            print_status(&engine.status()?, cli.json)
        }
        Command::Resume => {
            engine.resume()?;
            print_status(&engine.status()?, cli.json)
        }
        Command::Reset => {
            engine.reset()?;
            print_status(&engine.status()?, cli.json)
        }
        Command::Toggle => {
            engine.toggle().await?;
            print_status(&engine.status()?, cli.json)
        }
        Command::Status => print_status(&engine.status()?, cli.json),
        Command::End => {
            let outcome = engine.end().await?;
            print_end(&outcome, cli.json)
        }
        Command::Watch => watch(engine, events, cli.json).await,
        Command::Today => {
            let hours = engine.today_hours().await?;
            let date = engine.day_policy().date_string(Utc::now());
            if cli.json {
                println!("{}", serde_json::json!({ "date": date, "hours": hours }));
            } else {
                println!("{}: {:.2}h credited", date, hours);
            }
            Ok(())
        }
        Command::Uncredited => {
            let user_id =
                user_id.context("No user. Pass --user or set HOURFORGE_USER_ID")?;
            let entries = db
                .list_uncredited(user_id)
                .context("Failed to read uncredited sessions")?;
            if cli.json {
                println!("{}", serde_json::to_string(&entries)?);
            } else if entries.is_empty() {
                println!("No uncredited sessions");
            } else {
                for entry in entries {
                    println!(
                        "{}  {}  {:.2}h  {}",
                        entry.date, entry.session_id, entry.hours, entry.reason
                    );
                }
            }
            Ok(())
        }
    }
}

async fn watch(
    engine: &TimerEngine,
    events: &mut broadcast::Receiver<TimerEvent>,
    json: bool,
) -> Result<()> {
    let status = engine.status()?;
    if status.state != TimerState::Running {
        return print_status(&status, json);
    }

    print!("{}", status.formatted);
    std::io::stdout().flush()?;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TimerEvent::Tick { elapsed_seconds }) => {
                    print!("\r{}", format_hms(elapsed_seconds));
                    std::io::stdout().flush()?;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    println!();
    Ok(())
}

fn print_status(status: &TimerStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
        return Ok(());
    }
    match (&status.session_id, &status.date) {
        (Some(id), Some(date)) => println!(
            "{} {} ({:.2}h)  session {} on {}",
            status.state, status.formatted, status.hours, id, date
        ),
        _ => println!("{} {}", status.state, status.formatted),
    }
    Ok(())
}

fn print_end(outcome: &EndOutcome, json: bool) -> Result<()> {
    match outcome {
        EndOutcome::NothingToEnd => {
            if json {
                println!("{}", serde_json::json!({ "result": "nothing_to_end" }));
            } else {
                println!("Timer is not running");
            }
        }
        EndOutcome::Discarded { elapsed_seconds } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "result": "discarded", "elapsed_seconds": elapsed_seconds })
                );
            }
        }
        EndOutcome::Committed {
            session_id,
            elapsed_seconds,
            hours,
            daily_total,
        } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "result": "committed",
                        "session_id": session_id,
                        "elapsed_seconds": elapsed_seconds,
                        "hours": hours,
                        "daily_total": daily_total,
                    })
                );
            } else {
                println!(
                    "Session {}: {} ({:.2}h), total today {:.2}h",
                    session_id,
                    format_hms(*elapsed_seconds),
                    hours,
                    daily_total
                );
            }
        }
    }
    Ok(())
}

/// Уведомления движка; restore-уведомление в CLI не показываем (оно на каждом запуске)
fn print_notices(events: &mut broadcast::Receiver<TimerEvent>) {
    loop {
        match events.try_recv() {
            Ok(TimerEvent::Notice(notice)) if notice.kind != NoticeKind::Restore => {
                eprintln!("{}", notice.message);
            }
            Ok(_) => {}
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
}
