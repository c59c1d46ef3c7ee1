//! BunkLogs CLI - inspect and manage the dashboard session from a terminal.
//!
//! Every command starts the session the same way the dashboard does: load the
//! stored tokens, settle on a status, and only then act.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use bunklogs_core::auth::SessionFailure;
use bunklogs_core::window::{self, earliest_submission_day, is_within_submission_window};
use bunklogs_core::{Config, Identity, LoginTokens, SessionGuard, SessionStatus};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log file written in the cache directory
const LOG_FILE: &str = "bunklogs.log";

const USAGE: &str = "\
Usage: bunklogs <command>

Commands:
  status                    Show whether a session is active and as whom
  login [ACCESS] [REFRESH]  Adopt tokens from a completed sign-in (prompts if omitted)
  refresh                   Exchange the refresh token for a new access token
  logout                    Forget both tokens
  get PATH                  Authorized GET against the backend, prints JSON
  check-date YYYY-MM-DD     Can the signed-in user submit a log for this day?
  help                      Show this message

Environment: BUNKLOGS_API_URL, BUNKLOGS_TOKEN_STORAGE, BUNKLOGS_TOKEN_PASSPHRASE, RUST_LOG";

/// Initialize the tracing subscriber for logging.
/// Returns the guard that flushes the file log on exit.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) if std::fs::create_dir_all(&dir).is_ok() => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("status");
    if matches!(command, "help" | "--help" | "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    let _log_guard = init_tracing(&config);
    info!(command = command, "bunklogs starting");

    let (session, api) = bunklogs_core::session_from_config(&config)?;
    let status = session.initialize().await;

    match command {
        "status" => print_status(&session, status),
        "login" => {
            let identity = login(&session, &args[1..])?;
            config.last_email = Some(identity.email);
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
        }
        "refresh" => {
            let status = session.refresh().await;
            print_status(&session, status);
        }
        "logout" => {
            session.logout();
            println!("Signed out.");
        }
        "get" => {
            let path = args.get(1).context("get needs a PATH")?;
            let value: serde_json::Value = api.get_with_session(&session, path).await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        "check-date" => {
            let raw = args.get(1).context("check-date needs a date")?;
            check_date(&session, raw)?;
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("Unknown command '{}'", other);
        }
    }

    Ok(())
}

fn print_status(session: &SessionGuard, status: SessionStatus) {
    match session.get_identity() {
        Some(identity) => {
            println!("Signed in as {} ({}, id {})", identity.email, identity.role, identity.id);
            if let Some(expiry) = session.expires_at() {
                let local = expiry.with_timezone(&chrono::Local);
                println!("Access token valid until {}", local.format("%Y-%m-%d %H:%M:%S"));
            }
            println!("Dashboard: {}", identity.role.home_route());
        }
        None => {
            println!("Not signed in ({:?}).", status);
            if let Some(reason) = session.last_failure() {
                println!("{}", sign_in_hint(&reason));
            }
        }
    }
}

fn sign_in_hint(reason: &SessionFailure) -> &'static str {
    match reason {
        SessionFailure::NetworkFailure | SessionFailure::Timeout => {
            "Could not reach the server to renew the session. Sign in again when back online."
        }
        _ => "Your session has ended. Please sign in again.",
    }
}

fn login(session: &SessionGuard, args: &[String]) -> Result<Identity> {
    let access = match args.first() {
        Some(token) => token.clone(),
        None => rpassword::prompt_password("Access token: ")?,
    };
    let refresh = match args.get(1) {
        Some(token) => Some(token.clone()),
        None if args.is_empty() => {
            let token = rpassword::prompt_password("Refresh token (optional): ")?;
            Some(token.trim().to_string()).filter(|t| !t.is_empty())
        }
        None => None,
    };

    let identity = session
        .login(LoginTokens::new(access.trim(), refresh))
        .context("Login failed")?;
    println!("Signed in as {} ({})", identity.email, identity.role);
    io::stdout().flush()?;
    Ok(identity)
}

fn check_date(session: &SessionGuard, raw: &str) -> Result<()> {
    let Some(date) = window::parse_day(raw) else {
        bail!("'{}' is not a YYYY-MM-DD date", raw);
    };
    let Some(identity) = session.get_identity() else {
        bail!("Sign in first; the submission window depends on your role");
    };

    let today = window::local_today();
    if is_within_submission_window(date, today, identity.role) {
        println!("{}: open for {}", window::format_day(date), identity.role);
    } else {
        let earliest = earliest_submission_day(today, identity.role)
            .map(window::format_day)
            .unwrap_or_else(|| "any past day".to_string());
        println!(
            "{}: closed for {} (allowed {} through {})",
            window::format_day(date),
            identity.role,
            earliest,
            window::format_day(today)
        );
    }
    Ok(())
}
