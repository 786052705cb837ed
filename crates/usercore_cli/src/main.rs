//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `usercore` linkage and storage.
//! - Keep output deterministic for quick local sanity checks.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use usercore::db::{open_db_with_config, DEFAULT_BUSY_TIMEOUT_MS};
use usercore::{
    default_log_level, init_logging, DbConfig, RequestContext, SqliteUserRepository, UserFilter,
    UserService,
};

#[derive(Debug, Parser)]
#[command(name = "usercore_cli", about = "Probe a usercore database")]
struct Args {
    /// Database file. Omit to probe a throwaway in-memory database.
    #[arg(long)]
    db: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    busy_timeout_ms: u64,
    /// Absolute directory for rolling log files. Logging is off when omitted.
    #[arg(long)]
    log_dir: Option<String>,
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("usercore_cli error={err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    if let Some(log_dir) = args.log_dir.as_deref() {
        let level = args.log_level.as_deref().unwrap_or(default_log_level());
        init_logging(level, log_dir).context("failed to initialize logging")?;
    }

    let config = DbConfig {
        path: args.db.clone(),
        busy_timeout_ms: args.busy_timeout_ms,
    };
    let conn = open_db_with_config(&config).context("failed to open database")?;
    let repo = SqliteUserRepository::try_new(&conn)?.with_busy_timeout(config.busy_timeout());
    let service = UserService::new(repo);

    let ctx = RequestContext::with_timeout(Duration::from_secs(5));
    service.ping(&ctx).context("database ping failed")?;
    let active = service.count_users(&ctx, &UserFilter::default())?;
    let total = service.count_users(
        &ctx,
        &UserFilter {
            include_deleted: true,
            ..UserFilter::default()
        },
    )?;

    println!("usercore version={}", usercore::core_version());
    println!("usercore ping=ok");
    println!("usercore users_active={active} users_total={total}");
    Ok(())
}
