use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use mapharvest::configuration::config::Config;
use mapharvest::error_handling::types::SessionError;
use mapharvest::session_management::session_manager::SessionManager;
use mapharvest::storage::file_storage::availability_counts;

#[derive(Parser)]
#[command(name = "mapharvest")]
#[command(version)]
#[command(about = "Crash-safe persistence for map-listing extraction sessions")]
struct Args {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(long, env = "MAPHARVEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Recover a prior session and print its summary
    Resume { session_id: String },
    /// Export a session's records to CSV
    Export {
        session_id: String,
        /// Target file; defaults to a timestamped file in the data directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List recorded searches from the database tier
    History,
    /// Print aggregate statistics from the database tier
    Stats,
    /// Delete automatic snapshots older than the retention window
    Purge {
        /// Retention in days; defaults to the configured value
        #[arg(long)]
        days: Option<i64>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Unable to load configuration from {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    match run_command(args.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_command(command: Command, config: &Config) -> Result<(), SessionError> {
    match command {
        Command::Resume { session_id } => {
            let manager = SessionManager::with_session_id(config, &session_id)?;
            if manager.resume(&session_id) {
                let summary = manager.summary();
                println!("Session {}", summary.session_id);
                println!("  businesses: {}", summary.total_businesses);
                println!("  searches:   {}", summary.total_searches);
                if let Some(last) = summary.last_activity {
                    println!("  last activity: {}", last.to_rfc3339());
                }
                for name in summary.searches {
                    println!("  - {}", name);
                }
            } else {
                println!("No prior data for session {}", session_id);
            }
        }
        Command::Export { session_id, output } => {
            let manager = SessionManager::with_session_id(config, &session_id)?;
            if !manager.resume(&session_id) {
                println!("No prior data for session {}", session_id);
                return Ok(());
            }
            let path = manager.export_csv(output.as_deref())?;
            let summary = manager.summary();
            println!("Exported {} record(s) to {}", summary.total_businesses, path.display());
            let state_records = manager.database().map_or_else(Vec::new, |db| {
                db.list_businesses(None, None).unwrap_or_default()
            });
            if !state_records.is_empty() {
                println!("Field availability (database tier):");
                for (field, count) in availability_counts(&state_records) {
                    println!("  {}: {}/{}", field, count, state_records.len());
                }
            }
        }
        Command::History => {
            let manager = SessionManager::new(config)?;
            match manager.database() {
                Some(db) => {
                    let history = db.search_history()?;
                    if history.is_empty() {
                        println!("No searches recorded");
                    }
                    for entry in history {
                        println!(
                            "{}  {}  {} result(s) in {}s",
                            entry.timestamp.to_rfc3339(),
                            entry.search_name,
                            entry.result_count,
                            entry.duration_secs
                        );
                    }
                }
                None => println!("Database tier not configured"),
            }
        }
        Command::Stats => {
            let manager = SessionManager::new(config)?;
            match manager.database() {
                Some(db) => {
                    let stats = db.statistics()?;
                    println!("Total businesses: {}", stats.total_businesses);
                    println!("With phone:       {}", stats.with_phone);
                    println!("With website:     {}", stats.with_website);
                    match stats.average_rating {
                        Some(avg) => println!("Average rating:   {:.2}", avg),
                        None => println!("Average rating:   n/a"),
                    }
                    for (search, count) in stats.by_search {
                        println!("  {}: {}", search, count);
                    }
                }
                None => println!("Database tier not configured"),
            }
        }
        Command::Purge { days } => {
            let manager = SessionManager::new(config)?;
            let days = days.unwrap_or(config.snapshot_retention_days);
            match manager.purge_old_snapshots(days) {
                Some(deleted) => {
                    println!("Deleted {} automatic snapshot(s) older than {} day(s)", deleted, days)
                }
                None => println!("Database tier not configured"),
            }
        }
    }
    Ok(())
}
