//! CanSat ground station CLI
//!
//! Command-line front end for the ground-station backend.
//!
//! # Commands
//!
//! - `init` - Write a station configuration file
//! - `run` - Ingest telemetry and replicate it to the backend
//! - `resolve` - Show how a replication target is normalised

mod commands;

use cansat_station::{env_filter, StationError};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code for errors the operator can fix by changing the command line or
/// the configuration.
const USAGE_EXIT_CODE: u8 = 2;

/// CanSat ground station.
#[derive(Parser)]
#[command(name = "cansat-gs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the station configuration file
    #[arg(global = true, short, long, default_value = "station.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a station configuration file
    Init {
        /// Station name
        #[arg(short, long, default_value = "ground-station")]
        name: String,

        /// Backend URL of the telemetry database
        #[arg(long, requires = "log_url")]
        data_url: Option<String>,

        /// Backend URL of the log database
        #[arg(long, requires = "data_url")]
        log_url: Option<String>,

        /// Backend user name
        #[arg(short, long, default_value = "")]
        username: String,

        /// Backend password
        #[arg(short, long, default_value = "")]
        password: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Ingest telemetry and replicate it to the backend
    Run {
        /// Read telemetry from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show how a replication target is normalised
    Resolve {
        /// Database name or URL
        target: String,
    },

    /// Show version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(exit_code(err.as_ref()))
        }
    }
}

fn exit_code(err: &(dyn std::error::Error + 'static)) -> u8 {
    match err.downcast_ref::<StationError>() {
        Some(err) if err.is_user_error() => USAGE_EXIT_CODE,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // `run` installs its own subscriber so station logs reach the log store.
    if let Commands::Run { input, format } = &cli.command {
        return commands::run::run(&cli.config, input.as_deref(), cli.verbose, format);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(cli.verbose))
        .init();

    match cli.command {
        Commands::Init {
            name,
            data_url,
            log_url,
            username,
            password,
            force,
        } => {
            let target = data_url.zip(log_url);
            commands::init::run(&cli.config, name, target, username, password, force)?;
        }
        Commands::Resolve { target } => {
            commands::resolve::run(&target)?;
        }
        Commands::Run { .. } => {}
        Commands::Version => {
            println!("CanSat ground station v{}", env!("CARGO_PKG_VERSION"));
            println!("CanSat Station v{}", cansat_station::VERSION);
            println!("CanSat Replication v{}", cansat_replication::VERSION);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cansat_replication::SyncError;

    #[test]
    fn operator_errors_exit_with_usage_code() {
        let err: Box<dyn std::error::Error> =
            Box::new(StationError::Config("name must not be empty".into()));
        assert_eq!(exit_code(err.as_ref()), USAGE_EXIT_CODE);

        let err: Box<dyn std::error::Error> =
            Box::new(StationError::Sync(SyncError::InvalidTarget("bad port".into())));
        assert_eq!(exit_code(err.as_ref()), USAGE_EXIT_CODE);
    }

    #[test]
    fn environment_errors_exit_with_failure() {
        let err: Box<dyn std::error::Error> =
            Box::new(StationError::Io(std::io::Error::other("disk full")));
        assert_eq!(exit_code(err.as_ref()), 1);

        let err: Box<dyn std::error::Error> = "unexpected".into();
        assert_eq!(exit_code(err.as_ref()), 1);
    }

    #[test]
    fn overwrite_refusal_is_an_operator_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("station.json");
        std::fs::write(&path, "{}").unwrap();

        let err = commands::init::run(
            &path,
            "icarus".into(),
            None,
            String::new(),
            String::new(),
            false,
        )
        .unwrap_err();
        assert_eq!(exit_code(err.as_ref()), USAGE_EXIT_CODE);
    }
}
