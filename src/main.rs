//! CLI entry point for sensorbus
//!
//! Provides commands for:
//! - Polling every enabled sensor and printing or recording samples
//! - Watching interrupt-driven counters
//! - Listing configured connections and driver descriptors
//! - Switching outputs on and off
//! - Checking configuration and platform access
//!
//! # Usage
//!
//! ```bash
//! sensorbus --config config/sensorbus.toml run --interval-ms 500 --count 10
//! sensorbus watch --seconds 30
//! sensorbus list --json
//! sensorbus set relay on
//! sensorbus check
//! ```
//!
//! Exit codes: `0` success, `1` runtime failure, `2` configuration or
//! library load failure.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sensorbus::acquisition::shutdown_channel;
use sensorbus::config::{AppConfig, DEFAULT_CONFIG_PATH};
use sensorbus::error::AppError;
use sensorbus::logging;
use sensorbus::core::SwitchCommand;
use sensorbus::session::{describe_sensors, describe_sensors_json, open_board, Session};
use sensorbus::sink::{ConsoleSink, CsvRecorder};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sensorbus")]
#[command(about = "Sensor polling and interrupt monitoring", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every enabled sensor until Ctrl-C or --count rounds
    Run {
        /// Polling interval in milliseconds (overrides config)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many rounds (overrides config)
        #[arg(long)]
        count: Option<u64>,

        /// Append samples to a CSV file (overrides config)
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Print interrupt counter values once per interval
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// List configured sensors and their connections
    List {
        /// Print sensors with their driver descriptors as JSON
        #[arg(long)]
        json: bool,
    },

    /// Switch an output: on, off or toggle
    Set {
        /// Sensor id of a switchable output
        id: String,

        /// Command to apply
        state: SwitchCommand,
    },

    /// Validate configuration, load native libraries and open the platform
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = dispatch(cli).await {
        let code = err
            .downcast_ref::<AppError>()
            .map(AppError::exit_code)
            .unwrap_or(1);
        eprintln!("Error: {:#}", err);
        std::process::exit(code);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let config = AppConfig::load_from(&cli.config)?;
    logging::init_from_config(&config)?;
    info!(config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Commands::Run {
            interval_ms,
            count,
            csv,
        } => run(config, interval_ms, count, csv).await,
        Commands::Watch { seconds } => watch(config, seconds).await,
        Commands::List { json } => list(&config, json),
        Commands::Set { id, state } => set(config, &id, state).await,
        Commands::Check => check(&config),
    }
}

async fn run(
    mut config: AppConfig,
    interval_ms: Option<u64>,
    count: Option<u64>,
    csv: Option<PathBuf>,
) -> Result<()> {
    if let Some(ms) = interval_ms {
        config.acquisition.interval_ms = ms;
    }
    if count.is_some() {
        config.acquisition.max_samples = count;
    }
    if csv.is_some() {
        config.recording.csv_path = csv;
    }

    let csv_path = config.recording.csv_path.clone();
    let session = Session::start(config).await?;

    let mut polling = session
        .polling_loop()
        .with_sink(Box::new(ConsoleSink::stdout()));
    if let Some(path) = csv_path {
        let recorder = CsvRecorder::open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        polling = polling.with_sink(Box::new(recorder));
    }

    let (handle, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            handle.trigger();
        }
    });

    let summary = polling.run(shutdown).await?;
    println!();
    print!("{}", summary);
    Ok(())
}

async fn watch(config: AppConfig, seconds: Option<u64>) -> Result<()> {
    let interval = Duration::from_millis(config.acquisition.interval_ms.max(1));
    let session = Session::start(config).await?;

    let counters = session.counters();
    if counters.is_empty() {
        warn!("No interrupt counters configured");
        return Ok(());
    }
    let mut faults = session.fault_channel(64);

    let deadline = async {
        match seconds {
            Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                break;
            }
            _ = &mut deadline => break,
            Some(fault) = faults.recv() => {
                eprintln!(
                    "fault on {} (handler {}, edge #{}): {}",
                    fault.line, fault.handler, fault.sequence, fault.message
                );
            }
            _ = ticker.tick() => {
                let line = counters
                    .iter()
                    .map(|(id, counter)| format!("{}={}", id, counter.count()))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!("{}", line);
            }
        }
    }

    for (id, source) in session.interrupt_sources() {
        let stats = source.line().stats();
        info!(sensor = %id, ?stats, "Interrupt line statistics");
    }
    Ok(())
}

fn list(config: &AppConfig, json: bool) -> Result<()> {
    if json {
        println!("{}", describe_sensors_json(config)?);
    } else {
        print!("{}", describe_sensors(config)?);
    }
    Ok(())
}

async fn set(config: AppConfig, id: &str, command: SwitchCommand) -> Result<()> {
    let session = Session::start(config).await?;
    let on = session.command(id, command).await?;
    println!("{}: {}", id, if on { "on" } else { "off" });
    Ok(())
}

fn check(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let board = open_board(config)?;

    println!("Configuration OK");
    println!("Platform: {}", board.platform_name());
    for library in board.libraries() {
        println!("Library: {}", library);
    }
    println!(
        "Sensors: {} enabled of {}",
        config.enabled_sensors().len(),
        config.sensors.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_parses_command() {
        let cli = Cli::try_parse_from(["sensorbus", "set", "relay", "toggle"]).unwrap();
        match cli.command {
            Commands::Set { id, state } => {
                assert_eq!(id, "relay");
                assert_eq!(state, SwitchCommand::Toggle);
            }
            _ => panic!("expected set"),
        }
        assert!(Cli::try_parse_from(["sensorbus", "set", "relay", "dim"]).is_err());
    }

    #[test]
    fn test_list_json_flag() {
        let cli = Cli::try_parse_from(["sensorbus", "list", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::List { json: true }));
    }
}
