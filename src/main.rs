//! The broker daemon: one long-running process per node.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info, LevelFilter};

use grid_broker::{Broker, Config, ConfigError, Timings};

/// Log targets a deployment can tune individually via `RUST_LOG`.
const LOGGERS: &[&str] = &[
    "grid_broker::broker",
    "grid_broker::clock",
    "grid_broker::config",
    "grid_broker::connection",
    "grid_broker::dispatch",
    "grid_broker::scheduler",
    "grid_broker::transport",
];

#[derive(Parser, Debug)]
#[command(
    name = "grid-broker",
    version,
    about = "Peer-to-peer coordination broker for distributed grid control agents"
)]
struct Cli {
    /// Path to the main configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "grid-broker.cfg")]
    config: PathBuf,

    /// Path to the timings file (overrides the config file's entry).
    #[arg(long, value_name = "FILE")]
    timings: Option<PathBuf>,

    /// Log verbosity 0-8 (overrides the config file's entry).
    #[arg(short, long, value_name = "LEVEL")]
    verbosity: Option<u8>,

    /// Print this node's peer id and exit.
    #[arg(long)]
    uuid: bool,

    /// Print the available log targets and exit.
    #[arg(long)]
    list_loggers: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list_loggers {
        for logger in LOGGERS {
            println!("{}", logger);
        }
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if cli.uuid {
        println!("{}", config.local_id());
        return ExitCode::SUCCESS;
    }

    env_logger::Builder::from_default_env()
        .filter_level(level_from_verbosity(config.verbosity))
        .init();

    let timings = match load_timings(&cli, &config) {
        Ok(timings) => timings,
        Err(e) => {
            error!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, timings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("broker failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, timings: Timings) -> Result<(), grid_broker::BrokerError> {
    let mut broker = Broker::new(&config, &timings).await?;

    // The standard phase rotation; module agents attach their handlers to
    // these slots.
    broker.register_module("gm", Duration::from_millis(timings.GM_PHASE_TIME));
    broker.register_module("sc", Duration::from_millis(timings.SC_PHASE_TIME));
    broker.register_module("lb", Duration::from_millis(timings.LB_PHASE_TIME));

    let handle = broker.handle();
    tokio::spawn(async move {
        if let Some(signal) = shutdown_signal().await {
            info!("caught {}; shutting down", signal);
            handle.stop();
        }
    });

    broker.run().await
}

/// Resolves on SIGINT or SIGTERM, naming the signal.
async fn shutdown_signal() -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("cannot install SIGTERM handler: {}", e);
            return None;
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => Some("SIGINT"),
            Err(e) => {
                error!("cannot wait for SIGINT: {}", e);
                None
            }
        },
        _ = term.recv() => Some("SIGTERM"),
    }
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut config = Config::load(&cli.config)?;
    if let Some(verbosity) = cli.verbosity {
        if verbosity > 8 {
            return Err(ConfigError::BadValue {
                key: "verbosity".to_string(),
                value: verbosity.to_string(),
            });
        }
        config.verbosity = verbosity;
    }
    Ok(config)
}

fn load_timings(cli: &Cli, config: &Config) -> Result<Timings, ConfigError> {
    let path = cli
        .timings
        .clone()
        .or_else(|| config.timings_config.as_ref().map(PathBuf::from))
        .ok_or_else(|| ConfigError::BadValue {
            key: "timings_config".to_string(),
            value: "<unset>".to_string(),
        })?;
    Timings::load(&path)
}

/// Maps the 0-8 verbosity scale onto log levels.
fn level_from_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 | 3 => LevelFilter::Warn,
        4 | 5 => LevelFilter::Info,
        6 | 7 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
