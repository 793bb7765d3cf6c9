use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use headwatch::daemon::{ensure_single_instance, is_daemon_running, running_pid, stop_daemon};
use headwatch::events::EventLog;
use headwatch::{Config, Daemon, StartupConflict};

/// Another instance is already running
const EXIT_STARTUP_CONFLICT: u8 = 1;
/// Any unhandled error
const EXIT_FATAL: u8 = 255;

#[derive(Parser)]
#[command(name = "headwatch")]
#[command(about = "Branch-tracking git mirror synchronization daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(short = 'F', long)]
        foreground: bool,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon state, stored revisions and recent events
    Status {
        /// Number of events to show
        #[arg(long, default_value_t = 10)]
        events: usize,
    },

    /// Sync every tracked head once and exit
    Sync,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match execute(cli.command, cli.verbose, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.downcast_ref::<StartupConflict>().is_some() => {
            eprintln!("fatal: {}", e);
            ExitCode::from(EXIT_STARTUP_CONFLICT)
        }
        Err(e) => {
            error!("headwatch must terminate: {:?}", e);
            eprintln!("fatal: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn execute(command: Commands, verbose: bool, config: &Config) -> Result<()> {
    match command {
        Commands::Start { foreground } => {
            // Checked before detaching so the conflict reaches the terminal
            ensure_single_instance(config)?;

            if !foreground {
                detach(config)?;
            }

            init_logging(verbose, config, foreground)?;
            runtime()?.block_on(cmd_start(config))
        }
        Commands::Stop => {
            init_logging(verbose, config, true)?;
            cmd_stop(config)
        }
        Commands::Status { events } => {
            init_logging(verbose, config, true)?;
            cmd_status(config, events)
        }
        Commands::Sync => {
            init_logging(verbose, config, true)?;
            ensure_single_instance(config)?;
            runtime()?.block_on(cmd_sync(config))
        }
    }
}

#[cfg(unix)]
fn detach(config: &Config) -> Result<()> {
    Daemon::daemonize(config)
}

#[cfg(not(unix))]
fn detach(_config: &Config) -> Result<()> {
    anyhow::bail!("Background daemon mode not supported on this platform; use --foreground")
}

/// Single-threaded runtime: heads are processed strictly one at a time
fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Initialize logging based on configuration and verbosity
fn init_logging(verbose: bool, config: &Config, interactive: bool) -> Result<()> {
    let default_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // Background stdout is the log file
    let layer = fmt::layer().with_ansi(interactive);
    let layer = if config.logging.format == "full" {
        layer.with_target(true).with_thread_ids(true).boxed()
    } else {
        layer.compact().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
}

async fn cmd_start(config: &Config) -> Result<()> {
    let mut daemon = Daemon::new(config.clone()).await?;
    daemon.run().await
}

async fn cmd_sync(config: &Config) -> Result<()> {
    let mut daemon = Daemon::new(config.clone()).await?;
    let processed = daemon.startup_pass().await?;

    info!("Sync complete");
    println!("Processed {} of {} heads", processed, config.repos.len());
    Ok(())
}

fn cmd_stop(config: &Config) -> Result<()> {
    if !is_daemon_running(config)? {
        println!("No daemon appears to be running");
        return Ok(());
    }

    match stop_daemon(config)? {
        Some(pid) => println!("Shutdown signal sent to pid {}", pid),
        None => println!("No daemon appears to be running"),
    }
    Ok(())
}

fn cmd_status(config: &Config, event_limit: usize) -> Result<()> {
    println!("headwatch status");

    match running_pid(config)? {
        Some(pid) => println!("   Daemon: running (pid {})", pid),
        None => println!("   Daemon: not running"),
    }
    println!("   Mirrors: {}", config.repo_root);
    println!("   Hints: {}", config.hint_dir);

    let store = headwatch::StateStore::inspect(&config.state_dir, &config.repos)?;
    println!("   State: {}", store.dir().display());
    println!();
    println!("Tracked heads ({}):", config.repos.len());
    for head in config.repos.heads() {
        println!("   {:<40} {}", head.key(), store.get(&head).unwrap_or("-"));
    }

    if config.events.enabled && Path::new(&config.events.database).exists() {
        let events = EventLog::open_at(Path::new(&config.events.database))?.recent(event_limit)?;
        if !events.is_empty() {
            println!();
            println!("Recent events:");
            for event in events {
                println!(
                    "   {} {:<10} {:<30} {}",
                    event.timestamp.format("%Y/%m/%d %H:%M:%S"),
                    event.event_type.as_str(),
                    event.head.as_deref().unwrap_or(""),
                    event.revision.as_deref().unwrap_or(&event.summary)
                );
            }
        }
    }

    Ok(())
}
