//! sheet-syncd: headless sheet sync daemon and CLI.
//!
//! Keeps a device's sheet store on disk in sync with a remote database kept
//! in a directory that several devices share.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use sheet_sync::{SyncConfig, SyncEvent, SyncStatus};
use sheet_syncd::{commands, Device};

#[derive(Parser, Debug)]
#[command(name = "sheet-syncd")]
#[command(about = "Offline-first sheet sync daemon")]
struct Args {
    /// Directory holding this device's sheet store
    #[arg(short, long, global = true, default_value = ".sheets")]
    data: PathBuf,

    /// Directory holding the shared remote database
    #[arg(short, long, global = true, default_value = ".remote")]
    remote: PathBuf,

    /// Optional YAML sync configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync continuously until Ctrl+C. Other commands must not use the same
    /// data directory meanwhile.
    Run {
        /// Seconds between remote polls
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,

        /// Re-enable sync if it was disabled
        #[arg(long)]
        enable: bool,
    },
    /// Run one sync cycle and exit
    Sync {
        /// Re-enable sync if it was disabled
        #[arg(long)]
        enable: bool,
    },
    /// Create a sheet
    Add {
        name: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Rename a sheet
    Rename { name: String, new_name: String },
    /// Replace a sheet's notes
    Note { name: String, text: String },
    /// Append a text column to a sheet
    AddColumn { name: String, column: String },
    /// Delete a sheet
    Delete { name: String },
    /// List sheets
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show sync status and pending work
    Status,
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let Some(path) = path else {
        return Ok(SyncConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    SyncConfig::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Refuse to sync while disabled, unless the user asked to re-enable.
async fn check_enabled(device: &Device, enable: bool) -> Result<()> {
    if let SyncStatus::Disabled { reason } = device.store.sync_status().await {
        if !enable {
            bail!("sync is disabled ({reason}); pass --enable to turn it back on");
        }
        info!("Re-enabling sync");
    }
    Ok(())
}

async fn run(device: Device, poll: Duration, enable: bool) -> Result<()> {
    check_enabled(&device, enable).await?;

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let _subscription = device.coordinator.events().subscribe(move |event| {
        let _ = events_tx.send(event);
    });

    if let Err(e) = device.coordinator.start().await {
        warn!("Initial sync failed: {}", e);
    }

    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    info!("Polling {} every {:?}", device.coordinator.zone(), poll);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }

            _ = ticker.tick() => {
                debug!("Polling remote ({:?})", device.coordinator.state());
                if let Err(e) = device.coordinator.on_remote_notification().await {
                    debug!("Poll failed: {}", e);
                }
            }

            Some(event) = events.recv() => match event {
                SyncEvent::SyncDisabled { reason } => {
                    error!("Sync disabled: {}", reason);
                    bail!("sync was disabled: {reason}");
                }
                SyncEvent::SyncPaused { retry_after_secs } => {
                    warn!("Sync paused; retrying in {}s", retry_after_secs);
                }
                SyncEvent::CycleCompleted { pulled, pushed } => {
                    if pulled + pushed > 0 {
                        info!("Synced: pulled {}, pushed {}", pulled, pushed);
                    }
                }
            },
        }
    }

    device.coordinator.stop();
    Ok(())
}

async fn sync(device: Device, enable: bool) -> Result<()> {
    check_enabled(&device, enable).await?;
    let report = device.sync_once().await?;
    println!("pulled {}, pushed {}", report.pulled, report.pushed);
    Ok(())
}

async fn list(device: &Device, json: bool) -> Result<()> {
    let sheets = commands::list(&device.store).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&sheets)?);
        return Ok(());
    }
    for sheet in sheets {
        let marker = match (sheet.uploaded, sheet.dirty.is_empty()) {
            (false, _) => "new",
            (true, false) => "edited",
            (true, true) => "synced",
        };
        println!("{:<24} {:<8} {}", sheet.name, marker, sheet.columns.join(", "));
        if !sheet.notes.is_empty() {
            println!("    {}", sheet.notes);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(args.config.as_deref())?;
    let device = Device::open(&args.data, &args.remote, &config)
        .await
        .with_context(|| format!("opening store in {}", args.data.display()))?;
    debug!(
        "Data {} / remote {}",
        args.data.display(),
        args.remote.display()
    );

    match args.command {
        Command::Run { poll_secs, enable } => {
            run(device, Duration::from_secs(poll_secs.max(1)), enable).await?
        }
        Command::Sync { enable } => sync(device, enable).await?,
        Command::Add { name, notes } => {
            commands::add_sheet(&device.store, &name, notes).await?;
        }
        Command::Rename { name, new_name } => {
            commands::rename_sheet(&device.store, &name, &new_name).await?
        }
        Command::Note { name, text } => commands::set_notes(&device.store, &name, &text).await?,
        Command::AddColumn { name, column } => {
            commands::add_column(&device.store, &name, &column).await?
        }
        Command::Delete { name } => commands::delete_sheet(&device.store, &name).await?,
        Command::List { json } => list(&device, json).await?,
        Command::Status => {
            let report = commands::status(&device.store, device.coordinator.zone()).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
