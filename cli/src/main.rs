// meshrelay-cli — operator console for the relay selection loop
//
// Hosts the authoritative control loop, streams selection and candidate
// changes, and takes manual override commands on stdin.

mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshrelay_core::store::SledStorage;
use meshrelay_core::{
    AnnounceStore, ControlHandle, RelayControl, RelayControlConfig, RelayLoadState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "meshrelay")]
#[command(about = "MeshRelay — automatic relay selection", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop and stream its decisions
    Run {
        /// Data directory (defaults to the platform data dir)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
        /// Synthesize announce traffic instead of expecting a live mesh
        #[arg(long)]
        demo: bool,
        /// Also write rolling log files to this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            data_dir,
            demo,
            log_dir,
        } => cmd_run(data_dir, demo, log_dir).await,
        Commands::Config => cmd_config(),
    }
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "meshrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

fn resolve_data_dir(data_dir: Option<PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(dir) => Ok(dir),
        None => dirs::data_dir()
            .map(|base| base.join("meshrelay"))
            .context("no platform data directory; pass --data-dir"),
    }
}

fn cmd_config() -> Result<()> {
    let config = RelayControlConfig::default();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn cmd_run(data_dir: Option<PathBuf>, demo: bool, log_dir: Option<PathBuf>) -> Result<()> {
    let _log_guard = init_tracing(log_dir.as_ref());

    let data_dir = resolve_data_dir(data_dir)?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let config = RelayControlConfig::default();
    let backend = Arc::new(
        SledStorage::open(
            data_dir
                .join("relaystate")
                .to_str()
                .context("non-UTF8 data dir")?,
        )
        .map_err(anyhow::Error::msg)
        .context("opening storage")?,
    );
    let announces = Arc::new(AnnounceStore::new(backend.clone(), config.max_candidates));

    let control = RelayControl::start(announces.clone(), backend, config)
        .context("starting control loop")?;
    let handle = control.handle();

    handle.wait_ready().await?;
    println!("{}", "MeshRelay control loop ready".bold());
    print_selection(&handle.current_selection().await?);

    let mut selections = handle.subscribe_selection().await?;
    let selection_printer = tokio::spawn(async move {
        while selections.changed().await.is_ok() {
            let state = selections.borrow_and_update().clone();
            print_selection(&state);
        }
    });

    let mut telemetry = control.telemetry().subscribe();
    let telemetry_printer = tokio::spawn(async move {
        while let Ok(event) = telemetry.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{} {}", "telemetry".yellow().bold(), json),
                Err(e) => tracing::warn!(error = %e, "unprintable telemetry event"),
            }
        }
    });

    let feeder = demo.then(|| {
        println!("{}", "demo mode: synthesizing announces".dimmed());
        tokio::spawn(demo::feed_announces(announces.clone()))
    });

    println!(
        "{}",
        "commands: override <relay_id> | clear | auto on|off | relays | quit".dimmed()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !dispatch(&handle, &announces, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "stdin closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some(feeder) = feeder {
        feeder.abort();
    }
    selection_printer.abort();
    telemetry_printer.abort();
    control.shutdown().await;
    println!("{}", "stopped".bold());
    Ok(())
}

/// Handle one console command. Returns `false` to quit.
async fn dispatch(handle: &ControlHandle, announces: &AnnounceStore, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("quit") | Some("exit") => return false,
        Some("override") => match parts.next() {
            Some(relay_id) => {
                match handle.set_manual_override(Some(relay_id.to_string())).await {
                    Ok(()) => println!("  {} override set", "✓".green()),
                    Err(e) => println!("  {} {}", "✗".red(), e),
                }
            }
            None => println!("  usage: override <relay_id>"),
        },
        Some("clear") => match handle.set_manual_override(None).await {
            Ok(()) => println!("  {} override cleared", "✓".green()),
            Err(e) => println!("  {} {}", "✗".red(), e),
        },
        Some("auto") => {
            let enabled = match parts.next() {
                Some("on") => true,
                Some("off") => false,
                _ => {
                    println!("  usage: auto on|off");
                    return true;
                }
            };
            match handle.set_auto_select(enabled).await {
                Ok(()) => println!(
                    "  {} automatic selection {}",
                    "✓".green(),
                    if enabled { "enabled" } else { "disabled" }
                ),
                Err(e) => println!("  {} {}", "✗".red(), e),
            }
        }
        Some("relays") => match announces.snapshot() {
            Ok(relays) if relays.is_empty() => println!("  no known relays"),
            Ok(relays) => {
                for relay in relays {
                    let seen = chrono::DateTime::from_timestamp(relay.last_seen as i64, 0)
                        .map(|t| t.format("%H:%M:%S").to_string())
                        .unwrap_or_else(|| "?".to_string());
                    println!(
                        "  {}  hops {}  limit {} KB  seen {}{}",
                        relay.relay_id.cyan(),
                        relay.hops,
                        relay.transfer_limit,
                        seen,
                        if relay.favorite { "  ★" } else { "" }
                    );
                }
            }
            Err(e) => println!("  {} {}", "✗".red(), e),
        },
        Some(other) => println!("  unknown command: {}", other),
        None => {}
    }
    true
}

fn print_selection(state: &RelayLoadState) {
    let stamp = chrono::Local::now().format("%H:%M:%S");
    match state {
        RelayLoadState::Loading => {
            println!("[{}] {}", stamp, "selection loading…".dimmed());
        }
        RelayLoadState::Loaded(None) => {
            println!("[{}] {}", stamp, "no relay selected".dimmed());
        }
        RelayLoadState::Loaded(Some(relay)) => {
            let tag = if relay.manual {
                "manual".magenta().bold()
            } else {
                "auto".green().bold()
            };
            println!("[{}] {} relay {}", stamp, tag, relay.relay_id.cyan());
        }
    }
}
