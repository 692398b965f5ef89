//! portmapper binary entry point.
//!
//! Wires the settings layer, the tunnel supervisor, and the port tracker
//! together: declared rules are added and started, then the process's output
//! lines and the tracker's port diffs are printed until Ctrl-C, at which point
//! everything is torn down.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use portmapper::{
    cli::{Cli, Commands},
    config::{Settings, SettingsLoader},
    portwatch::{PortDiff, PortTracker},
    tunnel::{BinaryLocator, TunnelSupervisor},
};
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    debug!("parsed CLI arguments: {:?}", cli);

    let loader = SettingsLoader::new();
    let mut settings = loader
        .load(cli.config.as_deref())
        .context("failed to load settings")?;

    // CLI flags override the settings file.
    if let Some(interval) = cli.scan_interval {
        settings.app.scan_interval = interval;
    }
    if let Some(path) = &cli.frpc_path {
        settings.app.frpc_path = Some(path.clone());
    }

    let locator = BinaryLocator::discover(settings.app.frpc_path.as_deref());

    if let Some(Commands::Doctor) = cli.command {
        return run_doctor(&locator);
    }

    let supervisor = Arc::new(TunnelSupervisor::new(locator, loader.frpc_config_path()));
    if settings.server.is_complete() {
        supervisor.set_connection(settings.server.connection_section());
    } else {
        warn!("frp server connection is not configured; rules cannot start until it is");
    }

    run(&cli, &settings, &supervisor)
}

/// Forwarding mode: start the declared rules, then report until Ctrl-C.
fn run(cli: &Cli, settings: &Settings, supervisor: &Arc<TunnelSupervisor>) -> Result<()> {
    let rt = tokio::runtime::Runtime::new().context("failed to start async runtime")?;

    let result = rt.block_on(async {
        let (line_tx, mut line_rx) = tokio::sync::mpsc::channel(256);
        supervisor.set_output_channel(line_tx);

        for spec_text in &cli.forward {
            let spec = Cli::parse_forward_spec(spec_text)
                .with_context(|| format!("invalid forward spec: {spec_text}"))?;
            let name = supervisor.add(spec.local_port, spec.remote_port, spec.protocol)?;
            let message = supervisor.start(&name)?;
            info!("{message}");
        }

        let tracker = PortTracker::new(settings.app.effective_scan_interval());
        let (diff_tx, mut diff_rx) = tokio::sync::mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let tracker_task = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.run(diff_tx, shutdown_rx).await })
        };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    break;
                }
                Some(line) = line_rx.recv() => println!("frpc: {line}"),
                Some(diff) = diff_rx.recv() => print_diff(&diff),
            }
        }

        let _ = shutdown_tx.send(true);
        let _ = tracker_task.await;
        Ok::<(), anyhow::Error>(())
    });

    supervisor.stop_all();
    result
}

/// Report binary availability and health as two separate facts.
fn run_doctor(locator: &BinaryLocator) -> Result<()> {
    match locator.path() {
        Some(path) => {
            println!("frpc found: {}", path.display());
            match locator.probe() {
                Ok(version) => println!("frpc healthy: {version}"),
                Err(e) => println!("frpc present but not usable: {e}"),
            }
        }
        None => {
            println!(
                "frpc not found (searched PATH, the program directory, and standard install locations)"
            );
        }
    }
    Ok(())
}

fn print_diff(diff: &PortDiff) {
    for o in &diff.added {
        println!("port up:      {}/{} {}", o.port, o.protocol, o.display_name());
    }
    for o in &diff.removed {
        println!("port down:    {}/{} {}", o.port, o.protocol, o.display_name());
    }
    for o in &diff.changed {
        println!("port changed: {}/{} -> {}", o.port, o.protocol, o.status);
    }
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - 0 (default): Only warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}
