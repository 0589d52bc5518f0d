//! warren CLI
//!
//! Thin entry point around the engine: the hidden `daemon run` mode is
//! the long-lived supervisor; `daemon start|stop|status` attach to it
//! over the IPC socket.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use warren_engine::config::Paths;
use warren_engine::{detect_daemon, engine, ensure_daemon, Engine, EngineConfig, IpcServer, ProcessManager};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "warren", version, about = "Local DNS-tunneling supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Run the daemon in the foreground (used by the launcher and init systems)
    #[command(hide = true)]
    Run,

    /// Start the daemon in the background and bring tunnels up
    Start,

    /// Stop the daemon (or clean up orphan processes)
    Stop,

    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = Paths::default_dirs();

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommands::Run => daemon_run(paths).await,
            DaemonCommands::Start => daemon_start(paths).await,
            DaemonCommands::Stop => daemon_stop(paths).await,
            DaemonCommands::Status => daemon_status(paths).await,
        },
    }
}

/// Foreground daemon supervisor: engine + IPC server until a signal or a
/// shutdown request arrives.
async fn daemon_run(paths: Paths) -> Result<()> {
    let cfg = EngineConfig::load_or_default(&paths.config_path())
        .context("failed to load config")?;
    init_logging(&cfg.log.level);

    if let Some(client) = detect_daemon(&paths).await {
        drop(client);
        bail!(
            "daemon is already running (socket: {})",
            paths.socket_path().display()
        );
    }

    paths.ensure().context("failed to create config dir")?;

    let eng = Engine::new(cfg, paths.clone());

    // A previous daemon may have left children behind; the state file
    // knows about them.
    if let Err(e) = eng.stop().await {
        error!("orphan cleanup failed: {e}");
    }

    engine::set_current(Some(eng.clone()));
    let server = IpcServer::start(paths.socket_path(), VERSION, eng.clone())
        .context("failed to start IPC server")?;
    let mut shutdown_requested = server.shutdown_requested();

    println!("Daemon ready (socket: {})", paths.socket_path().display());

    tokio::select! {
        _ = wait_for_signal() => info!("signal received"),
        _ = shutdown_requested.recv() => info!("shutdown requested over ipc"),
    }

    println!("Shutting down...");
    if let Err(e) = eng.stop().await {
        error!("engine stop failed: {e}");
    }
    server.stop().await;
    engine::set_current(None);
    println!("Stopped.");
    Ok(())
}

async fn daemon_start(paths: Paths) -> Result<()> {
    init_logging("info");

    if let Some(client) = detect_daemon(&paths).await {
        let status = client.status().await?;
        let running = status.tunnels.values().filter(|t| t.running).count();
        println!("Daemon already running ({running} tunnel(s) active)");
        return Ok(());
    }

    println!("Starting daemon...");
    let client = ensure_daemon(&paths).await?;

    let cfg = client.get_config().await?;
    if cfg.tunnels.is_empty() {
        println!("Daemon started (no tunnels configured)");
        return Ok(());
    }

    client.start().await.context("failed to start tunnels")?;

    let status = client.status().await?;
    let mut running = 0;
    for ts in status.tunnels.values() {
        if ts.running {
            running += 1;
            println!("  tunnel {} running on :{}", ts.tag, ts.port);
        }
    }
    if !status.gateway_addr.is_empty() {
        println!("  gateway: {}", status.gateway_addr);
    }
    println!("Started ({running} tunnel(s) running)");
    Ok(())
}

async fn daemon_stop(paths: Paths) -> Result<()> {
    init_logging("info");

    if let Some(client) = detect_daemon(&paths).await {
        println!("Stopping daemon...");
        let _ = client.stop().await;
        let _ = client.shutdown().await;
        println!("Stopped.");
        return Ok(());
    }

    // No daemon; the state file may still list live children.
    let procs = ProcessManager::new(paths.state_path());
    let orphans = procs.status().into_iter().filter(|(_, alive)| *alive).count();
    if orphans == 0 {
        println!("Nothing is running.");
        return Ok(());
    }

    println!("Stopping {orphans} orphan process(es)...");
    let _ = procs.stop_all().await;
    println!("Stopped.");
    Ok(())
}

async fn daemon_status(paths: Paths) -> Result<()> {
    init_logging("info");

    if let Some(client) = detect_daemon(&paths).await {
        let status = client.status().await?;
        let running = status.tunnels.values().filter(|t| t.running).count();

        println!("Daemon running — {running}/{} tunnel(s) active", status.tunnels.len());
        for ts in status.tunnels.values() {
            let state = if ts.running {
                format!("running :{}", ts.port)
            } else {
                "stopped".to_string()
            };
            let marker = if ts.active { " [active]" } else { "" };
            println!("  {}: {state}{marker}", ts.tag);
        }
        if !status.gateway_addr.is_empty() {
            println!("Gateway: {}", status.gateway_addr);
        }
        if !status.dns_proxy_addr.is_empty() {
            println!("DNS Proxy: {}", status.dns_proxy_addr);
        }
        return Ok(());
    }

    let procs = ProcessManager::new(paths.state_path());
    let status = procs.status();
    let orphans: Vec<_> = status
        .iter()
        .filter(|(_, alive)| **alive)
        .map(|(name, _)| name.clone())
        .collect();

    if orphans.is_empty() {
        println!("No daemon running.");
    } else {
        println!("No daemon running, but {} orphan process(es) found.", orphans.len());
        for name in orphans {
            if let Some(info) = procs.info(&name) {
                println!("  orphan: {name} (pid {})", info.pid);
            }
        }
        println!("Run 'warren daemon stop' to clean them up.");
    }
    Ok(())
}

fn init_logging(default_level: &str) {
    let level = if default_level.is_empty() { "info" } else { default_level };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
