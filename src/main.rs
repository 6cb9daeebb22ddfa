mod clock;
mod configs;
mod error;
mod http;
mod policy;
mod process;
mod scheduler;
mod state;
mod supervisor;

use crate::clock::SystemClock;
use crate::configs::RestartdConfig;
use crate::http::AppState;
use crate::process::{SignalController, SystemLocator};
use crate::supervisor::{Supervisor, Variant, WatchdogTarget};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "RESTARTD_CONFIG",
        value_name = "FILE",
        default_value = "/etc/restartd/config.yml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Serve HTTP and restart this process on schedule
    Serve,
    /// Restart an external target process on schedule
    Watchdog,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let config: RestartdConfig =
        serde_yaml::from_reader(File::open(&args.config).wrap_err("Failed to read config")?)
            .wrap_err("Failed to parse config")?;

    if std::env::var("RESTARTD_LOG").is_err() {
        std::env::set_var("RESTARTD_LOG", &config.log);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("RESTARTD_LOG"))
        .init();

    debug!("{:#?}", config);
    match args.mode {
        Mode::Serve => serve(config).await,
        Mode::Watchdog => watchdog(config).await,
    }
}

async fn serve(config: RestartdConfig) -> Result<()> {
    let addr = config
        .listen
        .ok_or_else(|| eyre!("`listen` is required to serve"))?;
    let policy = config.schedule.to_policy()?;
    info!(pid = std::process::id(), %policy, "Starting");

    let supervisor = Supervisor::new(
        policy,
        Arc::new(SystemClock),
        Arc::new(SignalController::default()),
        Variant::InProcess,
        config.stop.settings(),
    )?;
    let _scheduler = supervisor.start();

    let state = AppState {
        supervisor,
        timezone: config.timezone,
        retry_after: config.stop.retry_after,
    };
    http::serve(addr, state, shutdown_signal()).await
}

async fn watchdog(config: RestartdConfig) -> Result<()> {
    let watchdog = config
        .watchdog
        .as_ref()
        .ok_or_else(|| eyre!("`watchdog` section is required to run as a watchdog"))?;
    let policy = config.schedule.to_policy()?;
    info!(%policy, target = %watchdog.target, "Starting watchdog");

    let variant = Variant::Watchdog(WatchdogTarget {
        locator: Arc::new(SystemLocator),
        matcher: watchdog.target.clone(),
        command: watchdog.command_spec(),
    });
    let supervisor = Supervisor::new(
        policy,
        Arc::new(SystemClock),
        Arc::new(SignalController::default()),
        variant,
        config.stop.settings(),
    )?;
    supervisor.ensure_target().await;
    let _scheduler = supervisor.start();

    match config.listen {
        Some(addr) => {
            let state = AppState {
                supervisor,
                timezone: config.timezone,
                retry_after: config.stop.retry_after,
            };
            http::serve(addr, state, shutdown_signal()).await
        }
        None => {
            shutdown_signal().await;
            Ok(())
        }
    }
}

/// Resolves on SIGTERM or ctrl-c. A self-inflicted restart arrives here too.
async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(?err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(?err, "Failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        },
        _ = terminate => {},
    }
    info!("Shutting down");
}
