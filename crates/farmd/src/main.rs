//! farmd - remote EDA job daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};

use clap::Parser;
use eyre::WrapErr;
use farm_core::{Config, Transport};
use farmd::{Daemon, DaemonConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Project-local config file, read when present.
const LOCAL_CONFIG: &str = ".farm/config";

#[derive(Parser)]
#[command(name = "farmd", about = "Remote EDA job daemon", version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value = "7800")]
    port: u16,

    /// Config file (key=value), applied after .farm/config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run jobs over ssh or on this machine
    #[arg(long, value_parser = ["ssh", "local"])]
    transport: Option<String>,

    /// Execution host
    #[arg(long)]
    host: Option<String>,

    /// SSH user on the execution host
    #[arg(long)]
    user: Option<String>,

    /// Directory on the execution host holding job directories
    #[arg(long)]
    jobs_root: Option<String>,
}

fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let mut config = Config::default();
    config.apply_env(|key| std::env::var(key).ok());

    let local = Path::new(LOCAL_CONFIG);
    if local.exists() {
        config
            .load_file(local)
            .wrap_err_with(|| format!("reading {LOCAL_CONFIG}"))?;
    }
    if let Some(path) = &cli.config {
        config
            .load_file(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
    }

    if let Some(transport) = &cli.transport {
        config.transport = if transport == "local" {
            Transport::Local
        } else {
            Transport::Ssh
        };
    }
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(user) = &cli.user {
        config.user.clone_from(user);
    }
    if let Some(root) = &cli.jobs_root {
        config.jobs_root.clone_from(root);
    }

    config.validate().wrap_err("invalid configuration")?;
    Ok(config)
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(&cli)?;
    let daemon_config = DaemonConfig {
        port: cli.port,
        config,
        ..Default::default()
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = match Daemon::new(daemon_config) {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        };

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
            let mut sigint =
                signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;

            let server = daemon.run();
            tokio::pin!(server);
            tokio::select! {
                result = &mut server => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                    }
                    return Ok(());
                }
                _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
            }
            daemon.shutdown();
            if let Err(e) = server.await {
                error!("daemon error: {}", e);
            }
        }

        #[cfg(not(unix))]
        {
            let server = daemon.run();
            tokio::pin!(server);
            tokio::select! {
                result = &mut server => {
                    if let Err(e) = result {
                        error!("daemon error: {}", e);
                    }
                    return Ok(());
                }
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, initiating graceful shutdown"),
            }
            daemon.shutdown();
            if let Err(e) = server.await {
                error!("daemon error: {}", e);
            }
        }

        Ok(())
    })
}
