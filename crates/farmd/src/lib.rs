//! farmd - remote EDA job daemon
//!
//! Launches long-running tool jobs on an execution host and answers status
//! polls for them. Job state lives in the job directory on the host, so a
//! restarted daemon picks up where the previous one left off.

pub mod channel;
pub mod credentials;
pub mod launcher;
pub mod poller;
pub mod server;

use std::sync::Arc;

use channel::Channel;
use farm_core::Config;
use server::AppState;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Environment variable holding the HTTP bearer token.
pub const ENV_AUTH_TOKEN: &str = "FARMD_AUTH_TOKEN";

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTP server port (default: 7800).
    pub port: u16,
    /// Bearer token required on every request except `/health`.
    pub auth_token: Option<String>,
    /// Execution host and job settings.
    pub config: Config,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: 7800,
            auth_token: std::env::var(ENV_AUTH_TOKEN)
                .ok()
                .filter(|token| !token.is_empty()),
            config: Config::default(),
        }
    }
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Build the daemon. Fails when the execution host credentials cannot
    /// be resolved.
    pub fn new(config: DaemonConfig) -> Result<Self, channel::ChannelError> {
        let channel = Arc::new(Channel::from_config(&config.config)?);
        let state = Arc::new(AppState::new(channel, config.config, config.auth_token));
        Ok(Self {
            port: config.port,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve HTTP until shutdown.
    pub async fn run(&self) -> std::io::Result<()> {
        info!("farmd starting on port {}", self.port);
        info!("execution host: {}", self.state.channel.describe());
        info!("jobs root: {}", self.state.config.jobs_root);
        if self.state.auth_token.is_some() {
            info!("auth token: enabled");
        }

        server::start_server(Arc::clone(&self.state), self.port, self.shutdown.clone()).await?;
        info!("farmd stopped");
        Ok(())
    }

    /// Stop accepting requests. Launched jobs keep running on the host.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
