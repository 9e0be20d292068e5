//! Command-line flags. Everything else comes from the environment.

use clap::Parser;

/// Device compliance escalation service.
#[derive(Parser, Debug, Clone)]
#[command(name = "laggard", version, about)]
pub struct Cli {
    /// Bind address for the control/status HTTP server.
    #[arg(long, env = "LAGGARD_HOST")]
    pub host: Option<String>,

    /// Bind port for the control/status HTTP server.
    #[arg(long, env = "LAGGARD_PORT")]
    pub port: Option<u16>,

    /// Start with the loops stopped; send `POST /control/start` to begin.
    #[arg(long)]
    pub paused: bool,

    /// Keep records in memory instead of PostgreSQL (dry runs).
    #[arg(long)]
    pub memory_store: bool,

    /// Seconds to wait for in-flight sends on shutdown.
    #[arg(long, env = "LAGGARD_SHUTDOWN_TIMEOUT", default_value_t = 150)]
    pub shutdown_timeout: u64,
}

impl Cli {
    /// Resolve the bind address, preferring flags over config.
    pub fn bind_addr(&self, config: &laggard_core::config::ServerConfig) -> String {
        let host = self.host.as_deref().unwrap_or(&config.host);
        let port = self.port.unwrap_or(config.port);
        format!("{host}:{port}")
    }
}
