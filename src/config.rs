use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
// kubeadm init plus image pulls routinely run for several minutes.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 900;
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Parser, Debug, Clone)]
#[command(name = "kubeprov-server", version, about = "Kubernetes cluster provisioning over SSH")]
pub struct ServerCli {
    /// Server host and port
    #[arg(long, env = "KUBEPROV_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,
    /// SQLite database file (defaults to the user config directory)
    #[arg(long, env = "KUBEPROV_DATABASE")]
    pub database: Option<PathBuf>,
    /// Maximum concurrent SSH sessions per batch
    #[arg(long, env = "KUBEPROV_MAX_CONCURRENCY", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,
    #[arg(long, env = "KUBEPROV_CONNECT_TIMEOUT_SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
    #[arg(long, env = "KUBEPROV_COMMAND_TIMEOUT_SECS", default_value_t = DEFAULT_COMMAND_TIMEOUT_SECS)]
    pub command_timeout_secs: u64,
    /// Per-subscriber buffer for the live log stream
    #[arg(long, env = "KUBEPROV_BROADCAST_CAPACITY", default_value_t = DEFAULT_BROADCAST_CAPACITY)]
    pub broadcast_capacity: usize,
    /// Verbose logs
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServerCli {
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.database {
            return Ok(path.clone());
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join("kubeprov");
        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir.join("kubeprov.db"))
    }

    pub fn settings(&self) -> Settings {
        Settings {
            max_concurrency: self.max_concurrency.max(1),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            broadcast_capacity: self.broadcast_capacity.max(1),
        }
    }
}

/// Runtime knobs shared by the orchestration components.
#[derive(Debug, Clone)]
pub struct Settings {
    pub max_concurrency: usize,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub broadcast_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}
