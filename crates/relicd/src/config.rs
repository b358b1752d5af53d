//! Configuration for relicd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// relicd - Reliquary Artifact Repository Daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "relicd")]
#[command(about = "Reliquary artifact repository and sync daemon")]
pub struct Config {
    /// Listen address for sync connections
    #[arg(short, long, default_value = "0.0.0.0:8217")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/relicd")]
    pub data_dir: PathBuf,

    /// Create this account with full capabilities at startup
    #[arg(long)]
    pub admin_user: Option<String>,

    /// Password for --admin-user
    #[arg(long, env = "RELICD_ADMIN_PASSWORD", default_value = "")]
    pub admin_password: String,

    /// Capability string granted to unauthenticated peers
    /// (o=read, i=write, g=clone, x=private)
    #[arg(long, default_value = "og")]
    pub anonymous_caps: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.anonymous_caps.chars().all(|c| "oigxs".contains(c)) {
            anyhow::bail!("anonymous caps may only contain o, i, g, x, s");
        }
        if let Some(user) = &self.admin_user {
            if user.is_empty() {
                anyhow::bail!("admin user name cannot be empty");
            }
            if self.admin_password.is_empty() {
                anyhow::bail!("admin user requires a password");
            }
        }
        Ok(())
    }
}
