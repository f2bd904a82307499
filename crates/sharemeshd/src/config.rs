//! Configuration for sharemeshd

use crate::broadcast::BroadcastOptions;
use crate::storage::StoreOptions;
use crate::sync::SyncOptions;
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// sharemeshd - content sharing mesh node
#[derive(Parser, Debug, Clone)]
#[command(name = "sharemeshd")]
#[command(about = "Stores signed content records and gossips them across the mesh")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:5423")]
    pub listen: SocketAddr,

    /// Host (name:port) other peers know this node by
    #[arg(long, env = "SHAREMESH_HOST")]
    pub host: Option<String>,

    /// Production mode: require a host and publicly reachable peers
    #[arg(long, env = "SHAREMESH_PRODUCTION")]
    pub production: bool,

    /// Data directory for the record store
    #[arg(short, long, default_value = "./data/sharemeshd")]
    pub data_dir: PathBuf,

    /// Known peers (comma-separated name:port)
    #[arg(long, value_delimiter = ',', env = "SHAREMESH_PEERS")]
    pub peers: Vec<String>,

    /// Days of records to keep
    #[arg(long, default_value = "7")]
    pub max_days: u32,

    /// Largest history page requested or served
    #[arg(long, default_value = "100")]
    pub page_size: u32,

    /// How far back catch-up reaches, in seconds
    #[arg(long, default_value = "86400")]
    pub lookback_secs: i64,

    /// Oldest accepted `created` for submissions and live gossip, in seconds
    #[arg(long, default_value = "120")]
    pub submission_max_age_secs: i64,

    /// Wait for a history answer, in seconds
    #[arg(long, default_value = "10")]
    pub history_timeout_secs: u64,

    /// Connect and reflection probe timeout, in seconds
    #[arg(long, default_value = "5")]
    pub probe_timeout_secs: u64,

    /// Silence after which a gossip link is considered dead, in seconds.
    /// Keepalive pings go out every third of this.
    #[arg(long, default_value = "90")]
    pub link_idle_secs: u64,

    /// Interval between link reconciliations, in seconds
    #[arg(long, default_value = "30")]
    pub reconcile_interval_secs: u64,

    /// Delay before the first reconciliation outside production, in milliseconds
    #[arg(long, default_value = "500")]
    pub startup_delay_ms: u64,

    /// Store provisioning attempts per call
    #[arg(long, default_value = "5")]
    pub provision_attempts: u32,

    /// Delay between provisioning attempts, in milliseconds
    #[arg(long, default_value = "500")]
    pub provision_backoff_ms: u64,

    /// Log format
    #[arg(long, value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.production && self.host.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("A host is required in production (--host or SHAREMESH_HOST)");
        }
        if self.page_size == 0 {
            anyhow::bail!("Page size must be at least 1");
        }
        if self.max_days == 0 {
            anyhow::bail!("Retention must be at least one day");
        }
        if self.lookback_secs <= 0 || self.submission_max_age_secs <= 0 {
            anyhow::bail!("Freshness windows must be positive");
        }
        if self.link_idle_secs == 0 {
            anyhow::bail!("Link idle window must be at least one second");
        }
        Ok(())
    }

    /// Host advertised to peers; falls back to the listen address
    pub fn local_host(&self) -> String {
        self.host.clone().unwrap_or_else(|| self.listen.to_string())
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_days: self.max_days,
            provision_attempts: self.provision_attempts,
            provision_backoff: Duration::from_millis(self.provision_backoff_ms),
        }
    }

    pub fn broadcast_options(&self) -> BroadcastOptions {
        BroadcastOptions {
            submission_max_age_secs: self.submission_max_age_secs,
            lookback_secs: self.lookback_secs,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            page_size: self.page_size,
            lookback_secs: self.lookback_secs,
            history_timeout: Duration::from_secs(self.history_timeout_secs),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn link_idle(&self) -> Duration {
        Duration::from_secs(self.link_idle_secs)
    }
}
