use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Command line configuration. Defaults match the protocol timings clients
/// are built against, so a bare `pairsync-server` behaves as deployed.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct ServerConfig {
    /// Address of the reliable control channel (TCP)
    #[clap(long, default_value = "0.0.0.0:8788")]
    pub control_addr: SocketAddr,

    /// Address of the unreliable data channel (UDP)
    #[clap(long, default_value = "0.0.0.0:8789")]
    pub data_addr: SocketAddr,

    /// Seconds without a heartbeat before a client is dropped
    #[clap(long, default_value = "60")]
    pub heartbeat_timeout_secs: u64,

    /// Seconds between liveness sweeps
    #[clap(long, default_value = "10")]
    pub sweep_interval_secs: u64,

    /// Seconds an issued enter code stays redeemable
    #[clap(long, default_value = "30")]
    pub enter_code_ttl_secs: u64,

    /// Upstream authoritative time source; local clock is used when absent
    #[clap(long)]
    pub time_source: Option<SocketAddr>,

    /// Seconds between time-sync batches
    #[clap(long, default_value = "10")]
    pub timesync_interval_secs: u64,

    /// Round trips drawn per time-sync batch
    #[clap(long, default_value = "100")]
    pub timesync_samples: usize,

    /// Samples discarded from each tail of a batch
    #[clap(long, default_value = "10")]
    pub timesync_trim: usize,

    /// Timeout of a single time-sync request in milliseconds
    #[clap(long, default_value = "2000")]
    pub timesync_timeout_ms: u64,

    /// Milliseconds between readiness polls of a running experiment
    #[clap(long, default_value = "1000")]
    pub experiment_poll_ms: u64,

    /// Lead time added to a game's authoritative start timestamp
    #[clap(long, default_value = "3000")]
    pub game_start_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[clap(long, default_value = "debug")]
    pub log_level: tracing::Level,
}

impl ServerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn enter_code_ttl(&self) -> Duration {
        Duration::from_secs(self.enter_code_ttl_secs)
    }

    pub fn timesync_interval(&self) -> Duration {
        Duration::from_secs(self.timesync_interval_secs)
    }

    pub fn timesync_timeout(&self) -> Duration {
        Duration::from_millis(self.timesync_timeout_ms)
    }

    pub fn experiment_poll(&self) -> Duration {
        Duration::from_millis(self.experiment_poll_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::parse_from(["pairsync-server"])
    }
}
