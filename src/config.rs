//! Server configuration
//!
//! Every option can be given as a flag or through the environment.

use chrono::Duration;
use clap::Parser;
use std::net::SocketAddr;

#[derive(Debug, Clone, Parser)]
#[command(name = "conductor")]
#[command(about = "Delegate task dispatch and resource constraint throttling")]
#[command(version)]
pub struct Config {
    /// Database connection string
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:conductor.db?mode=rwc")]
    pub database_url: String,

    /// Address the HTTP server binds to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: SocketAddr,

    /// A delegate whose last heartbeat is older than this is disconnected
    #[arg(long, env = "MAX_HEARTBEAT_AGE_SECS", default_value_t = 315)]
    pub max_heartbeat_age_secs: i64,

    /// How long a validated connection result keeps a delegate whitelisted
    #[arg(long, env = "WHITELIST_TTL_SECS", default_value_t = 6 * 60 * 60)]
    pub whitelist_ttl_secs: i64,

    /// How long a failed connection result keeps a delegate blacklisted
    #[arg(long, env = "BLACKLIST_TTL_SECS", default_value_t = 5 * 60)]
    pub blacklist_ttl_secs: i64,

    /// Age after which a used whitelist entry is refreshed
    #[arg(long, env = "WHITELIST_REFRESH_SECS", default_value_t = 10 * 60)]
    pub whitelist_refresh_secs: i64,

    /// Validation attempts older than this count as finished
    #[arg(long, env = "VALIDATION_TIMEOUT_SECS", default_value_t = 12)]
    pub validation_timeout_secs: i64,

    /// Period of the re-broadcast / expiry scheduler
    #[arg(long, env = "REBROADCAST_INTERVAL_SECS", default_value_t = 5)]
    pub rebroadcast_interval_secs: i64,

    /// Broadcast rounds after which a queued task is left for expiry
    #[arg(long, env = "MAX_BROADCAST_ROUNDS", default_value_t = 10)]
    pub max_broadcast_rounds: u32,

    /// Number of delegates a task may be handed to before it fails
    #[arg(long, env = "RETRY_BUDGET", default_value_t = 3)]
    pub retry_budget: u32,

    /// Re-validate connectivity even for whitelisted delegates
    #[arg(long, env = "REVALIDATE_WHITELISTED", default_value_t = false)]
    pub revalidate_whitelisted: bool,

    /// Persist per-task delegate selection logs
    #[arg(long, env = "SELECTION_LOGS_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    pub selection_logs_enabled: bool,
}

impl Config {
    pub fn settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_heartbeat_age: Duration::seconds(self.max_heartbeat_age_secs),
            whitelist_ttl: Duration::seconds(self.whitelist_ttl_secs),
            blacklist_ttl: Duration::seconds(self.blacklist_ttl_secs),
            whitelist_refresh: Duration::seconds(self.whitelist_refresh_secs),
            validation_timeout: Duration::seconds(self.validation_timeout_secs),
            rebroadcast_interval: Duration::seconds(self.rebroadcast_interval_secs),
            max_broadcast_rounds: self.max_broadcast_rounds,
            retry_budget: self.retry_budget,
            revalidate_whitelisted: self.revalidate_whitelisted,
            selection_logs_enabled: self.selection_logs_enabled,
        }
    }
}

/// Tunables shared by the registry, whitelist and coordinator
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_heartbeat_age: Duration,
    pub whitelist_ttl: Duration,
    pub blacklist_ttl: Duration,
    pub whitelist_refresh: Duration,
    pub validation_timeout: Duration,
    pub rebroadcast_interval: Duration,
    pub max_broadcast_rounds: u32,
    pub retry_budget: u32,
    pub revalidate_whitelisted: bool,
    pub selection_logs_enabled: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_heartbeat_age: Duration::seconds(5 * 60 + 15),
            whitelist_ttl: Duration::hours(6),
            blacklist_ttl: Duration::minutes(5),
            whitelist_refresh: Duration::minutes(10),
            validation_timeout: Duration::seconds(12),
            rebroadcast_interval: Duration::seconds(5),
            max_broadcast_rounds: 10,
            retry_budget: 3,
            revalidate_whitelisted: false,
            selection_logs_enabled: true,
        }
    }
}
