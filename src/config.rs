//! P2P configuration.
//!
//! Loaded from TOML; every field has a default so an empty document is a
//! valid configuration.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumType;
use crate::error::ConfigError;

/// Default block buffer (256KB)
pub const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Upper bound for every timeout and period (30 days)
pub const MAX_TIMEOUT_MS: u64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct P2pConfig {
    /// Name of this pool, used as initiator in push requests
    pub pool_name: String,
    /// Address the shared listener binds to
    pub listen_address: IpAddr,
    /// Recommended listen port, 0 picks an ephemeral port
    pub port: u16,
    /// Interface advertised to source pools when bound to a wildcard address
    pub interface: Option<IpAddr>,
    /// Advisory concurrency ceiling; extra transfers are reported as queued
    pub max_active: usize,
    pub namespace_timeout_ms: u64,
    pub pool_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Keepalive period while waiting on the source pool
    pub ping_period_ms: u64,
    /// Consecutive failed pings tolerated before the transfer fails
    pub max_ping_failures: u32,
    pub verify_checksum: bool,
    pub checksum_type: ChecksumType,
    /// Drop finished transfers from the session listing
    pub remove_on_exit: bool,
    /// Fail every transfer after the copy (debugging aid)
    pub simulate_io_failure: bool,
    pub buffer_size: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            pool_name: "pool".to_string(),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            interface: None,
            max_active: 10,
            namespace_timeout_ms: 5 * 60 * 1000,
            pool_timeout_ms: 60 * 1000,
            handshake_timeout_ms: 60 * 1000,
            ping_period_ms: 5 * 60 * 1000,
            max_ping_failures: 3,
            verify_checksum: true,
            checksum_type: ChecksumType::Xxh3,
            remove_on_exit: true,
            simulate_io_failure: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl P2pConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_name.trim().is_empty() {
            return Err(ConfigError::Validation("pool_name must not be empty".into()));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Validation("buffer_size must be positive".into()));
        }
        for (name, value) in [
            ("namespace_timeout_ms", self.namespace_timeout_ms),
            ("pool_timeout_ms", self.pool_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("ping_period_ms", self.ping_period_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{name} must be positive")));
            }
            if value > MAX_TIMEOUT_MS {
                return Err(ConfigError::Validation(format!(
                    "{name} must not exceed {MAX_TIMEOUT_MS}"
                )));
            }
        }
        if self.max_ping_failures == 0 {
            return Err(ConfigError::Validation(
                "max_ping_failures must be at least 1".into(),
            ));
        }
        if matches!(self.interface, Some(ip) if ip.is_unspecified()) {
            return Err(ConfigError::Validation(
                "interface must be a concrete address".into(),
            ));
        }
        Ok(())
    }

    pub fn namespace_timeout(&self) -> Duration {
        Duration::from_millis(self.namespace_timeout_ms)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_millis(self.ping_period_ms)
    }

    /// Checksum computed during transfers, if verification is on.
    pub fn transfer_checksum(&self) -> Option<ChecksumType> {
        self.verify_checksum.then_some(self.checksum_type)
    }
}
