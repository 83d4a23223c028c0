use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::error::NetError;

/// Default window for elections and resource searches.
pub const TRANSACTION_TIMEOUT_MS: u64 = 5000;
/// Hard bound on the in-flight download queue; the dedup scan is linear.
pub const MAX_QUEUED_DOWNLOADS: usize = 64;
/// Validity window for signed resource-download tokens.
pub const TOKEN_LIFETIME_SECS: u64 = 60;

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Broadcast-domain address announces are sent to. The wire
    /// implementation decides what to do with it; the in-memory hub
    /// ignores it.
    pub multicast_addr: IpAddr,
    pub port: u16,
    pub announce_period_ms: u64,
    /// Attempt to become primary master on startup.
    pub try_become_primary: bool,
    /// Port the local file server hands out in advertise messages.
    pub resource_port: u16,
    /// Whether this node answers find-resource requests at all.
    pub advertise_resources: bool,
    pub election_timeout_ms: u64,
    pub find_timeout_ms: u64,
    /// Directory the client cache manager stores fetched resources in.
    pub cache_dir: PathBuf,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multicast_addr: IpAddr::V4(Ipv4Addr::new(239, 255, 42, 99)),
            port: 10917,
            announce_period_ms: 1000,
            try_become_primary: false,
            resource_port: 10918,
            advertise_resources: true,
            election_timeout_ms: TRANSACTION_TIMEOUT_MS,
            find_timeout_ms: TRANSACTION_TIMEOUT_MS,
            cache_dir: std::env::temp_dir().join("stagelink-cache"),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), NetError> {
        let err = |msg: &str| Err(NetError::InvalidArgument(msg.into()));

        if self.announce_period_ms == 0 {
            return err("announce_period_ms must be > 0");
        }
        if self.election_timeout_ms < self.announce_period_ms {
            return err("election_timeout_ms must be >= announce_period_ms");
        }
        if self.find_timeout_ms == 0 {
            return err("find_timeout_ms must be > 0");
        }
        if self.port == 0 {
            return err("port must be > 0");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = NetworkConfig::default();

        config.announce_period_ms = 0;
        assert!(config.validate().is_err());
        config.announce_period_ms = 1000;

        config.election_timeout_ms = 500;
        assert!(config.validate().is_err());
        config.election_timeout_ms = 5000;

        config.find_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.find_timeout_ms = 5000;

        config.port = 0;
        assert!(config.validate().is_err());
        config.port = 10917;

        assert!(config.validate().is_ok());
    }
}
