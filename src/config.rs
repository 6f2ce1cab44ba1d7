//! Node configuration
//!
//! All tunables recognized by a relay node, with defaults matching the
//! protocol documentation. Values are resolved in three layers: built-in
//! defaults, then an optional TOML file, then `NEURON_*` environment
//! variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{KeyMode, TokenAmount};

/// Relay node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Optional fixed node id (hex). When absent the id derives from the
    /// identity keypair.
    pub node_id: Option<String>,

    /// Address the transport listens on
    pub listen_addr: String,

    /// Peers dialed at startup
    pub bootstrap_peers: Vec<String>,

    /// Dial more discovered nodes while below this count
    pub min_peers: usize,

    /// Refuse new connections above this count
    pub max_peers: usize,

    /// Region advertised in handshakes
    pub region: String,

    /// Heartbeat period
    #[serde(with = "humantime_serde")]
    pub keepalive_interval: Duration,

    /// Missed heartbeat windows before a peer is quarantined; one more
    /// window after that drops it
    pub keepalive_misses_before_quarantine: u32,

    /// Route lifetime from creation
    #[serde(with = "humantime_serde")]
    pub route_ttl: Duration,

    /// Maximum route cache entries (LRU beyond this)
    pub route_cache_max: usize,

    /// Require AEAD encryption on created routes
    pub encryption_required: bool,

    /// Default key distribution mode for encrypted routes
    pub key_mode: KeyMode,

    /// Reward tokens per MB forwarded
    pub reward_rate: f64,

    /// Minimum stake (whole tokens) for reward eligibility
    pub min_stake: f64,

    /// Per-node reward clamp per distribution (whole tokens)
    pub max_reward_per_day: f64,

    /// Period between reward distributions
    #[serde(with = "humantime_serde")]
    pub distribution_interval: Duration,

    /// Total token supply seeded at genesis (whole tokens)
    pub initial_supply: f64,

    /// Fraction of initial supply seeded into the reward pool
    pub reward_pool_fraction: f64,

    /// Directory for the identity blob and ledger journal
    pub data_dir: String,

    /// Deadline for dial + handshake of an outbound connection
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Per-peer outbound queue capacity; a full queue fails sends fast
    pub send_queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: "127.0.0.1:9470".to_string(),
            bootstrap_peers: Vec::new(),
            min_peers: 5,
            max_peers: 50,
            region: "global".to_string(),
            keepalive_interval: Duration::from_secs(15),
            keepalive_misses_before_quarantine: 2,
            route_ttl: Duration::from_secs(300),
            route_cache_max: 1000,
            encryption_required: true,
            key_mode: KeyMode::Tunnel,
            reward_rate: 0.1,
            min_stake: 1000.0,
            max_reward_per_day: 1000.0,
            distribution_interval: Duration::from_secs(86_400),
            initial_supply: 1_000_000.0,
            reward_pool_fraction: 0.5,
            data_dir: "~/.networkneuron".to_string(),
            handshake_timeout: Duration::from_secs(10),
            send_queue_capacity: 256,
        }
    }
}

impl NodeConfig {
    /// Load a config file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `NEURON_*` environment variables
    pub fn apply_env(&mut self) {
        use std::env;

        if let Ok(addr) = env::var("NEURON_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Ok(peers) = env::var("NEURON_BOOTSTRAP_PEERS") {
            self.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(value) = env::var("NEURON_MIN_PEERS") {
            if let Ok(value) = value.parse() {
                self.min_peers = value;
            }
        }
        if let Ok(value) = env::var("NEURON_MAX_PEERS") {
            if let Ok(value) = value.parse() {
                self.max_peers = value;
            }
        }
        if let Ok(region) = env::var("NEURON_REGION") {
            self.region = region;
        }
        if let Ok(value) = env::var("NEURON_KEEPALIVE_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                self.keepalive_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(value) = env::var("NEURON_ROUTE_TTL_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                self.route_ttl = Duration::from_secs(secs);
            }
        }
        if let Ok(value) = env::var("NEURON_ROUTE_CACHE_MAX") {
            if let Ok(value) = value.parse() {
                self.route_cache_max = value;
            }
        }
        if let Ok(value) = env::var("NEURON_ENCRYPTION_REQUIRED") {
            self.encryption_required = value.to_lowercase() == "true" || value == "1";
        }
        if let Ok(value) = env::var("NEURON_REWARD_RATE") {
            if let Ok(value) = value.parse() {
                self.reward_rate = value;
            }
        }
        if let Ok(value) = env::var("NEURON_MIN_STAKE") {
            if let Ok(value) = value.parse() {
                self.min_stake = value;
            }
        }
        if let Ok(value) = env::var("NEURON_MAX_REWARD_PER_DAY") {
            if let Ok(value) = value.parse() {
                self.max_reward_per_day = value;
            }
        }
        if let Ok(value) = env::var("NEURON_DISTRIBUTION_SECS") {
            if let Ok(secs) = value.parse::<u64>() {
                self.distribution_interval = Duration::from_secs(secs);
            }
        }
        if let Ok(value) = env::var("NEURON_INITIAL_SUPPLY") {
            if let Ok(value) = value.parse() {
                self.initial_supply = value;
            }
        }
        if let Ok(dir) = env::var("NEURON_DATA_DIR") {
            self.data_dir = dir;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_peers < self.min_peers {
            return Err(Error::Config(format!(
                "max_peers {} below min_peers {}",
                self.max_peers, self.min_peers
            )));
        }
        if !(0.0..=1.0).contains(&self.reward_pool_fraction) {
            return Err(Error::Config(format!(
                "reward_pool_fraction {} outside [0, 1]",
                self.reward_pool_fraction
            )));
        }
        if self.reward_rate < 0.0 || self.min_stake < 0.0 || self.max_reward_per_day < 0.0 {
            return Err(Error::Config("negative economic parameter".to_string()));
        }
        if self.route_cache_max == 0 {
            return Err(Error::Config("route_cache_max must be positive".to_string()));
        }
        if self.send_queue_capacity == 0 {
            return Err(Error::Config(
                "send_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn min_stake_amount(&self) -> TokenAmount {
        TokenAmount::from_tokens(self.min_stake).unwrap_or(TokenAmount::ZERO)
    }

    pub fn max_reward_amount(&self) -> TokenAmount {
        TokenAmount::from_tokens(self.max_reward_per_day).unwrap_or(TokenAmount::ZERO)
    }

    pub fn initial_supply_amount(&self) -> TokenAmount {
        TokenAmount::from_tokens(self.initial_supply).unwrap_or(TokenAmount::ZERO)
    }

    /// Resolve `~` in the data directory against `$HOME`
    pub fn resolved_data_dir(&self) -> Result<String> {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            let home = std::env::var("HOME")
                .map_err(|_| Error::Config("cannot resolve ~: HOME not set".to_string()))?;
            Ok(format!("{}/{}", home, rest))
        } else {
            Ok(self.data_dir.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_documentation() {
        let config = NodeConfig::default();
        assert_eq!(config.min_peers, 5);
        assert_eq!(config.max_peers, 50);
        assert_eq!(config.keepalive_interval, Duration::from_secs(15));
        assert_eq!(config.route_ttl, Duration::from_secs(300));
        assert_eq!(config.route_cache_max, 1000);
        assert!(config.encryption_required);
        assert_eq!(config.reward_rate, 0.1);
        assert_eq!(config.min_stake, 1000.0);
        assert_eq!(config.distribution_interval, Duration::from_secs(86_400));
        assert_eq!(config.reward_pool_fraction, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = NodeConfig::default();
        config.max_peers = 2;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.reward_pool_fraction = 1.5;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.route_cache_max = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_overlay() {
        let parsed: NodeConfig = toml::from_str(
            r#"
            listen_addr = "0.0.0.0:9999"
            min_peers = 3
            keepalive_interval = "30s"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.listen_addr, "0.0.0.0:9999");
        assert_eq!(parsed.min_peers, 3);
        assert_eq!(parsed.keepalive_interval, Duration::from_secs(30));
        // Untouched fields keep their defaults
        assert_eq!(parsed.max_peers, 50);
    }

    #[test]
    fn test_token_conversions() {
        let config = NodeConfig::default();
        assert_eq!(config.min_stake_amount(), TokenAmount::from_tokens(1000.0).unwrap());
        assert_eq!(
            config.initial_supply_amount(),
            TokenAmount::from_tokens(1_000_000.0).unwrap()
        );
    }
}
