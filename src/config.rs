//! Driver Configuration
//!
//! Explicit configuration structs handed to the channel, assistant and
//! replication manager constructors. Loaded from YAML by the binary; every
//! section has defaults so a minimal file only names the endpoints.

use crate::domain::ports::Endpoint;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Command Channel
// =============================================================================

/// Session pool and retry settings for one command channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Sessions opened eagerly when a pool is created
    pub pool_min: usize,
    /// Upper bound on concurrent sessions per endpoint
    pub pool_max: usize,
    /// How long a caller waits for a free session
    pub acquire_timeout_secs: u64,
    /// TCP connect + SSH handshake + auth
    pub connect_timeout_secs: u64,
    /// Maximum runtime of a single command
    pub command_timeout_secs: u64,
    /// First pause between retries of the same command
    pub retry_initial_interval_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_interval_ms: u64,
    /// Accepted SSH host key fingerprints; empty accepts any key
    pub host_key_fingerprints: Vec<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            pool_min: 1,
            pool_max: 5,
            acquire_timeout_secs: 60,
            connect_timeout_secs: 30,
            command_timeout_secs: 300,
            retry_initial_interval_ms: 500,
            retry_multiplier: 2.0,
            retry_max_interval_ms: 10_000,
            host_key_fingerprints: Vec::new(),
        }
    }
}

impl ChannelConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_max == 0 {
            return Err(Error::Configuration("pool_max must be at least 1".into()));
        }
        if self.pool_min > self.pool_max {
            return Err(Error::Configuration(format!(
                "pool_min ({}) exceeds pool_max ({})",
                self.pool_min, self.pool_max
            )));
        }
        if self.acquire_timeout_secs == 0 || self.connect_timeout_secs == 0 || self.command_timeout_secs == 0 {
            return Err(Error::Configuration("channel timeouts must be non-zero".into()));
        }
        if self.retry_multiplier < 1.0 {
            return Err(Error::Configuration("retry_multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Array Connection
// =============================================================================

/// Management endpoints of one array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayConfig {
    pub primary: Endpoint,
    #[serde(default)]
    pub secondary: Option<Endpoint>,
    #[serde(default)]
    pub channel: ChannelConfig,
}

impl ArrayConfig {
    pub fn new(primary: Endpoint) -> Self {
        Self {
            primary,
            secondary: None,
            channel: ChannelConfig::default(),
        }
    }

    pub fn with_secondary(mut self, secondary: Endpoint) -> Self {
        self.secondary = Some(secondary);
        self
    }
}

// =============================================================================
// Assistant
// =============================================================================

/// Timing and defaults for array-side orchestration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Poll interval while waiting for a copy mapping to change state
    pub lcmap_poll_interval_ms: u64,
    /// Bound on waiting for `prepared`
    pub prepare_timeout_secs: u64,
    /// Poll interval while waiting for a relationship to synchronize
    pub sync_poll_interval_ms: u64,
    /// Bound on waiting for `consistent_synchronized`
    pub sync_timeout_secs: u64,
    /// Bound on waiting for a background copy to finish
    pub copy_timeout_secs: u64,
    /// Attempts for idempotent inquiries
    pub inquiry_attempts: u32,
    /// Random pause before remote-copy commands, lower bound
    pub rc_jitter_min_ms: u64,
    /// Random pause before remote-copy commands, upper bound
    pub rc_jitter_max_ms: u64,
    /// Background copy rate used for full clones
    pub clone_copy_rate: u8,
    /// I/O group for new vdisks
    pub iogrp: u32,
    /// Create new vdisks thin-provisioned
    pub thin_provisioning: bool,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            lcmap_poll_interval_ms: 5_000,
            prepare_timeout_secs: 120,
            sync_poll_interval_ms: 5_000,
            sync_timeout_secs: 7 * 24 * 3600,
            copy_timeout_secs: 24 * 3600,
            inquiry_attempts: 2,
            rc_jitter_min_ms: 20,
            rc_jitter_max_ms: 500,
            clone_copy_rate: 50,
            iogrp: 0,
            thin_provisioning: false,
        }
    }
}

impl AssistantConfig {
    pub fn lcmap_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lcmap_poll_interval_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_secs)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lcmap_poll_interval_ms == 0 || self.sync_poll_interval_ms == 0 {
            return Err(Error::Configuration("poll intervals must be non-zero".into()));
        }
        if self.prepare_timeout_secs == 0 || self.sync_timeout_secs == 0 || self.copy_timeout_secs == 0 {
            return Err(Error::Configuration("wait timeouts must be non-zero".into()));
        }
        if self.rc_jitter_min_ms > self.rc_jitter_max_ms {
            return Err(Error::Configuration(format!(
                "rc jitter range {}..{} ms is empty",
                self.rc_jitter_min_ms, self.rc_jitter_max_ms
            )));
        }
        if self.clone_copy_rate == 0 || self.clone_copy_rate > 100 {
            return Err(Error::Configuration("clone_copy_rate must be within 1..=100".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Replication Target
// =============================================================================

/// The replication target array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTargetConfig {
    /// Identifier the block-storage layer uses to select this target
    pub backend_id: String,
    pub array: ArrayConfig,
    /// Pool that holds auxiliary vdisks
    pub pool: String,
    #[serde(default = "default_link_bandwidth")]
    pub link_bandwidth_mbits: u32,
    #[serde(default = "default_background_copy_rate")]
    pub background_copy_rate: u8,
}

fn default_link_bandwidth() -> u32 {
    1000
}

fn default_background_copy_rate() -> u8 {
    50
}

// =============================================================================
// Driver
// =============================================================================

/// Complete configuration of the management client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub array: ArrayConfig,
    /// Pool for new vdisks on the local array
    pub pool: String,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub replication: Option<ReplicationTargetConfig>,
}

impl DriverConfig {
    /// Parse configuration from YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: DriverConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.array.channel.validate()?;
        self.assistant.validate()?;
        if let Some(target) = &self.replication {
            target.array.channel.validate()?;
            if target.backend_id.is_empty() {
                return Err(Error::Configuration("replication backend_id is empty".into()));
            }
            if target.array.primary.address == self.array.primary.address {
                return Err(Error::Configuration(
                    "replication target must be a different array".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Credentials, Endpoint};
    use assert_matches::assert_matches;
    use std::io::Write;

    const YAML: &str = r#"
array:
  primary:
    address: 10.0.0.10
    username: superuser
    credentials:
      password: secret
  secondary:
    address: 10.0.0.11
    port: 2222
    username: superuser
    credentials:
      private_key:
        path: /etc/array/id_rsa
  channel:
    pool_max: 8
pool: pool0
assistant:
  prepare_timeout_secs: 60
replication:
  backend_id: array-b
  pool: pool1
  array:
    primary:
      address: 10.1.0.10
      username: superuser
      credentials:
        password: secret
"#;

    #[test]
    fn test_parse_yaml() {
        let config = DriverConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.array.primary.port, 22);
        assert_eq!(config.array.primary.credentials, Credentials::Password("secret".into()));

        let secondary = config.array.secondary.as_ref().unwrap();
        assert_eq!(secondary.port, 2222);
        assert_matches!(secondary.credentials, Credentials::PrivateKey { passphrase: None, .. });

        assert_eq!(config.array.channel.pool_max, 8);
        assert_eq!(config.array.channel.pool_min, 1);
        assert_eq!(config.assistant.prepare_timeout(), Duration::from_secs(60));
        assert_eq!(config.assistant.sync_timeout(), Duration::from_secs(604_800));

        let target = config.replication.unwrap();
        assert_eq!(target.backend_id, "array-b");
        assert_eq!(target.link_bandwidth_mbits, 1000);
    }

    #[test]
    fn test_key_credentials_with_passphrase() {
        let endpoint: Endpoint = serde_yaml::from_str(
            "address: 10.0.0.12\nusername: admin\ncredentials:\n  private_key:\n    path: /keys/id_ed25519\n    passphrase: hunter2\n",
        )
        .unwrap();
        assert_eq!(
            endpoint.credentials,
            Credentials::PrivateKey {
                path: "/keys/id_ed25519".into(),
                passphrase: Some("hunter2".into()),
            }
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(YAML.as_bytes()).unwrap();
        let config = DriverConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.pool, "pool0");

        assert_matches!(
            DriverConfig::from_yaml_file("/nonexistent/array.yaml"),
            Err(Error::Io(_))
        );
    }

    #[test]
    fn test_validation() {
        let mut channel = ChannelConfig::default();
        assert!(channel.validate().is_ok());
        channel.pool_min = 6;
        assert_matches!(channel.validate(), Err(Error::Configuration(_)));

        let mut assistant = AssistantConfig::default();
        assistant.rc_jitter_min_ms = 600;
        assert_matches!(assistant.validate(), Err(Error::Configuration(_)));

        let bad = YAML.replace("10.1.0.10", "10.0.0.10");
        assert_matches!(DriverConfig::from_yaml_str(&bad), Err(Error::Configuration(_)));

        assert_matches!(DriverConfig::from_yaml_str("pool: [1"), Err(Error::Yaml(_)));
    }
}
