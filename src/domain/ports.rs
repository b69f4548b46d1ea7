//! Domain Ports - Core trait definitions for the management client
//!
//! These traits define the boundary between the orchestration logic and the
//! transport that reaches the array. The SSH connector and the in-memory
//! simulator both implement them.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Endpoints
// =============================================================================

/// Credentials used to authenticate a management session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    Password(String),
    PrivateKey {
        path: PathBuf,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

/// A management network address through which the CLI is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Management IP or hostname
    pub address: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login name
    pub username: String,
    /// Password or key, written as `{password: ..}` or `{private_key: {..}}`
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub credentials: Credentials,
}

fn default_ssh_port() -> u16 {
    22
}

impl Endpoint {
    pub fn new(address: impl Into<String>, username: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            address: address.into(),
            port: default_ssh_port(),
            username: username.into(),
            credentials,
        }
    }

    /// Builder-style port override
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

// =============================================================================
// Command Results
// =============================================================================

/// Raw outcome of one command execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliResult {
    /// Exit status reported by the remote shell
    pub exit_status: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CliResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_status: u32, stderr: impl Into<String>) -> Self {
        Self {
            exit_status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the array accepted the command
    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

// =============================================================================
// Session Ports
// =============================================================================

/// One authenticated session to an array endpoint
#[async_trait]
pub trait ArraySession: Send {
    /// Run a single command line and collect its output
    async fn exec(&mut self, command: &str) -> Result<CliResult>;

    /// Whether the session can still be reused
    fn is_alive(&self) -> bool;
}

/// Factory for sessions bound to an endpoint
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Open and authenticate a new session
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ArraySession>>;
}

pub type SessionConnectorRef = Arc<dyn SessionConnector>;

// =============================================================================
// Array Identity
// =============================================================================

/// Identity of an array system as reported by `lssystem`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub id: String,
    pub name: String,
    pub code_level: String,
    pub console_ip: String,
}

// =============================================================================
// Replication Types
// =============================================================================

/// Remote-copy mode of a replicated volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationType {
    /// Metro mirror
    Sync,
    /// Global mirror
    Async,
}

impl std::fmt::Display for ReplicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationType::Sync => write!(f, "sync"),
            ReplicationType::Async => write!(f, "async"),
        }
    }
}

/// Replication status reported back to the block-storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationStatus {
    Disabled,
    Enabled,
    FailedOver,
    Error,
}

impl std::fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationStatus::Disabled => write!(f, "disabled"),
            ReplicationStatus::Enabled => write!(f, "enabled"),
            ReplicationStatus::FailedOver => write!(f, "failed-over"),
            ReplicationStatus::Error => write!(f, "error"),
        }
    }
}

// =============================================================================
// Volume Views
// =============================================================================

/// Volume status that marks a volume unusable after failover
pub const VOLUME_STATUS_ERROR: &str = "error";

/// The caller's view of a volume handed to failover/failback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub name: String,
    /// Block-storage status (e.g. "available", "in-use")
    pub status: String,
    /// Replication mode, `None` for volumes without a secondary copy
    pub replication: Option<ReplicationType>,
    /// Status recorded before a failover forced the volume into error
    pub saved_status: Option<String>,
}

impl VolumeRef {
    pub fn new(name: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: status.into(),
            replication: None,
            saved_status: None,
        }
    }

    pub fn replicated(mut self, replication: ReplicationType) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn is_replicated(&self) -> bool {
        self.replication.is_some()
    }

    /// Fold a per-volume outcome back into this view
    pub fn apply(&mut self, update: &VolumeUpdate) {
        if let Some(status) = &update.status {
            self.status = status.clone();
        }
        self.saved_status = update.saved_status.clone();
    }
}

/// Per-volume outcome of a failover or failback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeUpdate {
    pub volume: String,
    /// New block-storage status, `None` when unchanged
    pub status: Option<String>,
    pub replication_status: ReplicationStatus,
    /// Status to restore on failback
    pub saved_status: Option<String>,
    /// Failure reason for this volume only
    pub error: Option<String>,
}

impl VolumeUpdate {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
