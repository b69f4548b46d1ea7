//! Array Management Client
//!
//! Management-plane client for block-storage arrays driven over SSH through
//! a line-oriented CLI.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       Replication Manager                           │
//! │            (partnership, failover, failback, sync waits)            │
//! ├──────────────────────────────────┬──────────────────────────────────┤
//! │   Array Command Assistant        │   Array Command Assistant        │
//! │   (local array)                  │   (replication target)           │
//! │   vdisks · hosts · LocalCopy     │                                  │
//! │   remote copy · keyed locks      │                                  │
//! ├──────────────────────────────────┴──────────────────────────────────┤
//! │   CLI commands (typed)   ──►   Command Channel   ──►   CLI parser    │
//! │                           pool · retries · primary/secondary switch │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │   Session connectors:  SSH (russh)  │  in-memory simulator          │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`channel`]: session pool, SSH connector and the command channel
//! - [`cli`]: typed CLI commands and the response parser
//! - [`lifecycle`]: copy-mapping and remote-copy state machines
//! - [`assistant`]: typed array operations on top of the channel
//! - [`replication`]: failover and failback between two arrays
//! - [`simulator`]: in-memory arrays speaking the same CLI
//! - [`config`]: YAML configuration
//! - [`error`]: error types and handling

pub mod assistant;
pub mod channel;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod replication;
pub mod simulator;

// Re-export commonly used types
pub use assistant::{
    ArrayAssistant, HostMapping, LockKey, ObjectLocks, PartnershipInfo, PollOutcome, VdiskInfo,
};

pub use channel::{CommandChannel, EndpointRole, SessionPool, SshConnector};

pub use cli::{parse, ArrayCommand, HostInitiator, Layout, Record, RecordSet, ThinProvisioning};

pub use config::{ArrayConfig, AssistantConfig, ChannelConfig, DriverConfig, ReplicationTargetConfig};

pub use domain::ports::{
    ArraySession, CliResult, Credentials, Endpoint, ReplicationStatus, ReplicationType,
    SessionConnector, SessionConnectorRef, SystemInfo, VolumeRef, VolumeUpdate,
};

pub use error::{Error, Recovery, Result};

pub use lifecycle::{
    CopyMapping, LcConsistencyGroup, LcMapStatus, LcMapTrigger, RcPrimary, RcRelState, RcTrigger,
    RemoteCopyRelationship,
};

pub use metrics::{ChannelMetrics, ChannelStatsSnapshot};

pub use replication::ReplicationManager;

pub use simulator::{SimulatedArray, SimulatedFabric, SimulatorConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
