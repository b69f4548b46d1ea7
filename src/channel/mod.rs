//! Command channel to the array's management interface
//!
//! - [`ssh`]: russh-based session connector
//! - [`pool`]: bounded session pool per endpoint
//! - [`endpoint`]: primary/secondary endpoint selection
//! - [`command_channel`]: execution, retries and endpoint switching

pub mod command_channel;
pub mod endpoint;
pub mod pool;
pub mod ssh;

pub use command_channel::{validate_tokens, CommandChannel};
pub use endpoint::{EndpointRole, EndpointSet};
pub use pool::{PooledSession, SessionPool};
pub use ssh::SshConnector;
