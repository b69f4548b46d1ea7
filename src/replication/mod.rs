//! Replication across a pair of arrays
//!
//! The [`ReplicationManager`] keeps every replicated volume paired with an
//! auxiliary copy on the replication target and moves the volumes between
//! the two arrays on failover and failback.

mod manager;

pub use manager::{aux_vdisk_name, ReplicationManager, AUX_PREFIX};
