//! Array Object Lifecycles
//!
//! State machines for the asynchronous objects the array manages on the
//! client's behalf: copy mappings (and their consistency groups) and
//! remote-copy relationships.

pub mod copy_mapping;
pub mod remote_copy;

pub use copy_mapping::{CopyMapping, LcConsistencyGroup, LcMapStatus, LcMapTrigger, UnknownStatus};
pub use remote_copy::{RcPrimary, RcRelState, RcTrigger, RemoteCopyRelationship};
