//! Error types for the array management client
//!
//! One error enum covers the command channel, the CLI parser, the copy and
//! replication state machines and the replication manager. Errors raised by
//! the array itself always carry the command line that produced them.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the management client
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Transport error on {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Session pool for {endpoint} exhausted after waiting {waited:?}")]
    PoolExhausted { endpoint: String, waited: Duration },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Array rejected command '{command}': {stderr}")]
    ArrayCommand {
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("Protocol mismatch in output of '{command}': {detail}")]
    ProtocolMismatch { command: String, detail: String },

    #[error("Field '{field}' missing from output of '{command}'")]
    MissingField { command: String, field: String },

    // =========================================================================
    // Object Errors
    // =========================================================================
    #[error("Object not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Object {name} is in use by {users:?}")]
    ObjectInUse { name: String, users: Vec<String> },

    #[error("Size mismatch: {source_name} is {source_size} bytes, {target_name} is {target_size} bytes")]
    SizeMismatch {
        source_name: String,
        source_size: u64,
        target_name: String,
        target_size: u64,
    },

    // =========================================================================
    // State Machine Errors
    // =========================================================================
    #[error("Invalid state transition for {object}: '{trigger}' not allowed in state '{state}'")]
    InvalidStateTransition {
        object: String,
        state: String,
        trigger: String,
    },

    #[error("Local copy {mapping} failed in state {status}")]
    LocalCopyFailed { mapping: String, status: String },

    #[error("Timed out after {waited:?} waiting for {object} to be prepared")]
    PrepareTimeout { object: String, waited: Duration },

    #[error("Timed out after {waited:?} waiting for {object} to synchronize")]
    SyncTimeout { object: String, waited: Duration },

    #[error("Wait for {object} was cancelled")]
    Cancelled { object: String },

    // =========================================================================
    // Replication Errors
    // =========================================================================
    #[error("Unable to fail over: {reason}")]
    UnableToFailOver { reason: String },

    #[error("Invalid replication target: {reason}")]
    InvalidReplicationTarget { reason: String },

    // =========================================================================
    // IO / Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a caller should recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Switch to the alternate endpoint and retry once
    SwitchEndpoint,
    /// Roll back the partially created array object, then surface
    RollBack,
    /// Surface to the caller unchanged
    Surface,
}

impl Error {
    /// Determine how this error is recovered from
    pub fn recovery(&self) -> Recovery {
        match self {
            Error::Transport { .. } => Recovery::SwitchEndpoint,

            Error::PrepareTimeout { .. }
            | Error::SyncTimeout { .. }
            | Error::Cancelled { .. }
            | Error::LocalCopyFailed { .. } => Recovery::RollBack,

            _ => Recovery::Surface,
        }
    }

    /// Check if this error is a transport-level failure
    pub fn is_transport(&self) -> bool {
        matches!(self.recovery(), Recovery::SwitchEndpoint)
    }

    /// Check if this error was raised by the array's CLI protocol
    pub fn is_protocol_level(&self) -> bool {
        matches!(
            self,
            Error::ArrayCommand { .. } | Error::ProtocolMismatch { .. } | Error::MissingField { .. }
        )
    }

    /// Command line that produced this error, if it came from the array
    pub fn command(&self) -> Option<&str> {
        match self {
            Error::ArrayCommand { command, .. }
            | Error::ProtocolMismatch { command, .. }
            | Error::MissingField { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Stderr text from the array, if any
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::ArrayCommand { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    /// Check whether the array reported one of the given CLI error codes
    pub fn has_cli_code(&self, codes: &[&str]) -> bool {
        self.stderr()
            .map(|stderr| codes.iter().any(|code| stderr.contains(code)))
            .unwrap_or(false)
    }
}

/// Result type alias for the management client
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery() {
        let err = Error::Transport {
            endpoint: "10.0.0.1:22".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(err.recovery(), Recovery::SwitchEndpoint);
        assert!(err.is_transport());

        let err = Error::PrepareTimeout {
            object: "lcmap 3".into(),
            waited: Duration::from_secs(60),
        };
        assert_eq!(err.recovery(), Recovery::RollBack);

        let err = Error::PoolExhausted {
            endpoint: "10.0.0.1:22".into(),
            waited: Duration::from_secs(30),
        };
        assert_eq!(err.recovery(), Recovery::Surface);
        assert!(!err.is_transport());

        let err = Error::InvalidInput("bad token".into());
        assert_eq!(err.recovery(), Recovery::Surface);
        assert!(!err.is_transport());
    }

    #[test]
    fn test_protocol_errors_carry_command() {
        let err = Error::ArrayCommand {
            command: "mcsop rmvdisk vol-1".into(),
            stdout: String::new(),
            stderr: "CMMVC5753E The specified object does not exist".into(),
        };
        assert!(err.is_protocol_level());
        assert_eq!(err.command(), Some("mcsop rmvdisk vol-1"));
        assert!(err.has_cli_code(&["CMMVC5753E"]));
        assert!(!err.has_cli_code(&["CMMVC5754E"]));

        let err = Error::MissingField {
            command: "mcsinq lssystem".into(),
            field: "id".into(),
        };
        assert!(err.is_protocol_level());
        assert_eq!(err.stderr(), None);
    }
}
