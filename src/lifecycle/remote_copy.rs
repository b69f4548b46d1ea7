//! Remote-Copy Relationship State Machine
//!
//! Lifecycle of a replication link between a master vdisk on one array and
//! an auxiliary vdisk on another. Besides the state, the relationship tracks
//! which side is currently primary.

use crate::domain::ports::ReplicationType;
use crate::error::{Error, Result};
use crate::lifecycle::copy_mapping::UnknownStatus;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Primary Side
// =============================================================================

/// Which side of a relationship is the copy source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RcPrimary {
    Master,
    Aux,
}

impl std::fmt::Display for RcPrimary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RcPrimary::Master => f.write_str("master"),
            RcPrimary::Aux => f.write_str("aux"),
        }
    }
}

impl FromStr for RcPrimary {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "master" => Ok(RcPrimary::Master),
            "aux" => Ok(RcPrimary::Aux),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

// =============================================================================
// State and Triggers
// =============================================================================

/// State of a remote-copy relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RcRelState {
    InconsistentStopped,
    InconsistentCopying,
    ConsistentSynchronized,
    ConsistentStopped,
    Idling,
    End,
}

impl RcRelState {
    pub const ALL: [RcRelState; 6] = [
        RcRelState::InconsistentStopped,
        RcRelState::InconsistentCopying,
        RcRelState::ConsistentSynchronized,
        RcRelState::ConsistentStopped,
        RcRelState::Idling,
        RcRelState::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RcRelState::InconsistentStopped => "inconsistent_stopped",
            RcRelState::InconsistentCopying => "inconsistent_copying",
            RcRelState::ConsistentSynchronized => "consistent_synchronized",
            RcRelState::ConsistentStopped => "consistent_stopped",
            RcRelState::Idling => "idling",
            RcRelState::End => "end",
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            RcRelState::InconsistentStopped | RcRelState::ConsistentStopped | RcRelState::Idling
        )
    }
}

impl std::fmt::Display for RcRelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RcRelState {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        RcRelState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Events that move a relationship between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RcTrigger {
    /// Start copying, optionally naming the primary side
    Start { primary: Option<RcPrimary> },
    Stop,
    /// Stop and make the secondary writable
    StopAccess,
    /// Time passing on the array
    Wait,
    /// Reverse roles without breaking synchronization
    Switch { primary: RcPrimary },
    Delete,
    DeleteForce,
}

impl std::fmt::Display for RcTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RcTrigger::Start { .. } => f.write_str("start"),
            RcTrigger::Stop => f.write_str("stop"),
            RcTrigger::StopAccess => f.write_str("stop_access"),
            RcTrigger::Wait => f.write_str("wait"),
            RcTrigger::Switch { .. } => f.write_str("switch"),
            RcTrigger::Delete => f.write_str("delete"),
            RcTrigger::DeleteForce => f.write_str("delete_force"),
        }
    }
}

/// The transition table; `synced` only matters for `inconsistent_copying --wait-->`
pub fn transition(state: RcRelState, trigger: RcTrigger, synced: bool) -> Option<RcRelState> {
    use RcRelState::*;
    use RcTrigger as T;

    let next = match (state, trigger) {
        (InconsistentStopped, T::Start { .. }) => InconsistentCopying,
        (InconsistentStopped, T::Delete | T::DeleteForce) => End,
        (InconsistentCopying, T::Wait) if synced => ConsistentSynchronized,
        (InconsistentCopying, T::Wait) => InconsistentCopying,
        (InconsistentCopying, T::Stop) => InconsistentStopped,
        (ConsistentSynchronized, T::Stop) => ConsistentStopped,
        (ConsistentSynchronized, T::StopAccess) => Idling,
        (ConsistentSynchronized, T::Switch { .. }) => ConsistentSynchronized,
        (ConsistentStopped, T::Start { .. }) => ConsistentSynchronized,
        (ConsistentStopped, T::DeleteForce) => End,
        (Idling, T::Start { .. }) => InconsistentCopying,
        (Idling, T::StopAccess) => Idling,
        (Idling, T::DeleteForce) => End,
        _ => return None,
    };
    Some(next)
}

// =============================================================================
// Relationship
// =============================================================================

/// A remote-copy relationship as tracked by the array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCopyRelationship {
    pub id: String,
    pub name: String,
    pub master_vdisk: String,
    pub aux_vdisk: String,
    pub master_system: String,
    pub aux_system: String,
    pub state: RcRelState,
    /// `None` while idling after access was enabled
    pub primary: Option<RcPrimary>,
    pub copy_type: ReplicationType,
    pub progress: u8,
    /// Percentage of the initial copy completed per wait
    pub background_copy_rate: u8,
}

impl RemoteCopyRelationship {
    /// A freshly created relationship in `inconsistent_stopped`
    pub fn new(
        id: impl Into<String>,
        master_vdisk: impl Into<String>,
        aux_vdisk: impl Into<String>,
        master_system: impl Into<String>,
        aux_system: impl Into<String>,
        copy_type: ReplicationType,
    ) -> Self {
        let id = id.into();
        Self {
            name: format!("rcrel{}", id),
            id,
            master_vdisk: master_vdisk.into(),
            aux_vdisk: aux_vdisk.into(),
            master_system: master_system.into(),
            aux_system: aux_system.into(),
            state: RcRelState::InconsistentStopped,
            primary: Some(RcPrimary::Master),
            copy_type,
            progress: 0,
            background_copy_rate: 50,
        }
    }

    /// Apply a trigger, returning the new state
    pub fn apply(&mut self, trigger: RcTrigger) -> Result<RcRelState> {
        let advancing = self.state == RcRelState::InconsistentCopying && trigger == RcTrigger::Wait;
        let progress = if advancing {
            self.progress
                .saturating_add(self.background_copy_rate.max(1))
                .min(100)
        } else {
            self.progress
        };

        let next = transition(self.state, trigger, progress >= 100).ok_or_else(|| {
            Error::InvalidStateTransition {
                object: format!("rcrelationship {}", self.name),
                state: self.state.to_string(),
                trigger: trigger.to_string(),
            }
        })?;

        match trigger {
            RcTrigger::Start { primary } => {
                if let Some(primary) = primary {
                    self.primary = Some(primary);
                } else if self.primary.is_none() {
                    self.primary = Some(RcPrimary::Master);
                }
                if next == RcRelState::InconsistentCopying {
                    self.progress = 0;
                }
            }
            RcTrigger::StopAccess => self.primary = None,
            RcTrigger::Switch { primary } => self.primary = Some(primary),
            _ => self.progress = progress,
        }
        if next == RcRelState::ConsistentSynchronized {
            self.progress = 100;
        }
        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn triggers() -> Vec<RcTrigger> {
        vec![
            RcTrigger::Start { primary: None },
            RcTrigger::Start {
                primary: Some(RcPrimary::Aux),
            },
            RcTrigger::Stop,
            RcTrigger::StopAccess,
            RcTrigger::Wait,
            RcTrigger::Switch {
                primary: RcPrimary::Aux,
            },
            RcTrigger::Delete,
            RcTrigger::DeleteForce,
        ]
    }

    fn relationship() -> RemoteCopyRelationship {
        RemoteCopyRelationship::new("0", "vol-1", "aux_vol-1", "0000A", "0000B", ReplicationType::Sync)
    }

    #[test]
    fn test_initial_sync() {
        let mut rel = relationship();
        rel.apply(RcTrigger::Start { primary: None }).unwrap();
        assert_eq!(rel.state, RcRelState::InconsistentCopying);
        assert_eq!(rel.apply(RcTrigger::Wait).unwrap(), RcRelState::InconsistentCopying);
        assert_eq!(rel.progress, 50);
        assert_eq!(rel.apply(RcTrigger::Wait).unwrap(), RcRelState::ConsistentSynchronized);
        assert_eq!(rel.primary, Some(RcPrimary::Master));
    }

    #[test]
    fn test_failover_and_failback_path() {
        let mut rel = relationship();
        rel.background_copy_rate = 100;
        rel.apply(RcTrigger::Start { primary: None }).unwrap();
        rel.apply(RcTrigger::Wait).unwrap();

        rel.apply(RcTrigger::StopAccess).unwrap();
        assert_eq!(rel.state, RcRelState::Idling);
        assert_eq!(rel.primary, None);

        rel.apply(RcTrigger::Start {
            primary: Some(RcPrimary::Aux),
        })
        .unwrap();
        assert_eq!(rel.state, RcRelState::InconsistentCopying);
        assert_eq!(rel.primary, Some(RcPrimary::Aux));
        rel.apply(RcTrigger::Wait).unwrap();

        rel.apply(RcTrigger::Switch {
            primary: RcPrimary::Master,
        })
        .unwrap();
        assert_eq!(rel.state, RcRelState::ConsistentSynchronized);
        assert_eq!(rel.primary, Some(RcPrimary::Master));
    }

    #[test]
    fn test_illegal_triggers_leave_state_unchanged() {
        for state in RcRelState::ALL {
            for trigger in triggers() {
                if transition(state, trigger, false).is_some() {
                    continue;
                }
                let mut rel = relationship();
                rel.state = state;
                rel.primary = Some(RcPrimary::Aux);
                let err = rel.apply(trigger).unwrap_err();
                assert_matches!(err, Error::InvalidStateTransition { .. });
                assert_eq!(rel.state, state);
                assert_eq!(rel.primary, Some(RcPrimary::Aux));
            }
        }
    }

    #[test]
    fn test_consistent_stop_and_restart() {
        let mut rel = relationship();
        rel.state = RcRelState::ConsistentSynchronized;
        rel.apply(RcTrigger::Stop).unwrap();
        assert_eq!(rel.state, RcRelState::ConsistentStopped);
        assert_matches!(rel.apply(RcTrigger::Delete), Err(Error::InvalidStateTransition { .. }));
        assert_eq!(
            rel.apply(RcTrigger::Start { primary: None }).unwrap(),
            RcRelState::ConsistentSynchronized
        );
    }

    #[test]
    fn test_state_text() {
        for state in RcRelState::ALL {
            assert_eq!(state.as_str().parse::<RcRelState>().unwrap(), state);
        }
        assert_eq!("aux".parse::<RcPrimary>().unwrap(), RcPrimary::Aux);
        assert!("both".parse::<RcPrimary>().is_err());
    }
}
