//! Copy-Mapping State Machine
//!
//! Lifecycle of a point-in-time copy (LocalCopy mapping) and of a
//! consistency group of mappings. Both follow the same transition table:
//!
//! ```text
//! idle_or_copied --prepare--> preparing --wait--> prepared --start--> copying
//!       |                         |                   |                 |
//!    delete(_force)          flush_failed           stop              stop / wait
//!       v                         v                   v                 v
//!      end                     stopped <--wait-- stopping     idle_or_copied (copy done)
//!                                 |
//!                        prepare / delete_force
//! ```
//!
//! A trigger that is not legal in the current status is rejected with
//! [`Error::InvalidStateTransition`] and leaves the object untouched.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Status and Triggers
// =============================================================================

/// Status of a copy mapping or mapping consistency group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LcMapStatus {
    IdleOrCopied,
    Preparing,
    Prepared,
    Copying,
    Stopping,
    Stopped,
    End,
}

impl LcMapStatus {
    pub const ALL: [LcMapStatus; 7] = [
        LcMapStatus::IdleOrCopied,
        LcMapStatus::Preparing,
        LcMapStatus::Prepared,
        LcMapStatus::Copying,
        LcMapStatus::Stopping,
        LcMapStatus::Stopped,
        LcMapStatus::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LcMapStatus::IdleOrCopied => "idle_or_copied",
            LcMapStatus::Preparing => "preparing",
            LcMapStatus::Prepared => "prepared",
            LcMapStatus::Copying => "copying",
            LcMapStatus::Stopping => "stopping",
            LcMapStatus::Stopped => "stopped",
            LcMapStatus::End => "end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LcMapStatus::End)
    }

    /// States the array leaves on its own as time passes
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LcMapStatus::Preparing | LcMapStatus::Copying | LcMapStatus::Stopping
        )
    }
}

impl std::fmt::Display for LcMapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status text the array reported that is not a known status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl std::fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown status '{}'", self.0)
    }
}

impl FromStr for LcMapStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        LcMapStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Events that move a copy mapping between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LcMapTrigger {
    Prepare,
    FlushFailed,
    /// Time passing on the array
    Wait,
    Start,
    Stop,
    Delete,
    DeleteForce,
}

impl LcMapTrigger {
    pub const ALL: [LcMapTrigger; 7] = [
        LcMapTrigger::Prepare,
        LcMapTrigger::FlushFailed,
        LcMapTrigger::Wait,
        LcMapTrigger::Start,
        LcMapTrigger::Stop,
        LcMapTrigger::Delete,
        LcMapTrigger::DeleteForce,
    ];
}

impl std::fmt::Display for LcMapTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LcMapTrigger::Prepare => "prepare",
            LcMapTrigger::FlushFailed => "flush_failed",
            LcMapTrigger::Wait => "wait",
            LcMapTrigger::Start => "start",
            LcMapTrigger::Stop => "stop",
            LcMapTrigger::Delete => "delete",
            LcMapTrigger::DeleteForce => "delete_force",
        };
        f.write_str(s)
    }
}

/// The transition table.
///
/// `copy_complete` only matters for `copying --wait-->`: the copy leaves
/// `copying` once the background copy is done.
pub fn transition(status: LcMapStatus, trigger: LcMapTrigger, copy_complete: bool) -> Option<LcMapStatus> {
    use LcMapStatus::*;
    use LcMapTrigger as T;

    let next = match (status, trigger) {
        (IdleOrCopied, T::Prepare) => Preparing,
        (IdleOrCopied, T::Delete | T::DeleteForce) => End,
        (Preparing, T::FlushFailed) => Stopped,
        (Preparing, T::Wait) => Prepared,
        (Prepared, T::Stop) => Stopped,
        (Prepared, T::Start) => Copying,
        (Copying, T::Wait) if copy_complete => IdleOrCopied,
        (Copying, T::Wait) => Copying,
        (Copying, T::Stop) => Stopping,
        (Stopping, T::Wait) => Stopped,
        (Stopped, T::Prepare) => Preparing,
        (Stopped, T::DeleteForce) => End,
        _ => return None,
    };
    Some(next)
}

fn invalid(object: String, status: LcMapStatus, trigger: LcMapTrigger) -> Error {
    Error::InvalidStateTransition {
        object,
        state: status.to_string(),
        trigger: trigger.to_string(),
    }
}

// =============================================================================
// Copy Mapping
// =============================================================================

/// A point-in-time copy from a source vdisk to a target vdisk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyMapping {
    pub id: String,
    pub name: String,
    pub source: String,
    pub target: String,
    /// 0 = snapshot only, >0 = background copy percentage per wait
    pub copy_rate: u8,
    pub status: LcMapStatus,
    pub progress: u8,
    pub group: Option<String>,
    pub autodelete: bool,
}

impl CopyMapping {
    /// A freshly created mapping in `idle_or_copied`
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        copy_rate: u8,
    ) -> Self {
        let id = id.into();
        Self {
            name: format!("lcmap{}", id),
            id,
            source: source.into(),
            target: target.into(),
            copy_rate: copy_rate.min(100),
            status: LcMapStatus::IdleOrCopied,
            progress: 0,
            group: None,
            autodelete: false,
        }
    }

    /// Apply a trigger, returning the new status
    pub fn apply(&mut self, trigger: LcMapTrigger) -> Result<LcMapStatus> {
        let advancing = self.status == LcMapStatus::Copying && trigger == LcMapTrigger::Wait;
        let progress = if advancing && self.copy_rate > 0 {
            self.progress.saturating_add(self.copy_rate).min(100)
        } else {
            self.progress
        };
        let complete = self.copy_rate == 0 || progress >= 100;

        let next = transition(self.status, trigger, complete)
            .ok_or_else(|| invalid(format!("lcmap {}", self.id), self.status, trigger))?;

        if self.status == LcMapStatus::Prepared && trigger == LcMapTrigger::Start {
            self.progress = 0;
        } else {
            self.progress = progress;
        }
        self.status = next;
        Ok(next)
    }
}

// =============================================================================
// Consistency Group
// =============================================================================

/// A set of copy mappings that transition as one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LcConsistencyGroup {
    pub id: String,
    pub name: String,
    pub status: LcMapStatus,
    pub members: Vec<String>,
}

impl LcConsistencyGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: LcMapStatus::IdleOrCopied,
            members: Vec::new(),
        }
    }

    /// Check a trigger against the group status without applying it
    pub fn check(&self, trigger: LcMapTrigger) -> Result<LcMapStatus> {
        transition(self.status, trigger, false)
            .ok_or_else(|| invalid(format!("lcconsistgrp {}", self.name), self.status, trigger))
    }

    /// Apply a trigger; `members_done` tells whether every member finished copying
    pub fn apply(&mut self, trigger: LcMapTrigger, members_done: bool) -> Result<LcMapStatus> {
        let next = transition(self.status, trigger, members_done)
            .ok_or_else(|| invalid(format!("lcconsistgrp {}", self.name), self.status, trigger))?;
        self.status = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn legal(status: LcMapStatus, trigger: LcMapTrigger) -> bool {
        transition(status, trigger, false).is_some()
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let mut map = CopyMapping::new("0", "vol-1", "snap-1", 0);
        assert_eq!(map.status, LcMapStatus::IdleOrCopied);

        assert_eq!(map.apply(LcMapTrigger::Prepare).unwrap(), LcMapStatus::Preparing);
        assert_eq!(map.apply(LcMapTrigger::Wait).unwrap(), LcMapStatus::Prepared);
        assert_eq!(map.apply(LcMapTrigger::Start).unwrap(), LcMapStatus::Copying);
        assert_eq!(map.apply(LcMapTrigger::Wait).unwrap(), LcMapStatus::IdleOrCopied);
    }

    #[test]
    fn test_full_copy_finishes_only_at_100_percent() {
        let mut map = CopyMapping::new("1", "vol-1", "clone-1", 30);
        map.apply(LcMapTrigger::Prepare).unwrap();
        map.apply(LcMapTrigger::Wait).unwrap();
        map.apply(LcMapTrigger::Start).unwrap();

        let mut seen = Vec::new();
        while map.status == LcMapStatus::Copying {
            map.apply(LcMapTrigger::Wait).unwrap();
            seen.push((map.status, map.progress));
        }
        assert_eq!(
            seen,
            vec![
                (LcMapStatus::Copying, 30),
                (LcMapStatus::Copying, 60),
                (LcMapStatus::Copying, 90),
                (LcMapStatus::IdleOrCopied, 100),
            ]
        );
    }

    #[test]
    fn test_illegal_triggers_leave_status_unchanged() {
        for status in LcMapStatus::ALL {
            for trigger in LcMapTrigger::ALL {
                if legal(status, trigger) {
                    continue;
                }
                let mut map = CopyMapping::new("9", "a", "b", 50);
                map.status = status;
                map.progress = 40;
                let err = map.apply(trigger).unwrap_err();
                assert_matches!(err, Error::InvalidStateTransition { .. });
                assert_eq!(map.status, status, "{} on {}", trigger, status);
                assert_eq!(map.progress, 40);
            }
        }
    }

    #[test]
    fn test_stop_paths() {
        let mut map = CopyMapping::new("2", "a", "b", 50);
        map.apply(LcMapTrigger::Prepare).unwrap();
        assert_eq!(map.apply(LcMapTrigger::FlushFailed).unwrap(), LcMapStatus::Stopped);
        assert_matches!(map.apply(LcMapTrigger::Delete), Err(Error::InvalidStateTransition { .. }));
        assert_eq!(map.apply(LcMapTrigger::DeleteForce).unwrap(), LcMapStatus::End);

        let mut map = CopyMapping::new("3", "a", "b", 50);
        map.apply(LcMapTrigger::Prepare).unwrap();
        map.apply(LcMapTrigger::Wait).unwrap();
        map.apply(LcMapTrigger::Start).unwrap();
        assert_eq!(map.apply(LcMapTrigger::Stop).unwrap(), LcMapStatus::Stopping);
        assert_eq!(map.apply(LcMapTrigger::Wait).unwrap(), LcMapStatus::Stopped);
        assert_eq!(map.apply(LcMapTrigger::Prepare).unwrap(), LcMapStatus::Preparing);
    }

    #[test]
    fn test_status_round_trips_through_cli_text() {
        for status in LcMapStatus::ALL {
            assert_eq!(status.as_str().parse::<LcMapStatus>().unwrap(), status);
        }
        assert_eq!(
            "empty".parse::<LcMapStatus>(),
            Err(UnknownStatus("empty".into()))
        );
    }

    #[test]
    fn test_group_waits_for_members() {
        let mut group = LcConsistencyGroup::new("0", "cg-1");
        group.apply(LcMapTrigger::Prepare, false).unwrap();
        group.apply(LcMapTrigger::Wait, false).unwrap();
        group.apply(LcMapTrigger::Start, false).unwrap();
        assert_eq!(group.apply(LcMapTrigger::Wait, false).unwrap(), LcMapStatus::Copying);
        assert_eq!(group.apply(LcMapTrigger::Wait, true).unwrap(), LcMapStatus::IdleOrCopied);
        assert_matches!(group.check(LcMapTrigger::Start), Err(Error::InvalidStateTransition { .. }));
    }
}
