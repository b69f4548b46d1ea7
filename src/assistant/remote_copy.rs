//! Remote-copy relationships and partnerships between arrays

use super::{not_found, require, require_parsed, ArrayAssistant, NOT_FOUND_CODES};
use crate::assistant::polling::{poll_until, PollOutcome};
use crate::cli::commands::ArrayCommand;
use crate::domain::ports::ReplicationType;
use crate::error::{Error, Result};
use crate::lifecycle::remote_copy::{RcPrimary, RcRelState, RemoteCopyRelationship};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A partnership as seen from the local array
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartnershipInfo {
    /// Remote system id
    pub id: String,
    pub name: String,
    pub state: String,
    pub cluster_ip: String,
}

impl PartnershipInfo {
    pub fn is_fully_configured(&self) -> bool {
        self.state == "fully_configured"
    }
}

impl ArrayAssistant {
    // =========================================================================
    // Relationships
    // =========================================================================

    pub async fn get_relationship(&self, name: &str) -> Result<Option<RemoteCopyRelationship>> {
        let command = ArrayCommand::LsRcRelationship { name: name.to_string() };
        let Some(record) = self.lookup(&command).await? else {
            return Ok(None);
        };

        let copy_type = match require(&record, "copy_type", &command)? {
            "metro" => ReplicationType::Sync,
            "global" => ReplicationType::Async,
            other => {
                return Err(Error::ProtocolMismatch {
                    command: command.to_string(),
                    detail: format!("unknown copy type '{}'", other),
                })
            }
        };
        let primary = match record.get_str("primary") {
            None | Some("") => None,
            Some(_) => Some(require_parsed::<RcPrimary>(&record, "primary", &command)?),
        };

        let mut rel = RemoteCopyRelationship::new(
            require(&record, "id", &command)?,
            require(&record, "master_vdisk_name", &command)?,
            require(&record, "aux_vdisk_name", &command)?,
            require(&record, "master_cluster_id", &command)?,
            require(&record, "aux_cluster_id", &command)?,
            copy_type,
        );
        rel.name = require(&record, "name", &command)?.to_string();
        rel.state = require_parsed(&record, "state", &command)?;
        rel.progress = require_parsed(&record, "progress", &command)?;
        rel.primary = primary;
        Ok(Some(rel))
    }

    async fn require_relationship(&self, name: &str) -> Result<RemoteCopyRelationship> {
        self.get_relationship(name)
            .await?
            .ok_or_else(|| not_found("rcrelationship", name))
    }

    /// The relationship `vdisk` belongs to, if any
    pub async fn get_relationship_info(&self, vdisk: &str) -> Result<Option<RemoteCopyRelationship>> {
        let Some(info) = self.get_vdisk(vdisk).await? else {
            return Ok(None);
        };
        match info.rc_name {
            Some(name) => self.get_relationship(&name).await,
            None => Ok(None),
        }
    }

    /// Create a relationship from local `master` to `aux` on `aux_system`
    pub async fn create_relationship(
        &self,
        master: &str,
        aux: &str,
        aux_system: &str,
        copy_type: ReplicationType,
    ) -> Result<RemoteCopyRelationship> {
        let id = self
            .run_create(&ArrayCommand::MkRcRelationship {
                master: master.to_string(),
                aux: aux.to_string(),
                aux_system: aux_system.to_string(),
                copy_type,
            })
            .await?;
        let rel = self.require_relationship(&id).await?;
        info!("Created {} relationship {} ({} -> {})", copy_type, rel.name, master, aux);
        Ok(rel)
    }

    /// Start copying; a relationship that is already copying is left alone
    pub async fn start_relationship(&self, name: &str, primary: Option<RcPrimary>, force: bool) -> Result<()> {
        let rel = self.require_relationship(name).await?;
        if !rel.state.is_stopped() {
            debug!("Relationship {} already {}", name, rel.state);
            return Ok(());
        }
        self.run(&ArrayCommand::StartRcRelationship {
            name: name.to_string(),
            primary,
            force,
        })
        .await?;
        info!("Started relationship {} from {}", name, primary.unwrap_or(RcPrimary::Master));
        Ok(())
    }

    /// Stop copying; with `access` the secondary becomes writable
    pub async fn stop_relationship(&self, name: &str, access: bool) -> Result<()> {
        let rel = self.require_relationship(name).await?;
        let already = if access {
            rel.state == RcRelState::Idling
        } else {
            rel.state.is_stopped()
        };
        if already {
            debug!("Relationship {} already {}", name, rel.state);
            return Ok(());
        }
        self.run(&ArrayCommand::StopRcRelationship {
            name: name.to_string(),
            access,
        })
        .await?;
        info!("Stopped relationship {}{}", name, if access { " with access" } else { "" });
        Ok(())
    }

    /// Make `primary` the copy source without breaking synchronization
    pub async fn switch_relationship(&self, name: &str, primary: RcPrimary) -> Result<()> {
        let rel = self.require_relationship(name).await?;
        if rel.primary == Some(primary) && rel.state == RcRelState::ConsistentSynchronized {
            debug!("Relationship {} already has primary {}", name, primary);
            return Ok(());
        }
        self.run(&ArrayCommand::SwitchRcRelationship {
            name: name.to_string(),
            primary,
        })
        .await?;
        info!("Switched relationship {} to primary {}", name, primary);
        Ok(())
    }

    pub async fn delete_relationship(&self, name: &str, force: bool) -> Result<()> {
        if self.get_relationship(name).await?.is_none() {
            return Ok(());
        }
        self.run(&ArrayCommand::RmRcRelationship {
            name: name.to_string(),
            force,
        })
        .await?;
        info!("Deleted relationship {}", name);
        Ok(())
    }

    /// Poll relationship `name` until it reaches `want`
    pub async fn wait_for_relationship_state(
        &self,
        name: &str,
        want: RcRelState,
        cancel: &CancellationToken,
    ) -> Result<RemoteCopyRelationship> {
        let timeout = self.config.sync_timeout();
        let outcome = poll_until(self.config.sync_poll_interval(), timeout, cancel, move || async move {
            let rel = self.require_relationship(name).await?;
            if rel.state == want {
                Ok(Some(rel))
            } else {
                debug!("Relationship {} is {} ({}%), waiting for {}", name, rel.state, rel.progress, want);
                Ok(None)
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(rel) => Ok(rel),
            PollOutcome::TimedOut => Err(Error::SyncTimeout {
                object: format!("rcrelationship {}", name),
                waited: timeout,
            }),
            PollOutcome::Cancelled => Err(Error::Cancelled {
                object: format!("rcrelationship {}", name),
            }),
        }
    }

    // =========================================================================
    // Partnerships
    // =========================================================================

    /// Partnerships with remote systems
    pub async fn list_partnerships(&self) -> Result<Vec<PartnershipInfo>> {
        let command = ArrayCommand::LsPartnership;
        let records = match self.run_inquiry(&command).await {
            Ok(records) => records,
            Err(e) if e.has_cli_code(NOT_FOUND_CODES) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let keys = ["id", "name", "location", "partnership", "cluster_ip"];
        let mut partnerships = Vec::new();
        for row in records.project(&keys) {
            match row.as_slice() {
                [_, _, Some("local"), _, _] => continue,
                [Some(id), Some(name), _, Some(state), cluster_ip] => partnerships.push(PartnershipInfo {
                    id: id.to_string(),
                    name: name.to_string(),
                    state: state.to_string(),
                    cluster_ip: cluster_ip.unwrap_or_default().to_string(),
                }),
                _ => {
                    return Err(Error::MissingField {
                        command: command.to_string(),
                        field: keys.join(","),
                    })
                }
            }
        }
        Ok(partnerships)
    }

    /// Partnership with remote system `system_id`
    pub async fn get_partnership(&self, system_id: &str) -> Result<Option<PartnershipInfo>> {
        Ok(self
            .list_partnerships()
            .await?
            .into_iter()
            .find(|p| p.id == system_id))
    }

    pub async fn create_ip_partnership(
        &self,
        cluster_ip: &str,
        link_bandwidth_mbits: u32,
        background_copy_rate: u8,
    ) -> Result<()> {
        self.run(&ArrayCommand::MkIpPartnership {
            cluster_ip: cluster_ip.to_string(),
            link_bandwidth_mbits,
            background_copy_rate,
        })
        .await?;
        info!("Created IP partnership to {}", cluster_ip);
        Ok(())
    }

    pub async fn start_partnership(&self, name: &str) -> Result<()> {
        self.run(&ArrayCommand::StartPartnership { name: name.to_string() })
            .await?;
        info!("Started partnership with {}", name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::assistant::tests::assistant_for;
    use crate::domain::ports::ReplicationType;
    use crate::error::Error;
    use crate::lifecycle::remote_copy::{RcPrimary, RcRelState};
    use crate::simulator::{SimulatedFabric, SimulatorConfig};
    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn test_relationship_lifecycle() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let a = fabric.add_array("array-a", "10.0.0.1");
        let b = fabric.add_array("array-b", "10.0.1.1");
        let local = assistant_for(&fabric, &a);
        let remote = assistant_for(&fabric, &b);
        a.add_vdisk("vol-1", "pool0", 4);
        b.add_vdisk("aux_vol-1", "pool0", 4);

        // No partnership yet
        assert_matches!(
            local
                .create_relationship("vol-1", "aux_vol-1", b.system_id(), ReplicationType::Sync)
                .await,
            Err(Error::ArrayCommand { .. })
        );

        local.create_ip_partnership("10.0.1.1", 1000, 50).await.unwrap();
        let partnership = local.get_partnership(b.system_id()).await.unwrap().unwrap();
        assert_eq!(partnership.state, "partially_configured_local");
        remote.create_ip_partnership("10.0.0.1", 1000, 50).await.unwrap();
        local.start_partnership(b.system_id()).await.unwrap();
        remote.start_partnership(a.system_id()).await.unwrap();
        assert!(local.list_partnerships().await.unwrap()[0].is_fully_configured());

        let rel = local
            .create_relationship("vol-1", "aux_vol-1", b.system_id(), ReplicationType::Sync)
            .await
            .unwrap();
        assert_eq!(rel.state, RcRelState::InconsistentStopped);
        assert_eq!(rel.aux_system, b.system_id());

        local.start_relationship(&rel.name, None, false).await.unwrap();
        let synced = local
            .wait_for_relationship_state(&rel.name, RcRelState::ConsistentSynchronized, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(synced.primary, Some(RcPrimary::Master));

        // Both sides see the same relationship
        let from_aux = remote.get_relationship_info("aux_vol-1").await.unwrap().unwrap();
        assert_eq!(from_aux.name, rel.name);

        remote.switch_relationship(&rel.name, RcPrimary::Aux).await.unwrap();
        assert_eq!(
            local.get_relationship(&rel.name).await.unwrap().unwrap().primary,
            Some(RcPrimary::Aux)
        );

        local.stop_relationship(&rel.name, true).await.unwrap();
        local.stop_relationship(&rel.name, true).await.unwrap();
        let idle = local.get_relationship(&rel.name).await.unwrap().unwrap();
        assert_eq!(idle.state, RcRelState::Idling);
        assert_eq!(idle.primary, None);

        local.delete_relationship(&rel.name, true).await.unwrap();
        assert!(local.get_relationship_info("vol-1").await.unwrap().is_none());
        assert!(fabric.relationships().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_wait_times_out() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let a = fabric.add_array("array-a", "10.0.0.1");
        let b = fabric.add_array("array-b", "10.0.1.1");
        let mut local = assistant_for(&fabric, &a);
        local.config.sync_timeout_secs = 1;
        local.config.sync_poll_interval_ms = 100;
        let remote = assistant_for(&fabric, &b);
        a.add_vdisk("vol-1", "pool0", 4);
        b.add_vdisk("aux_vol-1", "pool0", 4);
        local.create_ip_partnership("10.0.1.1", 1000, 50).await.unwrap();
        remote.create_ip_partnership("10.0.0.1", 1000, 50).await.unwrap();
        local.start_partnership("array-b").await.unwrap();
        remote.start_partnership("array-a").await.unwrap();

        let rel = local
            .create_relationship("vol-1", "aux_vol-1", b.system_id(), ReplicationType::Async)
            .await
            .unwrap();
        assert_eq!(rel.copy_type, ReplicationType::Async);
        a.stall_sync(true);
        local.start_relationship(&rel.name, None, false).await.unwrap();

        assert_matches!(
            local
                .wait_for_relationship_state(&rel.name, RcRelState::ConsistentSynchronized, &CancellationToken::new())
                .await,
            Err(Error::SyncTimeout { .. })
        );
    }
}
