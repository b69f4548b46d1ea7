//! Replication Manager
//!
//! Owns the assistants for the local array and the replication target.
//! Failover hands every replicated volume to the target; failback waits for
//! the copies to resynchronize and hands them back.

use crate::assistant::{ArrayAssistant, LockKey, ObjectGuard};
use crate::config::{DriverConfig, ReplicationTargetConfig};
use crate::domain::ports::{
    ReplicationStatus, ReplicationType, SessionConnectorRef, VolumeRef, VolumeUpdate, VOLUME_STATUS_ERROR,
};
use crate::error::{Error, Result};
use crate::lifecycle::remote_copy::{RcPrimary, RcRelState, RemoteCopyRelationship};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name prefix of auxiliary vdisks on the replication target
pub const AUX_PREFIX: &str = "aux_";

/// Status given to a volume that was never failed over but has no saved status
const DEFAULT_VOLUME_STATUS: &str = "available";

pub fn aux_vdisk_name(volume: &str) -> String {
    format!("{}{}", AUX_PREFIX, volume)
}

/// Coordinates replication between the local array and one target
pub struct ReplicationManager {
    local: Arc<ArrayAssistant>,
    aux: Arc<ArrayAssistant>,
    local_pool: String,
    target: ReplicationTargetConfig,
    /// Backend the volumes currently run on, `None` while on the local array
    active_backend_id: RwLock<Option<String>>,
}

impl ReplicationManager {
    pub fn new(
        local: Arc<ArrayAssistant>,
        aux: Arc<ArrayAssistant>,
        local_pool: impl Into<String>,
        target: ReplicationTargetConfig,
    ) -> Self {
        Self {
            local,
            aux,
            local_pool: local_pool.into(),
            target,
            active_backend_id: RwLock::new(None),
        }
    }

    /// Build both assistants from a driver configuration
    pub fn from_config(config: &DriverConfig, connector: SessionConnectorRef) -> Result<Self> {
        config.validate()?;
        let target = config
            .replication
            .clone()
            .ok_or_else(|| Error::InvalidReplicationTarget {
                reason: "no replication target configured".into(),
            })?;
        let local = ArrayAssistant::connect(&config.array, Arc::clone(&connector), config.assistant.clone());
        let aux = ArrayAssistant::connect(&target.array, connector, config.assistant.clone());
        Ok(Self::new(Arc::new(local), Arc::new(aux), config.pool.clone(), target))
    }

    /// Resume with volumes already failed over to `backend_id`
    pub fn with_active_backend(mut self, backend_id: Option<String>) -> Self {
        self.active_backend_id = RwLock::new(backend_id);
        self
    }

    pub fn local(&self) -> &Arc<ArrayAssistant> {
        &self.local
    }

    pub fn aux(&self) -> &Arc<ArrayAssistant> {
        &self.aux
    }

    pub fn target(&self) -> &ReplicationTargetConfig {
        &self.target
    }

    pub async fn active_backend_id(&self) -> Option<String> {
        self.active_backend_id.read().await.clone()
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Create the partnership on whichever side lacks it, then start it.
    /// Running this again on a configured pair changes nothing.
    pub async fn establish_partnership(&self) -> Result<()> {
        let local = self.local.system_info().await?;
        let aux = self.aux.system_info().await?;

        let sides = [
            (&self.local, &aux.id, &aux.console_ip),
            (&self.aux, &local.id, &local.console_ip),
        ];
        for (assistant, remote_id, remote_ip) in sides {
            if assistant.get_partnership(remote_id).await?.is_none() {
                assistant
                    .create_ip_partnership(
                        remote_ip,
                        self.target.link_bandwidth_mbits,
                        self.target.background_copy_rate,
                    )
                    .await?;
            }
        }
        for (assistant, remote_id, _) in sides {
            let configured = assistant
                .get_partnership(remote_id)
                .await?
                .map_or(false, |p| p.is_fully_configured());
            if !configured {
                assistant.start_partnership(remote_id).await?;
            }
        }

        info!("Partnership {} <-> {} established", local.name, aux.name);
        Ok(())
    }

    // =========================================================================
    // Replicated Volumes
    // =========================================================================

    /// Serialize work on `volume` and its auxiliary copy; local side first
    async fn lock_volume(&self, volume: &str) -> (ObjectGuard, ObjectGuard) {
        let local = self.local.locks().lock(LockKey::Volume(volume.to_string())).await;
        let aux = self.aux.locks().lock(LockKey::Volume(aux_vdisk_name(volume))).await;
        (local, aux)
    }

    /// Create `name` locally, its auxiliary copy on the target and the
    /// relationship between them, and start replicating
    pub async fn create_replicated_volume(
        &self,
        name: &str,
        size_gb: u64,
        replication: ReplicationType,
    ) -> Result<RemoteCopyRelationship> {
        let _guards = self.lock_volume(name).await;
        let aux_name = aux_vdisk_name(name);
        self.local.create_vdisk_locked(name, size_gb, &self.local_pool).await?;

        let created = self.pair_with_aux(name, &aux_name, size_gb, replication).await;
        if created.is_err() {
            self.discard(&self.local, name).await;
        }
        created
    }

    async fn pair_with_aux(
        &self,
        name: &str,
        aux_name: &str,
        size_gb: u64,
        replication: ReplicationType,
    ) -> Result<RemoteCopyRelationship> {
        self.aux.create_vdisk_locked(aux_name, size_gb, &self.target.pool).await?;
        let related = self.relate(name, aux_name, replication).await;
        if related.is_err() {
            self.discard(&self.aux, aux_name).await;
        }
        related
    }

    async fn relate(&self, name: &str, aux_name: &str, replication: ReplicationType) -> Result<RemoteCopyRelationship> {
        let aux_system = self.aux.system_id().await?;
        let rel = self
            .local
            .create_relationship(name, aux_name, &aux_system, replication)
            .await?;
        if let Err(e) = self.local.start_relationship(&rel.name, None, false).await {
            if let Err(cleanup) = self.local.delete_relationship(&rel.name, true).await {
                warn!("Could not remove relationship {} after failed start: {}", rel.name, cleanup);
            }
            return Err(e);
        }
        info!("Replicating {} to {} ({})", name, aux_name, replication);
        Ok(rel)
    }

    /// Caller holds the volume lock on `vdisk`
    async fn discard(&self, assistant: &ArrayAssistant, vdisk: &str) {
        if let Err(e) = assistant.delete_vdisk_locked(vdisk, true).await {
            warn!("Could not remove {} after failed replication setup: {}", vdisk, e);
        }
    }

    /// Stop and remove the relationship of `name`, then both vdisks
    pub async fn delete_replicated_volume(&self, name: &str) -> Result<()> {
        let _guards = self.lock_volume(name).await;
        if let Some(rel) = self.local.get_relationship_info(name).await? {
            self.local.stop_relationship(&rel.name, false).await?;
            self.local.delete_relationship(&rel.name, true).await?;
        }
        self.local.delete_vdisk_locked(name, true).await?;
        self.aux.delete_vdisk_locked(&aux_vdisk_name(name), true).await?;
        info!("Deleted replicated volume {}", name);
        Ok(())
    }

    /// Relationship of `volume` as seen from the side currently active
    pub async fn replication_status(&self, volume: &str) -> Result<Option<RemoteCopyRelationship>> {
        if self.active_backend_id.read().await.is_some() {
            self.aux.get_relationship_info(&aux_vdisk_name(volume)).await
        } else {
            self.local.get_relationship_info(volume).await
        }
    }

    async fn aux_relationship(&self, volume: &str) -> Result<RemoteCopyRelationship> {
        let aux_name = aux_vdisk_name(volume);
        self.aux
            .get_relationship_info(&aux_name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "rcrelationship".into(),
                name: aux_name,
            })
    }

    // =========================================================================
    // Failover
    // =========================================================================

    /// Move every volume to `backend_id`.
    ///
    /// Replicated volumes become primary on the target. Volumes without a
    /// secondary copy are put into error with their status saved for
    /// failback. Failures of single volumes are reported in their update.
    pub async fn failover(&self, backend_id: &str, volumes: &[VolumeRef]) -> Result<Vec<VolumeUpdate>> {
        let mut active = self.active_backend_id.write().await;
        if backend_id != self.target.backend_id {
            return Err(Error::InvalidReplicationTarget {
                reason: format!("unknown backend id '{}'", backend_id),
            });
        }
        if let Some(current) = active.as_deref() {
            return Err(Error::InvalidReplicationTarget {
                reason: format!("already failed over to '{}'", current),
            });
        }
        self.aux
            .system_info()
            .await
            .map_err(|e| Error::UnableToFailOver {
                reason: format!("replication target {} unreachable: {}", backend_id, e),
            })?;

        info!("Failing over {} volumes to {}", volumes.len(), backend_id);
        let mut updates = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let update = if volume.is_replicated() {
                match self.failover_volume(&volume.name).await {
                    Ok(()) => VolumeUpdate {
                        volume: volume.name.clone(),
                        status: None,
                        replication_status: ReplicationStatus::FailedOver,
                        saved_status: volume.saved_status.clone(),
                        error: None,
                    },
                    Err(e) => {
                        error!("Failover of {} failed: {}", volume.name, e);
                        VolumeUpdate {
                            volume: volume.name.clone(),
                            status: Some(VOLUME_STATUS_ERROR.into()),
                            replication_status: ReplicationStatus::Error,
                            saved_status: Some(volume.status.clone()),
                            error: Some(e.to_string()),
                        }
                    }
                }
            } else {
                debug!("{} is not replicated, marking it {}", volume.name, VOLUME_STATUS_ERROR);
                VolumeUpdate {
                    volume: volume.name.clone(),
                    status: Some(VOLUME_STATUS_ERROR.into()),
                    replication_status: ReplicationStatus::Disabled,
                    saved_status: Some(volume.status.clone()),
                    error: None,
                }
            };
            updates.push(update);
        }

        *active = Some(backend_id.to_string());
        info!("Failed over to {}", backend_id);
        Ok(updates)
    }

    async fn failover_volume(&self, volume: &str) -> Result<()> {
        let _guards = self.lock_volume(volume).await;
        let rel = self.aux_relationship(volume).await?;
        match self.aux.switch_relationship(&rel.name, RcPrimary::Aux).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_protocol_level() => {
                warn!("Switch of {} rejected ({}), enabling access on the target", rel.name, e);
                self.aux.stop_relationship(&rel.name, true).await
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Failback
    // =========================================================================

    /// Return every volume to the local array.
    ///
    /// Replicated volumes resynchronize from the target before their roles
    /// are switched back; volumes put into error by failover get their
    /// saved status back.
    pub async fn failback(&self, volumes: &[VolumeRef], cancel: &CancellationToken) -> Result<Vec<VolumeUpdate>> {
        let mut active = self.active_backend_id.write().await;
        let Some(current) = active.clone() else {
            return Err(Error::InvalidReplicationTarget {
                reason: "not failed over".into(),
            });
        };
        self.local
            .system_info()
            .await
            .map_err(|e| Error::UnableToFailOver {
                reason: format!("local array unreachable: {}", e),
            })?;

        info!("Failing back {} volumes from {}", volumes.len(), current);
        let updates = join_all(volumes.iter().map(|volume| self.failback_one(volume, cancel))).await;

        *active = None;
        info!("Failed back from {}", current);
        Ok(updates)
    }

    async fn failback_one(&self, volume: &VolumeRef, cancel: &CancellationToken) -> VolumeUpdate {
        if !volume.is_replicated() {
            let status = volume
                .saved_status
                .clone()
                .unwrap_or_else(|| DEFAULT_VOLUME_STATUS.to_string());
            return VolumeUpdate {
                volume: volume.name.clone(),
                status: Some(status),
                replication_status: ReplicationStatus::Disabled,
                saved_status: None,
                error: None,
            };
        }

        match self.failback_volume(&volume.name, cancel).await {
            // A volume failover put into error gets its saved status back
            Ok(()) => VolumeUpdate {
                volume: volume.name.clone(),
                status: volume.saved_status.clone(),
                replication_status: ReplicationStatus::Enabled,
                saved_status: None,
                error: None,
            },
            Err(e) => {
                error!("Failback of {} failed: {}", volume.name, e);
                VolumeUpdate {
                    volume: volume.name.clone(),
                    status: Some(VOLUME_STATUS_ERROR.into()),
                    replication_status: ReplicationStatus::Error,
                    saved_status: volume.saved_status.clone(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn failback_volume(&self, volume: &str, cancel: &CancellationToken) -> Result<()> {
        let _guards = self.lock_volume(volume).await;
        let rel = self.aux_relationship(volume).await?;
        if rel.state.is_stopped() {
            self.aux
                .start_relationship(&rel.name, Some(RcPrimary::Aux), true)
                .await?;
        }
        self.aux
            .wait_for_relationship_state(&rel.name, RcRelState::ConsistentSynchronized, cancel)
            .await?;
        self.aux.switch_relationship(&rel.name, RcPrimary::Master).await
    }
}
