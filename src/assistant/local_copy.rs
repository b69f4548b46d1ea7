//! LocalCopy orchestration: copy mappings, snapshots, clones and
//! consistency-group snapshots.

use super::{non_empty, not_found, require, require_parsed, ArrayAssistant, LockKey, NOT_FOUND_CODES};
use crate::assistant::polling::{poll_until, PollOutcome};
use crate::cli::commands::ArrayCommand;
use crate::error::{Error, Result};
use crate::lifecycle::copy_mapping::{CopyMapping, LcConsistencyGroup, LcMapStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl ArrayAssistant {
    // =========================================================================
    // Mappings
    // =========================================================================

    /// Ids of the copy mappings `vdisk` is source or target of
    pub async fn get_vdisk_lc_mappings(&self, vdisk: &str) -> Result<Vec<String>> {
        let command = ArrayCommand::LsVdiskLcMappings { vdisk: vdisk.to_string() };
        let records = match self.run_inquiry(&command).await {
            Ok(records) => records,
            Err(e) if e.has_cli_code(NOT_FOUND_CODES) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        records
            .project_one("id")
            .map(|id| {
                id.map(str::to_string).ok_or_else(|| Error::MissingField {
                    command: command.to_string(),
                    field: "id".into(),
                })
            })
            .collect()
    }

    pub async fn get_lcmap(&self, id: &str) -> Result<Option<CopyMapping>> {
        let command = ArrayCommand::LsLcMap { id: id.to_string() };
        let Some(record) = self.lookup(&command).await? else {
            return Ok(None);
        };
        Ok(Some(CopyMapping {
            id: require(&record, "id", &command)?.to_string(),
            name: require(&record, "name", &command)?.to_string(),
            source: require(&record, "source_vdisk_name", &command)?.to_string(),
            target: require(&record, "target_vdisk_name", &command)?.to_string(),
            copy_rate: require_parsed(&record, "copy_rate", &command)?,
            status: require_parsed(&record, "status", &command)?,
            progress: require_parsed(&record, "progress", &command)?,
            group: non_empty(record.get_str("group_name")),
            autodelete: record.get_str("autodelete") == Some("on"),
        }))
    }

    async fn require_lcmap(&self, id: &str) -> Result<CopyMapping> {
        self.get_lcmap(id).await?.ok_or_else(|| not_found("lcmap", id))
    }

    /// Create a mapping from `source` to `target`; both must exist with equal size
    pub async fn create_lcmap(
        &self,
        source: &str,
        target: &str,
        copy_rate: u8,
        consistgrp: Option<&str>,
        autodelete: bool,
    ) -> Result<String> {
        let src = self.require_vdisk(source).await?;
        let tgt = self.require_vdisk(target).await?;
        if src.capacity != tgt.capacity {
            return Err(Error::SizeMismatch {
                source_name: src.name,
                source_size: src.capacity,
                target_name: tgt.name,
                target_size: tgt.capacity,
            });
        }
        if copy_rate > 100 {
            return Err(Error::InvalidInput(format!("copy rate {} exceeds 100", copy_rate)));
        }

        let id = self
            .run_create(&ArrayCommand::MkLcMap {
                source: source.to_string(),
                target: target.to_string(),
                copy_rate,
                consistgrp: consistgrp.map(str::to_string),
                autodelete,
            })
            .await?;
        info!("Created lcmap {} ({} -> {}, rate {})", id, source, target, copy_rate);
        Ok(id)
    }

    pub async fn prepare_lcmap(&self, id: &str) -> Result<()> {
        self.run(&ArrayCommand::PrestartLcMap { id: id.to_string() }).await?;
        debug!("Preparing lcmap {}", id);
        Ok(())
    }

    pub async fn start_lcmap(&self, id: &str) -> Result<()> {
        self.run(&ArrayCommand::StartLcMap { id: id.to_string() }).await?;
        debug!("Started lcmap {}", id);
        Ok(())
    }

    pub async fn stop_lcmap(&self, id: &str, force: bool) -> Result<()> {
        self.run(&ArrayCommand::StopLcMap {
            id: id.to_string(),
            force,
        })
        .await?;
        debug!("Stopping lcmap {}", id);
        Ok(())
    }

    pub async fn rm_lcmap(&self, id: &str, force: bool) -> Result<()> {
        self.run(&ArrayCommand::RmLcMap {
            id: id.to_string(),
            force,
        })
        .await?;
        debug!("Removed lcmap {}", id);
        Ok(())
    }

    /// Progress of a mapping's background copy; `None` once it is gone
    pub async fn local_copy_progress(&self, id: &str) -> Result<Option<u8>> {
        Ok(self.get_lcmap(id).await?.map(|m| m.progress))
    }

    // =========================================================================
    // Waits
    // =========================================================================

    /// Wait until mapping `id` is `prepared`. On failure, timeout or
    /// cancellation the mapping is stopped and removed.
    pub async fn wait_for_lcmap_prepared(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.config.prepare_timeout();
        let outcome = poll_until(self.config.lcmap_poll_interval(), timeout, cancel, move || async move {
            let map = self.require_lcmap(id).await?;
            match map.status {
                LcMapStatus::Prepared => Ok(Some(())),
                LcMapStatus::Preparing => Ok(None),
                status => Err(Error::LocalCopyFailed {
                    mapping: id.to_string(),
                    status: status.to_string(),
                }),
            }
        })
        .await;

        let error = match outcome {
            Ok(PollOutcome::Ready(())) => return Ok(()),
            Ok(PollOutcome::TimedOut) => Error::PrepareTimeout {
                object: format!("lcmap {}", id),
                waited: timeout,
            },
            Ok(PollOutcome::Cancelled) => Error::Cancelled {
                object: format!("lcmap {}", id),
            },
            Err(e) => e,
        };
        warn!("lcmap {} did not prepare: {}", id, error);
        self.rollback_lcmap(id).await;
        Err(error)
    }

    /// Wait until the background copy of mapping `id` has finished.
    ///
    /// A mapping that disappears was removed by autodelete and counts as
    /// finished.
    pub async fn wait_for_copy_complete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.config.copy_timeout();
        let outcome = poll_until(self.config.lcmap_poll_interval(), timeout, cancel, move || async move {
            let Some(map) = self.get_lcmap(id).await? else {
                return Ok(Some(()));
            };
            match map.status {
                LcMapStatus::IdleOrCopied => Ok(Some(())),
                LcMapStatus::Copying => {
                    debug!("lcmap {} at {}%", id, map.progress);
                    Ok(None)
                }
                status => Err(Error::LocalCopyFailed {
                    mapping: id.to_string(),
                    status: status.to_string(),
                }),
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(()) => Ok(()),
            PollOutcome::TimedOut => Err(Error::SyncTimeout {
                object: format!("lcmap {}", id),
                waited: timeout,
            }),
            PollOutcome::Cancelled => Err(Error::Cancelled {
                object: format!("lcmap {}", id),
            }),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Stop mapping `id` if it is active, wait for it to stop and remove it
    pub async fn teardown_lcmap(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(LockKey::LcMap(id.to_string())).await;
        self.stop_and_remove(id).await
    }

    async fn stop_and_remove(&self, id: &str) -> Result<()> {
        let Some(map) = self.get_lcmap(id).await? else {
            return Ok(());
        };
        if matches!(
            map.status,
            LcMapStatus::Preparing | LcMapStatus::Prepared | LcMapStatus::Copying
        ) {
            self.stop_lcmap(id, true).await?;
        }

        let stopped = poll_until(
            self.config.lcmap_poll_interval(),
            self.config.prepare_timeout(),
            &CancellationToken::new(),
            move || async move {
                Ok(match self.get_lcmap(id).await? {
                    None => Some(false),
                    Some(map) if map.status.is_transient() => None,
                    Some(_) => Some(true),
                })
            },
        )
        .await?;

        match stopped {
            PollOutcome::Ready(true) => self.rm_lcmap(id, true).await,
            PollOutcome::Ready(false) => Ok(()),
            _ => Err(Error::PrepareTimeout {
                object: format!("lcmap {} stopping", id),
                waited: self.config.prepare_timeout(),
            }),
        }
    }

    /// Best-effort teardown after a failed copy; failures are only logged
    async fn rollback_lcmap(&self, id: &str) {
        match self.stop_and_remove(id).await {
            Ok(()) => info!("Rolled back lcmap {}", id),
            Err(e) => warn!("Rollback of lcmap {} failed: {}", id, e),
        }
    }

    // =========================================================================
    // Copies
    // =========================================================================

    /// Create, prepare and start a mapping from `source` to `target`.
    ///
    /// Returns the mapping id once the copy is running. Every failure after
    /// creation removes the mapping again.
    pub async fn run_local_copy(
        &self,
        source: &str,
        target: &str,
        copy_rate: u8,
        autodelete: bool,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let id = self.create_lcmap(source, target, copy_rate, None, autodelete).await?;
        let _guard = self.locks.lock(LockKey::LcMap(id.clone())).await;

        if let Err(e) = self.prepare_lcmap(&id).await {
            self.rollback_lcmap(&id).await;
            return Err(e);
        }
        self.wait_for_lcmap_prepared(&id, cancel).await?;
        if let Err(e) = self.start_lcmap(&id).await {
            self.rollback_lcmap(&id).await;
            return Err(e);
        }
        info!("Local copy {} -> {} running as lcmap {}", source, target, id);
        Ok(id)
    }

    /// Remove a target vdisk created for a copy that did not complete
    async fn discard_target(&self, target: &str) {
        if let Err(e) = self.delete_vdisk(target, true).await {
            warn!("Could not remove copy target {}: {}", target, e);
        }
    }

    /// Point-in-time snapshot of `source` into a new vdisk `name`
    pub async fn create_snapshot(&self, source: &str, name: &str, cancel: &CancellationToken) -> Result<String> {
        let src = self.require_vdisk(source).await?;
        self.create_vdisk(name, src.size_gb(), &src.pool).await?;

        match self.run_local_copy(source, name, 0, false, cancel).await {
            Ok(id) => {
                info!("Snapshot {} of {} taken (lcmap {})", name, source, id);
                Ok(id)
            }
            Err(e) => {
                self.discard_target(name).await;
                Err(e)
            }
        }
    }

    /// Full independent copy of `source` into a new vdisk `name`.
    ///
    /// Waits for the background copy; the mapping deletes itself when done.
    pub async fn create_clone(&self, source: &str, name: &str, cancel: &CancellationToken) -> Result<()> {
        let src = self.require_vdisk(source).await?;
        self.create_vdisk(name, src.size_gb(), &src.pool).await?;

        let id = match self
            .run_local_copy(source, name, self.config.clone_copy_rate, true, cancel)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.discard_target(name).await;
                return Err(e);
            }
        };
        if let Err(e) = self.wait_for_copy_complete(&id, cancel).await {
            self.rollback_lcmap(&id).await;
            self.discard_target(name).await;
            return Err(e);
        }
        info!("Clone {} of {} complete", name, source);
        Ok(())
    }

    // =========================================================================
    // Consistency Groups
    // =========================================================================

    pub async fn get_lc_consistgrp(&self, name: &str) -> Result<Option<LcConsistencyGroup>> {
        let command = ArrayCommand::LsLcConsistGrp { name: name.to_string() };
        let Some(record) = self.lookup(&command).await? else {
            return Ok(None);
        };
        Ok(Some(LcConsistencyGroup {
            id: require(&record, "id", &command)?.to_string(),
            name: require(&record, "name", &command)?.to_string(),
            status: require_parsed(&record, "status", &command)?,
            members: record
                .get("LC_mapping_id")
                .map(|ids| ids.values().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
        }))
    }

    async fn wait_for_group(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.config.prepare_timeout();
        let outcome = poll_until(self.config.lcmap_poll_interval(), timeout, cancel, move || async move {
            let group = self
                .get_lc_consistgrp(name)
                .await?
                .ok_or_else(|| not_found("lcconsistgrp", name))?;
            match group.status {
                LcMapStatus::Prepared => Ok(Some(())),
                LcMapStatus::Preparing => Ok(None),
                status => Err(Error::LocalCopyFailed {
                    mapping: format!("lcconsistgrp {}", name),
                    status: status.to_string(),
                }),
            }
        })
        .await?;

        match outcome {
            PollOutcome::Ready(()) => Ok(()),
            PollOutcome::TimedOut => Err(Error::PrepareTimeout {
                object: format!("lcconsistgrp {}", name),
                waited: timeout,
            }),
            PollOutcome::Cancelled => Err(Error::Cancelled {
                object: format!("lcconsistgrp {}", name),
            }),
        }
    }

    /// Snapshot every `(source, target)` pair at the same point in time.
    ///
    /// Targets are created with their source's size and pool, then mapped
    /// into consistency group `group`, which is prepared and started as one.
    /// Returns the member mapping ids.
    pub async fn create_group_snapshot(
        &self,
        group: &str,
        pairs: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        if pairs.is_empty() {
            return Err(Error::InvalidInput(format!("group snapshot {} has no members", group)));
        }
        self.run_create(&ArrayCommand::MkLcConsistGrp { name: group.to_string() })
            .await?;
        info!("Created lcconsistgrp {}", group);

        let mut created = Vec::with_capacity(pairs.len());
        match self.populate_and_start_group(group, pairs, &mut created, cancel).await {
            Ok(ids) => {
                info!("Group snapshot {} started with {} mappings", group, ids.len());
                Ok(ids)
            }
            Err(e) => {
                warn!("Group snapshot {} failed: {}", group, e);
                if let Err(rollback) = self.delete_group_snapshot(group).await {
                    warn!("Rollback of group {} failed: {}", group, rollback);
                }
                for target in &created {
                    self.discard_target(target).await;
                }
                Err(e)
            }
        }
    }

    async fn populate_and_start_group(
        &self,
        group: &str,
        pairs: &[(String, String)],
        created: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(pairs.len());
        for (source, target) in pairs {
            let src = self.require_vdisk(source).await?;
            self.create_vdisk(target, src.size_gb(), &src.pool).await?;
            created.push(target.clone());
            ids.push(self.create_lcmap(source, target, 0, Some(group), false).await?);
        }

        self.run(&ArrayCommand::PrestartLcConsistGrp { name: group.to_string() })
            .await?;
        self.wait_for_group(group, cancel).await?;
        self.run(&ArrayCommand::StartLcConsistGrp { name: group.to_string() })
            .await?;
        Ok(ids)
    }

    /// Stop and remove consistency group `group`, its mappings and their
    /// target vdisks
    pub async fn delete_group_snapshot(&self, group: &str) -> Result<()> {
        let Some(found) = self.get_lc_consistgrp(group).await? else {
            debug!("lcconsistgrp {} does not exist", group);
            return Ok(());
        };

        let mut targets = Vec::with_capacity(found.members.len());
        for id in &found.members {
            if let Some(map) = self.get_lcmap(id).await? {
                targets.push(map.target);
            }
        }

        if matches!(
            found.status,
            LcMapStatus::Preparing | LcMapStatus::Prepared | LcMapStatus::Copying
        ) {
            self.run(&ArrayCommand::StopLcConsistGrp {
                name: group.to_string(),
                force: true,
            })
            .await?;
        }
        let settled = poll_until(
            self.config.lcmap_poll_interval(),
            self.config.prepare_timeout(),
            &CancellationToken::new(),
            move || async move {
                Ok(match self.get_lc_consistgrp(group).await? {
                    Some(g) if g.status.is_transient() => None,
                    _ => Some(()),
                })
            },
        )
        .await?;
        if settled == PollOutcome::TimedOut {
            return Err(Error::PrepareTimeout {
                object: format!("lcconsistgrp {} stopping", group),
                waited: self.config.prepare_timeout(),
            });
        }

        self.run(&ArrayCommand::RmLcConsistGrp {
            name: group.to_string(),
            force: true,
        })
        .await?;
        for id in &found.members {
            self.teardown_lcmap(id).await?;
        }
        for target in &targets {
            self.delete_vdisk(target, true).await?;
        }
        info!("Deleted group snapshot {} ({} targets)", group, targets.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::assistant::tests::assistant_for;
    use crate::assistant::ArrayAssistant;
    use crate::config::{ArrayConfig, AssistantConfig};
    use crate::error::Error;
    use crate::lifecycle::copy_mapping::LcMapStatus;
    use crate::simulator::{SimulatedArray, SimulatedFabric, SimulatorConfig};
    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (SimulatedFabric, SimulatedArray, ArrayAssistant) {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        array.add_vdisk("vol-1", "pool0", 10);
        let assistant = assistant_for(&fabric, &array);
        (fabric, array, assistant)
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot() {
        let (_fabric, array, assistant) = setup();
        let cancel = CancellationToken::new();

        let id = assistant.create_snapshot("vol-1", "snap-1", &cancel).await.unwrap();
        assert!(array.has_vdisk("snap-1"));
        assert_eq!(assistant.get_vdisk_lc_mappings("vol-1").await.unwrap(), vec![id.clone()]);

        let map = assistant.get_lcmap(&id).await.unwrap().unwrap();
        assert_eq!(map.source, "vol-1");
        assert_eq!(map.target, "snap-1");
        assert_eq!(map.copy_rate, 0);
        assert_eq!(map.status, LcMapStatus::IdleOrCopied);

        assert_matches!(
            assistant.delete_vdisk("snap-1", false).await,
            Err(Error::ObjectInUse { users, .. }) if users == vec![id.clone()]
        );
        assistant.delete_vdisk("snap-1", true).await.unwrap();
        assert!(!array.has_vdisk("snap-1"));
        assert!(array.lcmaps().is_empty());
    }

    #[tokio::test]
    async fn test_create_lcmap_checks_sizes_first() {
        let (_fabric, array, assistant) = setup();
        array.add_vdisk("small", "pool0", 5);

        assert_matches!(
            assistant.create_lcmap("vol-1", "small", 0, None, false).await,
            Err(Error::SizeMismatch { source_size, target_size, .. })
                if source_size == 10 << 30 && target_size == 5 << 30
        );
        assert_matches!(
            assistant.create_lcmap("vol-1", "ghost", 0, None, false).await,
            Err(Error::NotFound { .. })
        );
        assert!(array.command_log().iter().all(|c| !c.contains("mklcmap")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_runs_to_completion() {
        let (_fabric, array, assistant) = setup();
        assistant
            .create_clone("vol-1", "clone-1", &CancellationToken::new())
            .await
            .unwrap();

        assert!(array.has_vdisk("clone-1"));
        // autodelete removed the finished mapping
        assert!(array.lcmaps().is_empty());
        assistant.extend_vdisk("clone-1", 1).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_rolls_back() {
        let (_fabric, array, assistant) = setup();
        array.add_vdisk("snap-1", "pool0", 10);
        array.fail_next_prepare();

        let result = assistant
            .run_local_copy("vol-1", "snap-1", 0, false, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::LocalCopyFailed { status, .. }) if status == "stopped");
        assert!(array.lcmaps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_timeout_rolls_back() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        array.add_vdisk("vol-1", "pool0", 10);
        let config = AssistantConfig {
            prepare_timeout_secs: 1,
            lcmap_poll_interval_ms: 100,
            rc_jitter_min_ms: 0,
            rc_jitter_max_ms: 0,
            ..AssistantConfig::default()
        };
        let assistant = ArrayAssistant::connect(&ArrayConfig::new(array.endpoint()), fabric.connector(), config);
        array.stall_prepare(true);

        let result = assistant
            .create_snapshot("vol-1", "snap-1", &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::PrepareTimeout { .. }));
        assert!(array.lcmaps().is_empty());
        assert!(!array.has_vdisk("snap-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_rolls_back() {
        let (_fabric, array, assistant) = setup();
        array.add_vdisk("snap-1", "pool0", 10);
        array.stall_prepare(true);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = assistant.run_local_copy("vol-1", "snap-1", 0, false, &cancel).await;
        assert_matches!(result, Err(Error::Cancelled { .. }));
        assert!(array.lcmaps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_of_running_copy() {
        let (_fabric, array, assistant) = setup();
        array.add_vdisk("copy-1", "pool0", 10);
        let id = assistant
            .run_local_copy("vol-1", "copy-1", 10, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(assistant.local_copy_progress(&id).await.unwrap(), Some(10));
        assistant.teardown_lcmap(&id).await.unwrap();
        assert_eq!(assistant.local_copy_progress(&id).await.unwrap(), None);
        assistant.delete_vdisk("copy-1", false).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_snapshot() {
        let (_fabric, array, assistant) = setup();
        array.add_vdisk("vol-2", "pool0", 20);
        let pairs = vec![
            ("vol-1".to_string(), "gs-1".to_string()),
            ("vol-2".to_string(), "gs-2".to_string()),
        ];

        let ids = assistant
            .create_group_snapshot("cg-1", &pairs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(array.vdisk_capacity("gs-2"), Some(20 << 30));

        let group = assistant.get_lc_consistgrp("cg-1").await.unwrap().unwrap();
        assert_eq!(group.members, ids);
        assert!(array.lcmaps().iter().all(|m| m.group.as_deref() == Some("cg-1")));

        assistant.delete_group_snapshot("cg-1").await.unwrap();
        assert!(assistant.get_lc_consistgrp("cg-1").await.unwrap().is_none());
        assert!(array.lcmaps().is_empty());
        assert!(!array.has_vdisk("gs-1"));
        assert!(array.has_vdisk("vol-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_group_snapshot_cleans_up() {
        let (_fabric, array, assistant) = setup();
        array.add_vdisk("vol-2", "pool0", 20);
        array.fail_next_prepare();
        let pairs = vec![
            ("vol-1".to_string(), "gs-1".to_string()),
            ("vol-2".to_string(), "gs-2".to_string()),
        ];

        let result = assistant
            .create_group_snapshot("cg-1", &pairs, &CancellationToken::new())
            .await;
        assert_matches!(result, Err(Error::LocalCopyFailed { .. }));
        assert!(assistant.get_lc_consistgrp("cg-1").await.unwrap().is_none());
        assert!(array.lcmaps().is_empty());
        assert!(!array.has_vdisk("gs-1"));
        assert!(!array.has_vdisk("gs-2"));
    }
}
