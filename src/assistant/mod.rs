//! Array Command Assistant
//!
//! Typed verbs over the command channel and the CLI parser. Each verb builds
//! an [`ArrayCommand`], runs it, and turns the parsed output into domain
//! values. Lookups return `Option`: the array's "object does not exist"
//! codes are translated here, once.
//!
//! Long-running array transitions (copy preparation, background copies,
//! relationship synchronization) are awaited with [`poll_until`].

pub mod locks;
pub mod polling;

mod local_copy;
mod remote_copy;

pub use locks::{LockKey, ObjectGuard, ObjectLocks};
pub use polling::{poll_until, PollOutcome};
pub use remote_copy::PartnershipInfo;

use crate::channel::CommandChannel;
use crate::cli::commands::{ArrayCommand, HostInitiator, ThinProvisioning, DELIMITER};
use crate::cli::parser::{parse, Record, RecordSet};
use crate::config::{ArrayConfig, AssistantConfig};
use crate::domain::ports::{CliResult, SessionConnectorRef, SystemInfo};
use crate::error::{Error, Result};
use rand::Rng;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// CLI codes meaning "no such object"
pub const NOT_FOUND_CODES: &[&str] = &["CMMVC5753E", "CMMVC5754E"];

const GIB: u64 = 1 << 30;

// =============================================================================
// Domain Views
// =============================================================================

/// Attributes of one vdisk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VdiskInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub pool: String,
    /// Bytes
    pub capacity: u64,
    /// Remote-copy relationship the vdisk belongs to
    pub rc_name: Option<String>,
}

impl VdiskInfo {
    /// Capacity in GiB, rounded up
    pub fn size_gb(&self) -> u64 {
        self.capacity.div_ceil(GIB)
    }
}

/// One vdisk-to-host mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostMapping {
    pub host: String,
    pub vdisk: String,
    pub scsi_id: u32,
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// A field that must be present in `record`
pub(crate) fn require<'a>(record: &'a Record, field: &str, command: &ArrayCommand) -> Result<&'a str> {
    record.get_str(field).ok_or_else(|| Error::MissingField {
        command: command.to_string(),
        field: field.to_string(),
    })
}

/// A present field parsed into `T`
pub(crate) fn require_parsed<T: FromStr>(record: &Record, field: &str, command: &ArrayCommand) -> Result<T> {
    let raw = require(record, field, command)?;
    raw.parse().map_err(|_| Error::ProtocolMismatch {
        command: command.to_string(),
        detail: format!("field '{}' has unexpected value '{}'", field, raw),
    })
}

/// Object id from "<Kind>, id [N], successfully created"
fn created_id(command: &ArrayCommand, stdout: &str) -> Result<String> {
    stdout
        .split_once('[')
        .and_then(|(_, rest)| rest.split_once(']'))
        .map(|(id, _)| id.trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::ProtocolMismatch {
            command: command.to_string(),
            detail: format!("no object id in '{}'", stdout.trim()),
        })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

// =============================================================================
// Assistant
// =============================================================================

/// Orchestrates array operations over one command channel
pub struct ArrayAssistant {
    channel: Arc<CommandChannel>,
    config: AssistantConfig,
    locks: ObjectLocks,
    system: OnceCell<SystemInfo>,
}

impl ArrayAssistant {
    pub fn new(channel: Arc<CommandChannel>, config: AssistantConfig) -> Self {
        Self {
            channel,
            config,
            locks: ObjectLocks::new(),
            system: OnceCell::new(),
        }
    }

    /// Build the channel for `array` and wrap it
    pub fn connect(array: &ArrayConfig, connector: SessionConnectorRef, config: AssistantConfig) -> Self {
        Self::new(Arc::new(CommandChannel::new(array, connector)), config)
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub fn locks(&self) -> &ObjectLocks {
        &self.locks
    }

    async fn jitter(&self) {
        let min = self.config.rc_jitter_min_ms;
        let max = self.config.rc_jitter_max_ms.max(min);
        if max == 0 {
            return;
        }
        let pause = rand::thread_rng().gen_range(min..=max);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }

    // =========================================================================
    // Command Execution
    // =========================================================================

    /// Run a command, failing on a non-zero exit status.
    ///
    /// Inquiries are retried up to `inquiry_attempts` times. Remote-copy
    /// commands are preceded by a random pause.
    pub async fn run(&self, command: &ArrayCommand) -> Result<CliResult> {
        if command.is_remote_copy() {
            self.jitter().await;
        }
        let attempts = if command.is_inquiry() {
            self.config.inquiry_attempts
        } else {
            1
        };
        self.channel.execute(&command.tokens(), true, attempts).await
    }

    /// Run an inquiry and parse its output
    pub async fn run_inquiry(&self, command: &ArrayCommand) -> Result<RecordSet> {
        let layout = command
            .layout()
            .ok_or_else(|| Error::Internal(format!("'{}' is not an inquiry", command.verb())))?;
        let result = self.run(command).await?;
        parse(&result.stdout, DELIMITER, layout).map_err(|e| e.into_error(&command.to_string()))
    }

    /// Run a single-object inquiry; `None` if the object does not exist
    pub async fn lookup(&self, command: &ArrayCommand) -> Result<Option<Record>> {
        match self.run_inquiry(command).await {
            Ok(records) => Ok(records.into_first()),
            Err(e) if e.has_cli_code(NOT_FOUND_CODES) => {
                debug!("{} found nothing", command);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run a `mk*` command and return the new object's id
    pub async fn run_create(&self, command: &ArrayCommand) -> Result<String> {
        let result = self.run(command).await?;
        created_id(command, &result.stdout)
    }

    // =========================================================================
    // System
    // =========================================================================

    pub async fn system_info(&self) -> Result<SystemInfo> {
        let command = ArrayCommand::LsSystem;
        let record = self
            .run_inquiry(&command)
            .await?
            .into_first()
            .ok_or_else(|| Error::ProtocolMismatch {
                command: command.to_string(),
                detail: "empty output".into(),
            })?;

        let console = require(&record, "console_IP", &command)?;
        Ok(SystemInfo {
            id: require(&record, "id", &command)?.to_string(),
            name: require(&record, "name", &command)?.to_string(),
            code_level: require(&record, "code_level", &command)?.to_string(),
            console_ip: console.split_once(':').map_or(console, |(ip, _)| ip).to_string(),
        })
    }

    /// System id, queried once
    pub async fn system_id(&self) -> Result<String> {
        let info = self.system.get_or_try_init(|| self.system_info()).await?;
        Ok(info.id.clone())
    }

    // =========================================================================
    // Vdisks
    // =========================================================================

    pub async fn get_vdisk(&self, name: &str) -> Result<Option<VdiskInfo>> {
        let command = ArrayCommand::LsVdisk { name: name.to_string() };
        let Some(record) = self.lookup(&command).await? else {
            return Ok(None);
        };
        Ok(Some(VdiskInfo {
            id: require(&record, "id", &command)?.to_string(),
            name: require(&record, "name", &command)?.to_string(),
            status: require(&record, "status", &command)?.to_string(),
            pool: require(&record, "mdisk_grp_name", &command)?.to_string(),
            capacity: require_parsed(&record, "capacity", &command)?,
            rc_name: non_empty(record.get_str("RC_name")),
        }))
    }

    pub async fn is_vdisk_defined(&self, name: &str) -> Result<bool> {
        Ok(self.get_vdisk(name).await?.is_some())
    }

    async fn require_vdisk(&self, name: &str) -> Result<VdiskInfo> {
        self.get_vdisk(name).await?.ok_or_else(|| not_found("vdisk", name))
    }

    pub async fn create_vdisk(&self, name: &str, size_gb: u64, pool: &str) -> Result<VdiskInfo> {
        let _guard = self.locks.lock(LockKey::Volume(name.to_string())).await;
        self.create_vdisk_locked(name, size_gb, pool).await
    }

    /// [`Self::create_vdisk`] for callers already holding the volume lock
    pub(crate) async fn create_vdisk_locked(&self, name: &str, size_gb: u64, pool: &str) -> Result<VdiskInfo> {
        let command = ArrayCommand::MkVdisk {
            name: name.to_string(),
            pool: pool.to_string(),
            size_gb,
            iogrp: self.config.iogrp,
            thin: self.config.thin_provisioning.then(ThinProvisioning::default),
        };
        let id = self.run_create(&command).await?;
        info!("Created vdisk {} (id {}, {} GiB in {})", name, id, size_gb, pool);
        self.require_vdisk(name).await
    }

    /// Delete a vdisk.
    ///
    /// A vdisk in copy mappings is only deleted with `force`, which tears
    /// the mappings down first and removes host mappings. Deleting a vdisk
    /// that does not exist succeeds.
    pub async fn delete_vdisk(&self, name: &str, force: bool) -> Result<()> {
        let _guard = self.locks.lock(LockKey::Volume(name.to_string())).await;
        self.delete_vdisk_locked(name, force).await
    }

    /// [`Self::delete_vdisk`] for callers already holding the volume lock
    pub(crate) async fn delete_vdisk_locked(&self, name: &str, force: bool) -> Result<()> {
        if !self.is_vdisk_defined(name).await? {
            warn!("Vdisk {} does not exist, nothing to delete", name);
            return Ok(());
        }

        let mappings = self.get_vdisk_lc_mappings(name).await?;
        if !mappings.is_empty() {
            if !force {
                return Err(Error::ObjectInUse {
                    name: name.to_string(),
                    users: mappings,
                });
            }
            for id in &mappings {
                self.teardown_lcmap(id).await?;
            }
        }

        if force {
            for mapping in self.get_vdisk_host_maps(name).await? {
                self.run(&ArrayCommand::RmVdiskHostMap {
                    host: mapping.host,
                    vdisk: name.to_string(),
                })
                .await?;
            }
        }

        self.run(&ArrayCommand::RmVdisk {
            name: name.to_string(),
            force,
        })
        .await?;
        info!("Deleted vdisk {}", name);
        Ok(())
    }

    /// Grow a vdisk by `add_gb`; refused while it takes part in copy mappings
    pub async fn extend_vdisk(&self, name: &str, add_gb: u64) -> Result<()> {
        let _guard = self.locks.lock(LockKey::Volume(name.to_string())).await;
        self.require_vdisk(name).await?;
        let mappings = self.get_vdisk_lc_mappings(name).await?;
        if !mappings.is_empty() {
            return Err(Error::ObjectInUse {
                name: name.to_string(),
                users: mappings,
            });
        }
        self.run(&ArrayCommand::ExpandVdiskSize {
            name: name.to_string(),
            add_gb,
        })
        .await?;
        info!("Extended vdisk {} by {} GiB", name, add_gb);
        Ok(())
    }

    // =========================================================================
    // Hosts
    // =========================================================================

    async fn host_key(&self, host: &str) -> Result<LockKey> {
        Ok(LockKey::Host {
            system_id: self.system_id().await?,
            host: host.to_string(),
        })
    }

    pub async fn get_host(&self, name: &str) -> Result<Option<Record>> {
        self.lookup(&ArrayCommand::LsHost { name: name.to_string() }).await
    }

    /// Create a host object, or return the id of the existing one
    pub async fn create_host(&self, name: &str, initiator: HostInitiator) -> Result<String> {
        let _guard = self.locks.lock(self.host_key(name).await?).await;
        let lookup = ArrayCommand::LsHost { name: name.to_string() };
        if let Some(existing) = self.lookup(&lookup).await? {
            return Ok(require(&existing, "id", &lookup)?.to_string());
        }
        let id = self
            .run_create(&ArrayCommand::MkHost {
                name: name.to_string(),
                initiator,
            })
            .await?;
        info!("Created host {} (id {})", name, id);
        Ok(id)
    }

    pub async fn delete_host(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(self.host_key(name).await?).await;
        if self.get_host(name).await?.is_none() {
            return Ok(());
        }
        self.run(&ArrayCommand::RmHost { name: name.to_string() }).await?;
        info!("Deleted host {}", name);
        Ok(())
    }

    fn host_mappings(records: &RecordSet, command: &ArrayCommand, host_col: &str, vdisk_col: &str) -> Result<Vec<HostMapping>> {
        let keys = [host_col, vdisk_col, "SCSI_id"];
        records
            .project(&keys)
            .map(|row| match row.as_slice() {
                [Some(host), Some(vdisk), Some(scsi)] => Ok(HostMapping {
                    host: host.to_string(),
                    vdisk: vdisk.to_string(),
                    scsi_id: scsi.parse().map_err(|_| Error::ProtocolMismatch {
                        command: command.to_string(),
                        detail: format!("SCSI id '{}' is not a number", scsi),
                    })?,
                }),
                _ => Err(Error::MissingField {
                    command: command.to_string(),
                    field: keys.join(","),
                }),
            })
            .collect()
    }

    pub async fn get_vdisk_host_maps(&self, vdisk: &str) -> Result<Vec<HostMapping>> {
        let command = ArrayCommand::LsVdiskHostMap { vdisk: vdisk.to_string() };
        let records = match self.run_inquiry(&command).await {
            Ok(records) => records,
            Err(e) if e.has_cli_code(NOT_FOUND_CODES) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Self::host_mappings(&records, &command, "host_name", "name")
    }

    pub async fn get_host_mappings(&self, host: &str) -> Result<Vec<HostMapping>> {
        let command = ArrayCommand::LsHostVdiskMap { host: host.to_string() };
        let records = match self.run_inquiry(&command).await {
            Ok(records) => records,
            Err(e) if e.has_cli_code(NOT_FOUND_CODES) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Self::host_mappings(&records, &command, "name", "vdisk_name")
    }

    /// Map `volume` to `host` on the lowest free SCSI id.
    ///
    /// Mapping an already mapped pair returns its existing SCSI id.
    pub async fn map_vol_to_host(&self, volume: &str, host: &str) -> Result<u32> {
        let _host_guard = self.locks.lock(self.host_key(host).await?).await;
        let _volume_guard = self.locks.lock(LockKey::Volume(volume.to_string())).await;

        self.require_vdisk(volume).await?;
        if self.get_host(host).await?.is_none() {
            return Err(not_found("host", host));
        }

        let existing = self.get_host_mappings(host).await?;
        if let Some(mapping) = existing.iter().find(|m| m.vdisk == volume) {
            debug!("{} already mapped to {} as SCSI id {}", volume, host, mapping.scsi_id);
            return Ok(mapping.scsi_id);
        }
        let scsi_id = (0..)
            .find(|id| !existing.iter().any(|m| m.scsi_id == *id))
            .unwrap_or_default();

        self.run(&ArrayCommand::MkVdiskHostMap {
            host: host.to_string(),
            vdisk: volume.to_string(),
            scsi_id,
        })
        .await?;
        info!("Mapped {} to {} as SCSI id {}", volume, host, scsi_id);
        Ok(scsi_id)
    }

    /// Remove the mapping of `volume` to `host`; absent mappings are ignored
    pub async fn unmap_vol_from_host(&self, volume: &str, host: &str) -> Result<()> {
        let _host_guard = self.locks.lock(self.host_key(host).await?).await;
        let _volume_guard = self.locks.lock(LockKey::Volume(volume.to_string())).await;

        let mapped = self
            .get_host_mappings(host)
            .await?
            .iter()
            .any(|m| m.vdisk == volume);
        if !mapped {
            warn!("{} is not mapped to {}, nothing to unmap", volume, host);
            return Ok(());
        }
        self.run(&ArrayCommand::RmVdiskHostMap {
            host: host.to_string(),
            vdisk: volume.to_string(),
        })
        .await?;
        info!("Unmapped {} from {}", volume, host);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::simulator::{SimulatedArray, SimulatedFabric, SimulatorConfig};
    use assert_matches::assert_matches;

    pub(crate) fn fast_config() -> AssistantConfig {
        AssistantConfig {
            lcmap_poll_interval_ms: 10,
            sync_poll_interval_ms: 10,
            rc_jitter_min_ms: 0,
            rc_jitter_max_ms: 0,
            ..AssistantConfig::default()
        }
    }

    pub(crate) fn assistant_for(fabric: &SimulatedFabric, array: &SimulatedArray) -> ArrayAssistant {
        ArrayAssistant::connect(&ArrayConfig::new(array.endpoint()), fabric.connector(), fast_config())
    }

    fn setup() -> (SimulatedFabric, SimulatedArray, ArrayAssistant) {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let assistant = assistant_for(&fabric, &array);
        (fabric, array, assistant)
    }

    #[test]
    fn test_created_id() {
        let cmd = ArrayCommand::LsSystem;
        assert_eq!(
            created_id(&cmd, "Virtual Disk, id [12], successfully created\n").unwrap(),
            "12"
        );
        assert_matches!(created_id(&cmd, ""), Err(Error::ProtocolMismatch { .. }));
        assert_matches!(created_id(&cmd, "id []"), Err(Error::ProtocolMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inverted_jitter_range_pauses_minimum() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let config = AssistantConfig {
            rc_jitter_min_ms: 50,
            rc_jitter_max_ms: 10,
            ..fast_config()
        };
        let assistant = ArrayAssistant::connect(&ArrayConfig::new(array.endpoint()), fabric.connector(), config);

        let start = tokio::time::Instant::now();
        assistant.jitter().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_system_info() {
        let (_fabric, array, assistant) = setup();
        let info = assistant.system_info().await.unwrap();
        assert_eq!(info.id, array.system_id());
        assert_eq!(info.name, "array-a");
        assert_eq!(info.console_ip, "10.0.0.1");
        assert_eq!(assistant.system_id().await.unwrap(), array.system_id());
    }

    #[tokio::test]
    async fn test_missing_vdisk_is_none() {
        let (_fabric, _array, assistant) = setup();
        assert!(assistant.get_vdisk("nope").await.unwrap().is_none());
        assert!(!assistant.is_vdisk_defined("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_vdisk_lifecycle() {
        let (_fabric, array, assistant) = setup();

        let vdisk = assistant.create_vdisk("vol-1", 10, "pool0").await.unwrap();
        assert_eq!(vdisk.size_gb(), 10);
        assert_eq!(vdisk.pool, "pool0");
        assert_eq!(vdisk.rc_name, None);

        assistant.extend_vdisk("vol-1", 5).await.unwrap();
        assert_eq!(array.vdisk_capacity("vol-1"), Some(15 * GIB));

        assert_matches!(
            assistant.create_vdisk("vol-1", 10, "pool0").await,
            Err(Error::ArrayCommand { .. })
        );
        assert_matches!(
            assistant.create_vdisk("vol-2", 10, "nopool").await,
            Err(Error::ArrayCommand { .. })
        );

        assistant.delete_vdisk("vol-1", false).await.unwrap();
        assert!(!array.has_vdisk("vol-1"));
        assistant.delete_vdisk("vol-1", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_host_mapping() {
        let (_fabric, array, assistant) = setup();
        array.add_vdisk("vol-1", "pool0", 1);
        array.add_vdisk("vol-2", "pool0", 1);

        let wwpns = vec!["5005076801401B3F".to_string(), "5005076801401B40".to_string()];
        let id = assistant.create_host("host-1", HostInitiator::Fc(wwpns)).await.unwrap();
        assert_eq!(
            assistant.create_host("host-1", HostInitiator::Iscsi("iqn.x".into())).await.unwrap(),
            id
        );
        let host = assistant.get_host("host-1").await.unwrap().unwrap();
        assert_eq!(host.get("WWPN").unwrap().values().len(), 2);

        assert_eq!(assistant.map_vol_to_host("vol-1", "host-1").await.unwrap(), 0);
        assert_eq!(assistant.map_vol_to_host("vol-2", "host-1").await.unwrap(), 1);
        assert_eq!(assistant.map_vol_to_host("vol-1", "host-1").await.unwrap(), 0);

        let maps = assistant.get_vdisk_host_maps("vol-2").await.unwrap();
        assert_eq!(
            maps,
            vec![HostMapping {
                host: "host-1".into(),
                vdisk: "vol-2".into(),
                scsi_id: 1
            }]
        );

        assert_matches!(
            assistant.map_vol_to_host("vol-1", "ghost").await,
            Err(Error::NotFound { .. })
        );
        assert_matches!(assistant.delete_host("host-1").await, Err(Error::ArrayCommand { .. }));

        assistant.unmap_vol_from_host("vol-1", "host-1").await.unwrap();
        assistant.unmap_vol_from_host("vol-1", "host-1").await.unwrap();
        assistant.delete_vdisk("vol-2", true).await.unwrap();
        assert!(array.host_maps("vol-2").is_empty());
        assistant.delete_host("host-1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_and_map_do_not_interleave() {
        let fabric = SimulatedFabric::new(SimulatorConfig {
            latency_ms: 5,
            ..SimulatorConfig::default()
        });
        let array = fabric.add_array("array-a", "10.0.0.1");
        array.add_vdisk("vol-1", "pool0", 1);
        let assistant = Arc::new(assistant_for(&fabric, &array));
        assistant.create_host("host-1", HostInitiator::Iscsi("iqn.1994-05.com.example:h1".into())).await.unwrap();

        let deleter = {
            let assistant = Arc::clone(&assistant);
            tokio::spawn(async move { assistant.delete_vdisk("vol-1", true).await })
        };
        let mapper = {
            let assistant = Arc::clone(&assistant);
            tokio::spawn(async move { assistant.map_vol_to_host("vol-1", "host-1").await })
        };
        deleter.await.unwrap().unwrap();
        let mapped = mapper.await.unwrap();

        let log = array.command_log();
        let position = |verbs: &[&str]| -> Vec<usize> {
            log.iter()
                .enumerate()
                .filter(|(_, line)| verbs.iter().any(|v| line.split_whitespace().nth(1) == Some(*v)))
                .map(|(i, _)| i)
                .collect()
        };
        let delete_steps = position(&["lsvdisklcmappings", "lsvdiskhostmap", "rmvdiskhostmap", "rmvdisk"]);
        let map_steps = position(&["lshostvdiskmap", "mkvdiskhostmap"]);
        let delete_span = (delete_steps[0], delete_steps[delete_steps.len() - 1]);
        assert!(map_steps.iter().all(|i| *i < delete_span.0 || *i > delete_span.1));

        // Either order is valid, but the outcome must be consistent
        match mapped {
            Ok(_) => assert!(delete_span.0 > map_steps[map_steps.len() - 1]),
            Err(e) => assert_matches!(e, Error::NotFound { .. }),
        }
        assert!(!array.has_vdisk("vol-1"));
        assert!(array.host_maps("vol-1").is_empty());
    }
}
