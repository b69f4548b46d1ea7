//! Simulated array state and CLI interpreter
//!
//! Each array keeps its vdisks, hosts, host mappings, copy mappings,
//! consistency groups and partnerships. Remote-copy relationships span two
//! arrays and live at fabric level. Transient states advance one step every
//! time the object is queried.

use crate::domain::ports::{CliResult, ReplicationType};
use crate::lifecycle::copy_mapping::{self, CopyMapping, LcConsistencyGroup, LcMapStatus, LcMapTrigger};
use crate::lifecycle::remote_copy::{RcPrimary, RcRelState, RcTrigger, RemoteCopyRelationship};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::trace;

const GIB: u64 = 1 << 30;
const CODE_LEVEL: &str = "3.1.1.0 (build 21.4.1710011100)";

// CLI error codes
pub(crate) const OBJECT_NOT_FOUND: &str = "CMMVC5753E";
pub(crate) const NAME_NOT_FOUND: &str = "CMMVC5754E";
const ALREADY_EXISTS: &str = "CMMVC6035E";
const UNKNOWN_COMMAND: &str = "CMMVC5709E";
const MISSING_PARAMETER: &str = "CMMVC5707E";
const INVALID_PARAMETER: &str = "CMMVC5711E";
const VDISK_IN_USE: &str = "CMMVC5840E";
const HOST_IN_USE: &str = "CMMVC5871E";
const MAPPING_EXISTS: &str = "CMMVC5878E";
const SCSI_ID_IN_USE: &str = "CMMVC5879E";
const NOT_MAPPED: &str = "CMMVC5842E";
const SIZE_MISMATCH: &str = "CMMVC5924E";
const LC_STATE: &str = "CMMVC5907E";
const RC_STATE: &str = "CMMVC5935E";
const NO_PARTNERSHIP: &str = "CMMVC5963E";
const CLUSTER_UNREACHABLE: &str = "CMMVC6458E";
const SWITCH_REJECTED: &str = "CMMVC5974E";

/// Switch flags that take no value
const SWITCHES: &[&str] = &[
    "-bytes",
    "-force",
    "-autoexpand",
    "-autodelete",
    "-global",
    "-access",
    "-start",
];

type Reply = std::result::Result<String, CliResult>;

fn cli_error(code: &str, message: impl std::fmt::Display) -> CliResult {
    CliResult::failure(1, format!("{} {}", code, message))
}

fn created(kind: &str, id: impl std::fmt::Display) -> String {
    format!("{}, id [{}], successfully created\n", kind, id)
}

// =============================================================================
// Argument Parsing
// =============================================================================

struct Args<'a> {
    flags: HashMap<&'a str, Option<&'a str>>,
    positional: Vec<&'a str>,
}

impl<'a> Args<'a> {
    fn parse(tokens: &[&'a str]) -> Self {
        let mut flags = HashMap::new();
        let mut positional = Vec::new();
        let mut iter = tokens.iter().copied();
        while let Some(token) = iter.next() {
            if token.starts_with('-') {
                let value = if SWITCHES.contains(&token) { None } else { iter.next() };
                flags.insert(token, value);
            } else {
                positional.push(token);
            }
        }
        Self { flags, positional }
    }

    fn has(&self, flag: &str) -> bool {
        self.flags.contains_key(flag)
    }

    fn value(&self, flag: &str) -> Option<&'a str> {
        self.flags.get(flag).copied().flatten()
    }

    fn required(&self, flag: &str) -> std::result::Result<&'a str, CliResult> {
        self.value(flag)
            .ok_or_else(|| cli_error(MISSING_PARAMETER, format!("Required parameter {} is missing.", flag)))
    }

    fn number<T: std::str::FromStr>(&self, flag: &str) -> std::result::Result<T, CliResult> {
        let raw = self.required(flag)?;
        raw.parse()
            .map_err(|_| cli_error(INVALID_PARAMETER, format!("The value {} for {} is not valid.", raw, flag)))
    }

    fn object(&self) -> std::result::Result<&'a str, CliResult> {
        self.positional
            .last()
            .copied()
            .ok_or_else(|| cli_error(MISSING_PARAMETER, "The object name or id is missing."))
    }

    fn delimiter(&self) -> &'a str {
        self.value("-delim").unwrap_or(" ")
    }
}

// =============================================================================
// Output Formatting
// =============================================================================

fn record(delim: &str, fields: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (key, value) in fields {
        out.push_str(key);
        out.push_str(delim);
        out.push_str(value);
        out.push('\n');
    }
    out
}

fn table(delim: &str, header: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut out = header.join(delim);
    out.push('\n');
    for row in rows {
        out.push_str(&row.join(delim));
        out.push('\n');
    }
    out
}

// =============================================================================
// Array Objects
// =============================================================================

#[derive(Debug, Clone)]
pub(crate) struct Vdisk {
    pub id: u32,
    pub name: String,
    pub pool: String,
    pub capacity: u64,
}

#[derive(Debug, Clone)]
enum Initiator {
    Iscsi(String),
    Fc(Vec<String>),
}

#[derive(Debug, Clone)]
struct Host {
    id: u32,
    name: String,
    initiator: Initiator,
}

#[derive(Debug, Clone)]
pub(crate) struct HostMap {
    pub host: String,
    pub vdisk: String,
    pub scsi_id: u32,
}

#[derive(Debug, Clone)]
struct Partnership {
    remote_name: String,
    cluster_ip: String,
    background_copy_rate: u8,
    started: bool,
}

/// Injected faults for one array
#[derive(Debug, Clone, Default)]
pub(crate) struct Faults {
    /// Next prepared mapping fails its flush
    pub fail_next_prepare: bool,
    /// Mappings never leave `preparing`
    pub stall_prepare: bool,
    /// Relationships never finish their initial copy
    pub stall_sync: bool,
    /// `switchrcrelationship` is rejected
    pub reject_switch: bool,
    /// `startrcrelationship` is rejected
    pub reject_rc_start: bool,
}

/// One simulated array
#[derive(Debug)]
pub(crate) struct ArrayState {
    pub id: String,
    pub name: String,
    pub console_ip: String,
    pools: BTreeSet<String>,
    pub vdisks: BTreeMap<String, Vdisk>,
    hosts: BTreeMap<String, Host>,
    pub host_maps: Vec<HostMap>,
    pub lcmaps: BTreeMap<u32, CopyMapping>,
    groups: BTreeMap<String, LcConsistencyGroup>,
    /// Keyed by remote system id
    partnerships: BTreeMap<String, Partnership>,
    flush_failures: HashSet<u32>,
    next_id: u32,
    next_lcmap_id: u32,
    pub faults: Faults,
    pub command_log: Vec<String>,
}

impl ArrayState {
    pub fn new(id: String, name: String, console_ip: String) -> Self {
        Self {
            id,
            name,
            console_ip,
            pools: BTreeSet::from(["pool0".to_string()]),
            vdisks: BTreeMap::new(),
            hosts: BTreeMap::new(),
            host_maps: Vec::new(),
            lcmaps: BTreeMap::new(),
            groups: BTreeMap::new(),
            partnerships: BTreeMap::new(),
            flush_failures: HashSet::new(),
            next_id: 0,
            next_lcmap_id: 0,
            faults: Faults::default(),
            command_log: Vec::new(),
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_pool(&mut self, pool: &str) {
        self.pools.insert(pool.to_string());
    }

    pub fn add_vdisk(&mut self, name: &str, pool: &str, size_gb: u64) -> u32 {
        let id = self.allocate_id();
        self.pools.insert(pool.to_string());
        self.vdisks.insert(
            name.to_string(),
            Vdisk {
                id,
                name: name.to_string(),
                pool: pool.to_string(),
                capacity: size_gb * GIB,
            },
        );
        id
    }

    pub fn partnership_count(&self) -> usize {
        self.partnerships.len()
    }

    fn vdisk(&self, name: &str) -> std::result::Result<&Vdisk, CliResult> {
        self.vdisks.get(name).ok_or_else(|| {
            cli_error(
                NAME_NOT_FOUND,
                format!("The specified object {} does not exist.", name),
            )
        })
    }

    fn lcmap_id(&self, raw: &str) -> std::result::Result<u32, CliResult> {
        let by_id = raw.parse::<u32>().ok().filter(|id| self.lcmaps.contains_key(id));
        by_id
            .or_else(|| {
                self.lcmaps
                    .iter()
                    .find(|(_, m)| m.name == raw)
                    .map(|(id, _)| *id)
            })
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The object {} does not exist.", raw)))
    }

    fn mappings_of(&self, vdisk: &str) -> Vec<u32> {
        self.lcmaps
            .iter()
            .filter(|(_, m)| m.source == vdisk || m.target == vdisk)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Advance one copy mapping by one step of array time
    fn tick_lcmap(&mut self, id: u32) {
        let stall_prepare = self.faults.stall_prepare;
        let flush_fails = self.flush_failures.contains(&id);
        let Some(map) = self.lcmaps.get_mut(&id) else {
            return;
        };

        let trigger = match map.status {
            LcMapStatus::Preparing if flush_fails => Some(LcMapTrigger::FlushFailed),
            LcMapStatus::Preparing if stall_prepare => None,
            LcMapStatus::Preparing | LcMapStatus::Copying | LcMapStatus::Stopping => Some(LcMapTrigger::Wait),
            _ => None,
        };
        let Some(trigger) = trigger else {
            return;
        };

        let before = map.status;
        if map.apply(trigger).is_ok() {
            trace!("lcmap {} {} -> {}", id, before, map.status);
        }
        if trigger == LcMapTrigger::FlushFailed {
            self.flush_failures.remove(&id);
        }
        let completed = before == LcMapStatus::Copying && map.status == LcMapStatus::IdleOrCopied;
        if completed && map.autodelete {
            self.remove_lcmap(id);
        }
    }

    fn tick_group(&mut self, name: &str) {
        let Some(members) = self
            .groups
            .get(name)
            .map(|g| g.members.iter().filter_map(|m| m.parse::<u32>().ok()).collect::<Vec<_>>())
        else {
            return;
        };
        for id in &members {
            self.tick_lcmap(*id);
        }

        let statuses: Vec<LcMapStatus> = members
            .iter()
            .filter_map(|id| self.lcmaps.get(id).map(|m| m.status))
            .collect();
        let all = |status: LcMapStatus| statuses.iter().all(|s| *s == status);

        let Some(group) = self.groups.get_mut(name) else {
            return;
        };
        let outcome = match group.status {
            LcMapStatus::Preparing if statuses.contains(&LcMapStatus::Stopped) => {
                group.apply(LcMapTrigger::FlushFailed, false)
            }
            LcMapStatus::Preparing if all(LcMapStatus::Prepared) => group.apply(LcMapTrigger::Wait, false),
            LcMapStatus::Copying => group.apply(LcMapTrigger::Wait, all(LcMapStatus::IdleOrCopied)),
            LcMapStatus::Stopping if all(LcMapStatus::Stopped) => group.apply(LcMapTrigger::Wait, false),
            _ => return,
        };
        if let Err(e) = outcome {
            trace!("lcconsistgrp {} did not advance: {}", name, e);
        }
    }

    fn remove_lcmap(&mut self, id: u32) {
        if let Some(map) = self.lcmaps.remove(&id) {
            if let Some(group) = map.group.as_ref().and_then(|g| self.groups.get_mut(g)) {
                group.members.retain(|m| m != &map.id);
            }
        }
    }

    fn partnership_state(&self, remote: Option<&ArrayState>, remote_id: &str) -> &'static str {
        let mine = self.partnerships.get(remote_id);
        let theirs = remote.and_then(|r| r.partnerships.get(&self.id));
        match (mine, theirs) {
            (Some(m), Some(t)) if m.started && t.started => "fully_configured",
            (Some(_), Some(_)) => "fully_configured_stopped",
            (Some(_), None) => "partially_configured_local",
            (None, _) => "not_present",
        }
    }
}

// =============================================================================
// Fabric State
// =============================================================================

/// Transport state of one management address
#[derive(Debug)]
pub(crate) struct AddressState {
    pub system_id: String,
    pub reachable: bool,
    pub fail_next: u32,
    pub commands_seen: u64,
}

/// Everything the simulator knows, behind one lock
#[derive(Debug, Default)]
pub(crate) struct FabricState {
    pub arrays: BTreeMap<String, ArrayState>,
    pub addresses: HashMap<String, AddressState>,
    pub relationships: BTreeMap<u32, RemoteCopyRelationship>,
    next_rc_id: u32,
}

impl FabricState {
    fn array(&self, system_id: &str) -> std::result::Result<&ArrayState, CliResult> {
        self.arrays
            .get(system_id)
            .ok_or_else(|| cli_error(CLUSTER_UNREACHABLE, format!("Cluster {} is not available.", system_id)))
    }

    fn array_mut(&mut self, system_id: &str) -> std::result::Result<&mut ArrayState, CliResult> {
        self.arrays
            .get_mut(system_id)
            .ok_or_else(|| cli_error(CLUSTER_UNREACHABLE, format!("Cluster {} is not available.", system_id)))
    }

    fn find_system(&self, name_or_id: &str) -> Option<&ArrayState> {
        self.arrays
            .values()
            .find(|a| a.id == name_or_id || a.name == name_or_id)
    }

    fn relationship_of(&self, system_id: &str, vdisk: &str) -> Option<&RemoteCopyRelationship> {
        self.relationships.values().find(|r| {
            (r.master_system == system_id && r.master_vdisk == vdisk)
                || (r.aux_system == system_id && r.aux_vdisk == vdisk)
        })
    }

    fn relationship_id(&self, system_id: &str, name: &str) -> std::result::Result<u32, CliResult> {
        self.relationships
            .iter()
            .find(|(id, r)| {
                (r.name == name || id.to_string() == name)
                    && (r.master_system == system_id || r.aux_system == system_id)
            })
            .map(|(id, _)| *id)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The relationship {} does not exist.", name)))
    }

    /// Run one command line on behalf of `system_id`
    pub fn execute(&mut self, system_id: &str, line: &str) -> CliResult {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            return cli_error(UNKNOWN_COMMAND, format!("The command '{}' is not supported.", line));
        }
        let args = Args::parse(&tokens[2..]);
        let d = args.delimiter();

        let reply = match (tokens[0], tokens[1]) {
            ("mcsinq", "lssystem") => self.lssystem(system_id, d),
            ("mcsinq", "lsvdisk") => self.lsvdisk(system_id, &args, d),
            ("mcsinq", "lsvdisklcmappings") => self.lsvdisklcmappings(system_id, &args, d),
            ("mcsinq", "lsvdiskhostmap") => self.lsvdiskhostmap(system_id, &args, d),
            ("mcsinq", "lshost") => self.lshost(system_id, &args, d),
            ("mcsinq", "lshostvdiskmap") => self.lshostvdiskmap(system_id, &args, d),
            ("mcsinq", "lslcmap") => self.lslcmap(system_id, &args, d),
            ("mcsinq", "lslcconsistgrp") => self.lslcconsistgrp(system_id, &args, d),
            ("mcsinq", "lsrcrelationship") => self.lsrcrelationship(system_id, &args, d),
            ("mcsinq", "lspartnership") => self.lspartnership(system_id, d),
            ("mcsop", "mkvdisk") => self.mkvdisk(system_id, &args),
            ("mcsop", "rmvdisk") => self.rmvdisk(system_id, &args),
            ("mcsop", "expandvdisksize") => self.expandvdisksize(system_id, &args),
            ("mcsop", "mkhost") => self.mkhost(system_id, &args),
            ("mcsop", "rmhost") => self.rmhost(system_id, &args),
            ("mcsop", "mkvdiskhostmap") => self.mkvdiskhostmap(system_id, &args),
            ("mcsop", "rmvdiskhostmap") => self.rmvdiskhostmap(system_id, &args),
            ("mcsop", "mklcmap") => self.mklcmap(system_id, &args),
            ("mcsop", "prestartlcmap") => self.lcmap_trigger(system_id, &args, LcMapTrigger::Prepare),
            ("mcsop", "startlcmap") => self.lcmap_trigger(system_id, &args, LcMapTrigger::Start),
            ("mcsop", "stoplcmap") => self.lcmap_trigger(system_id, &args, LcMapTrigger::Stop),
            ("mcsop", "rmlcmap") => self.rmlcmap(system_id, &args),
            ("mcsop", "mklcconsistgrp") => self.mklcconsistgrp(system_id, &args),
            ("mcsop", "prestartlcconsistgrp") => self.group_trigger(system_id, &args, LcMapTrigger::Prepare),
            ("mcsop", "startlcconsistgrp") => self.group_trigger(system_id, &args, LcMapTrigger::Start),
            ("mcsop", "stoplcconsistgrp") => self.group_trigger(system_id, &args, LcMapTrigger::Stop),
            ("mcsop", "rmlcconsistgrp") => self.rmlcconsistgrp(system_id, &args),
            ("mcsop", "mkrcrelationship") => self.mkrcrelationship(system_id, &args),
            ("mcsop", "startrcrelationship") => self.startrcrelationship(system_id, &args),
            ("mcsop", "stoprcrelationship") => {
                let trigger = if args.has("-access") { RcTrigger::StopAccess } else { RcTrigger::Stop };
                self.rc_trigger(system_id, &args, trigger)
            }
            ("mcsop", "switchrcrelationship") => self.switchrcrelationship(system_id, &args),
            ("mcsop", "rmrcrelationship") => {
                let trigger = if args.has("-force") { RcTrigger::DeleteForce } else { RcTrigger::Delete };
                self.rc_trigger(system_id, &args, trigger)
            }
            ("mcsop", "mkippartnership") => self.mkippartnership(system_id, &args),
            ("mcsop", "chpartnership") => self.chpartnership(system_id, &args),
            _ => Err(cli_error(UNKNOWN_COMMAND, format!("The command '{}' is not supported.", line))),
        };

        match reply {
            Ok(stdout) => CliResult::success(stdout),
            Err(failure) => failure,
        }
    }

    // =========================================================================
    // Inquiries
    // =========================================================================

    fn lssystem(&self, system_id: &str, d: &str) -> Reply {
        let array = self.array(system_id)?;
        Ok(record(
            d,
            &[
                ("id", array.id.clone()),
                ("name", array.name.clone()),
                ("location", "local".into()),
                ("code_level", CODE_LEVEL.into()),
                ("console_IP", format!("{}:443", array.console_ip)),
            ],
        ))
    }

    fn lsvdisk(&self, system_id: &str, args: &Args, d: &str) -> Reply {
        let array = self.array(system_id)?;
        let vdisk = array.vdisk(args.object()?)?;
        let rc = self.relationship_of(system_id, &vdisk.name);
        Ok(record(
            d,
            &[
                ("id", vdisk.id.to_string()),
                ("name", vdisk.name.clone()),
                ("IO_group_id", "0".into()),
                ("status", "online".into()),
                ("mdisk_grp_name", vdisk.pool.clone()),
                ("capacity", vdisk.capacity.to_string()),
                ("type", "striped".into()),
                ("LC_map_count", array.mappings_of(&vdisk.name).len().to_string()),
                ("RC_id", rc.map(|r| r.id.clone()).unwrap_or_default()),
                ("RC_name", rc.map(|r| r.name.clone()).unwrap_or_default()),
                ("vdisk_UID", format!("60050760{:024X}", vdisk.id)),
            ],
        ))
    }

    fn lsvdisklcmappings(&self, system_id: &str, args: &Args, d: &str) -> Reply {
        let array = self.array(system_id)?;
        let vdisk = array.vdisk(args.object()?)?;
        let rows = array
            .mappings_of(&vdisk.name)
            .into_iter()
            .filter_map(|id| array.lcmaps.get(&id))
            .map(|m| vec![m.id.clone(), m.name.clone()])
            .collect();
        Ok(table(d, &["id", "name"], rows))
    }

    fn lsvdiskhostmap(&self, system_id: &str, args: &Args, d: &str) -> Reply {
        let array = self.array(system_id)?;
        let vdisk = array.vdisk(args.object()?)?;
        let rows = array
            .host_maps
            .iter()
            .filter(|m| m.vdisk == vdisk.name)
            .map(|m| {
                let host_id = array.hosts.get(&m.host).map(|h| h.id).unwrap_or_default();
                vec![
                    vdisk.id.to_string(),
                    vdisk.name.clone(),
                    m.scsi_id.to_string(),
                    host_id.to_string(),
                    m.host.clone(),
                ]
            })
            .collect();
        Ok(table(d, &["id", "name", "SCSI_id", "host_id", "host_name"], rows))
    }

    fn lshost(&self, system_id: &str, args: &Args, d: &str) -> Reply {
        let array = self.array(system_id)?;
        let name = args.object()?;
        let host = array
            .hosts
            .get(name)
            .ok_or_else(|| cli_error(NAME_NOT_FOUND, format!("The host {} does not exist.", name)))?;

        let mut fields = vec![("id", host.id.to_string()), ("name", host.name.clone())];
        match &host.initiator {
            Initiator::Iscsi(iqn) => {
                fields.push(("port_count", "1".into()));
                fields.push(("iscsi_name", iqn.clone()));
            }
            Initiator::Fc(wwpns) => {
                fields.push(("port_count", wwpns.len().to_string()));
                for wwpn in wwpns {
                    fields.push(("WWPN", wwpn.clone()));
                }
            }
        }
        Ok(record(d, &fields))
    }

    fn lshostvdiskmap(&self, system_id: &str, args: &Args, d: &str) -> Reply {
        let array = self.array(system_id)?;
        let name = args.object()?;
        let host = array
            .hosts
            .get(name)
            .ok_or_else(|| cli_error(NAME_NOT_FOUND, format!("The host {} does not exist.", name)))?;
        let rows = array
            .host_maps
            .iter()
            .filter(|m| m.host == host.name)
            .map(|m| {
                let vdisk_id = array.vdisks.get(&m.vdisk).map(|v| v.id).unwrap_or_default();
                vec![
                    host.id.to_string(),
                    host.name.clone(),
                    m.scsi_id.to_string(),
                    vdisk_id.to_string(),
                    m.vdisk.clone(),
                ]
            })
            .collect();
        Ok(table(d, &["id", "name", "SCSI_id", "vdisk_id", "vdisk_name"], rows))
    }

    fn lslcmap(&mut self, system_id: &str, args: &Args, d: &str) -> Reply {
        let array = self.array_mut(system_id)?;
        let id = array.lcmap_id(args.object()?)?;
        array.tick_lcmap(id);
        let map = array
            .lcmaps
            .get(&id)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The object {} does not exist.", id)))?;
        Ok(record(
            d,
            &[
                ("id", map.id.clone()),
                ("name", map.name.clone()),
                ("source_vdisk_name", map.source.clone()),
                ("target_vdisk_name", map.target.clone()),
                ("group_name", map.group.clone().unwrap_or_default()),
                ("status", map.status.to_string()),
                ("progress", map.progress.to_string()),
                ("copy_rate", map.copy_rate.to_string()),
                ("autodelete", (if map.autodelete { "on" } else { "off" }).into()),
            ],
        ))
    }

    fn lslcconsistgrp(&mut self, system_id: &str, args: &Args, d: &str) -> Reply {
        let array = self.array_mut(system_id)?;
        let name = args.object()?;
        array.tick_group(name);
        let group = array
            .groups
            .get(name)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The group {} does not exist.", name)))?;

        let mut fields = vec![
            ("id", group.id.clone()),
            ("name", group.name.clone()),
            ("status", group.status.to_string()),
        ];
        for member in &group.members {
            let map_name = member
                .parse::<u32>()
                .ok()
                .and_then(|id| array.lcmaps.get(&id))
                .map(|m| m.name.clone())
                .unwrap_or_default();
            fields.push(("LC_mapping_id", member.clone()));
            fields.push(("LC_mapping_name", map_name));
        }
        Ok(record(d, &fields))
    }

    fn lsrcrelationship(&mut self, system_id: &str, args: &Args, d: &str) -> Reply {
        let id = self.relationship_id(system_id, args.object()?)?;
        let stall = self.array(system_id)?.faults.stall_sync;
        if let Some(rel) = self.relationships.get_mut(&id) {
            if rel.state == RcRelState::InconsistentCopying && !stall {
                let _ = rel.apply(RcTrigger::Wait);
            }
        }

        let rel = self
            .relationships
            .get(&id)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The relationship {} does not exist.", id)))?;
        let system_name = |id: &str| self.arrays.get(id).map(|a| a.name.clone()).unwrap_or_default();
        Ok(record(
            d,
            &[
                ("id", rel.id.clone()),
                ("name", rel.name.clone()),
                ("master_cluster_id", rel.master_system.clone()),
                ("master_cluster_name", system_name(&rel.master_system)),
                ("master_vdisk_name", rel.master_vdisk.clone()),
                ("aux_cluster_id", rel.aux_system.clone()),
                ("aux_cluster_name", system_name(&rel.aux_system)),
                ("aux_vdisk_name", rel.aux_vdisk.clone()),
                ("primary", rel.primary.map(|p| p.to_string()).unwrap_or_default()),
                ("consistency_group_name", String::new()),
                ("state", rel.state.to_string()),
                ("progress", rel.progress.to_string()),
                (
                    "copy_type",
                    match rel.copy_type {
                        ReplicationType::Sync => "metro".into(),
                        ReplicationType::Async => "global".into(),
                    },
                ),
            ],
        ))
    }

    fn lspartnership(&self, system_id: &str, d: &str) -> Reply {
        let array = self.array(system_id)?;
        let mut rows = vec![vec![
            array.id.clone(),
            array.name.clone(),
            "local".into(),
            String::new(),
            String::new(),
            String::new(),
            String::new(),
        ]];
        for (remote_id, p) in &array.partnerships {
            let state = array.partnership_state(self.arrays.get(remote_id), remote_id);
            rows.push(vec![
                remote_id.clone(),
                p.remote_name.clone(),
                "remote".into(),
                state.into(),
                "ipv4".into(),
                p.cluster_ip.clone(),
                p.background_copy_rate.to_string(),
            ]);
        }
        Ok(table(
            d,
            &[
                "id",
                "name",
                "location",
                "partnership",
                "type",
                "cluster_ip",
                "background_copy_rate",
            ],
            rows,
        ))
    }

    // =========================================================================
    // Vdisks and Hosts
    // =========================================================================

    fn mkvdisk(&mut self, system_id: &str, args: &Args) -> Reply {
        let name = args.required("-name")?;
        let pool = args.required("-mdiskgrp")?;
        let size: u64 = args.number("-size")?;
        let array = self.array_mut(system_id)?;

        if !array.pools.contains(pool) {
            return Err(cli_error(NAME_NOT_FOUND, format!("The pool {} does not exist.", pool)));
        }
        if array.vdisks.contains_key(name) {
            return Err(cli_error(ALREADY_EXISTS, format!("The name {} already exists.", name)));
        }
        let id = array.add_vdisk(name, pool, size);
        Ok(created("Virtual Disk", id))
    }

    fn rmvdisk(&mut self, system_id: &str, args: &Args) -> Reply {
        let name = args.object()?;
        let in_relationship = self.relationship_of(system_id, name).is_some();
        let array = self.array_mut(system_id)?;
        if !array.vdisks.contains_key(name) {
            return Err(cli_error(OBJECT_NOT_FOUND, format!("The object {} does not exist.", name)));
        }

        let mappings = array.mappings_of(name);
        let mapped = array.host_maps.iter().any(|m| m.vdisk == name);
        if in_relationship || (!args.has("-force") && (mapped || !mappings.is_empty())) {
            return Err(cli_error(
                VDISK_IN_USE,
                format!("The virtual disk {} was not deleted because it is mapped or in a copy relationship.", name),
            ));
        }

        for id in mappings {
            array.remove_lcmap(id);
        }
        array.host_maps.retain(|m| m.vdisk != name);
        array.vdisks.remove(name);
        Ok(String::new())
    }

    fn expandvdisksize(&mut self, system_id: &str, args: &Args) -> Reply {
        let add: u64 = args.number("-size")?;
        let name = args.object()?;
        let array = self.array_mut(system_id)?;
        if !array.mappings_of(name).is_empty() {
            return Err(cli_error(
                VDISK_IN_USE,
                format!("The virtual disk {} cannot be expanded while in a copy mapping.", name),
            ));
        }
        let vdisk = array
            .vdisks
            .get_mut(name)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The object {} does not exist.", name)))?;
        vdisk.capacity += add * GIB;
        Ok(String::new())
    }

    fn mkhost(&mut self, system_id: &str, args: &Args) -> Reply {
        let name = args.required("-name")?;
        let initiator = match (args.value("-iscsiname"), args.value("-hbawwpn")) {
            (Some(iqn), _) => Initiator::Iscsi(iqn.to_string()),
            (None, Some(wwpns)) => Initiator::Fc(wwpns.split(':').map(str::to_string).collect()),
            (None, None) => return Err(cli_error(MISSING_PARAMETER, "An initiator is required.")),
        };
        let array = self.array_mut(system_id)?;
        if array.hosts.contains_key(name) {
            return Err(cli_error(ALREADY_EXISTS, format!("The name {} already exists.", name)));
        }
        let id = array.allocate_id();
        array.hosts.insert(
            name.to_string(),
            Host {
                id,
                name: name.to_string(),
                initiator,
            },
        );
        Ok(created("Host", id))
    }

    fn rmhost(&mut self, system_id: &str, args: &Args) -> Reply {
        let name = args.object()?;
        let array = self.array_mut(system_id)?;
        if !array.hosts.contains_key(name) {
            return Err(cli_error(OBJECT_NOT_FOUND, format!("The object {} does not exist.", name)));
        }
        if array.host_maps.iter().any(|m| m.host == name) {
            return Err(cli_error(HOST_IN_USE, format!("The host {} has mappings.", name)));
        }
        array.hosts.remove(name);
        Ok(String::new())
    }

    fn mkvdiskhostmap(&mut self, system_id: &str, args: &Args) -> Reply {
        let host = args.required("-host")?;
        let scsi_id: u32 = args.number("-scsi")?;
        let vdisk = args.object()?;
        let array = self.array_mut(system_id)?;

        if !array.hosts.contains_key(host) {
            return Err(cli_error(NAME_NOT_FOUND, format!("The host {} does not exist.", host)));
        }
        array.vdisk(vdisk)?;
        if array.host_maps.iter().any(|m| m.host == host && m.vdisk == vdisk) {
            return Err(cli_error(MAPPING_EXISTS, format!("{} is already mapped to {}.", vdisk, host)));
        }
        if array.host_maps.iter().any(|m| m.host == host && m.scsi_id == scsi_id) {
            return Err(cli_error(SCSI_ID_IN_USE, format!("SCSI id {} is in use on {}.", scsi_id, host)));
        }
        let id = array.allocate_id();
        array.host_maps.push(HostMap {
            host: host.to_string(),
            vdisk: vdisk.to_string(),
            scsi_id,
        });
        Ok(created("Virtual Disk to Host map", id))
    }

    fn rmvdiskhostmap(&mut self, system_id: &str, args: &Args) -> Reply {
        let host = args.required("-host")?;
        let vdisk = args.object()?;
        let array = self.array_mut(system_id)?;
        let before = array.host_maps.len();
        array.host_maps.retain(|m| !(m.host == host && m.vdisk == vdisk));
        if array.host_maps.len() == before {
            return Err(cli_error(NOT_MAPPED, format!("{} is not mapped to {}.", vdisk, host)));
        }
        Ok(String::new())
    }

    // =========================================================================
    // Local Copy
    // =========================================================================

    fn mklcmap(&mut self, system_id: &str, args: &Args) -> Reply {
        let source = args.required("-source")?;
        let target = args.required("-target")?;
        let copy_rate: u8 = args.number("-copyrate")?;
        let group = args.value("-consistgrp");
        let array = self.array_mut(system_id)?;

        let source_size = array.vdisk(source)?.capacity;
        let target_size = array.vdisk(target)?.capacity;
        if source_size != target_size {
            return Err(cli_error(
                SIZE_MISMATCH,
                "The mapping was not created because the source and target are different sizes.",
            ));
        }
        if let Some(group) = group {
            if !array.groups.contains_key(group) {
                return Err(cli_error(NAME_NOT_FOUND, format!("The group {} does not exist.", group)));
            }
        }

        let id = array.next_lcmap_id;
        array.next_lcmap_id += 1;
        let mut map = CopyMapping::new(id.to_string(), source, target, copy_rate);
        map.autodelete = args.has("-autodelete");
        map.group = group.map(str::to_string);
        if let Some(g) = group.and_then(|g| array.groups.get_mut(g)) {
            g.members.push(map.id.clone());
        }
        array.lcmaps.insert(id, map);
        Ok(created("LocalCopy Mapping", id))
    }

    fn lcmap_trigger(&mut self, system_id: &str, args: &Args, trigger: LcMapTrigger) -> Reply {
        let array = self.array_mut(system_id)?;
        let id = array.lcmap_id(args.object()?)?;
        let fail_flush = trigger == LcMapTrigger::Prepare && std::mem::take(&mut array.faults.fail_next_prepare);
        let map = array
            .lcmaps
            .get_mut(&id)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The object {} does not exist.", id)))?;

        // Stopping a mapping that is still flushing abandons the flush
        let trigger = match (trigger, map.status) {
            (LcMapTrigger::Stop, LcMapStatus::Preparing) => LcMapTrigger::FlushFailed,
            _ => trigger,
        };
        map.apply(trigger).map_err(|e| cli_error(LC_STATE, e))?;
        if fail_flush {
            array.flush_failures.insert(id);
        }
        Ok(String::new())
    }

    fn rmlcmap(&mut self, system_id: &str, args: &Args) -> Reply {
        let array = self.array_mut(system_id)?;
        let id = array.lcmap_id(args.object()?)?;
        let trigger = if args.has("-force") {
            LcMapTrigger::DeleteForce
        } else {
            LcMapTrigger::Delete
        };
        if let Some(map) = array.lcmaps.get_mut(&id) {
            map.apply(trigger).map_err(|e| cli_error(LC_STATE, e))?;
        }
        array.remove_lcmap(id);
        Ok(String::new())
    }

    fn mklcconsistgrp(&mut self, system_id: &str, args: &Args) -> Reply {
        let name = args.required("-name")?;
        let array = self.array_mut(system_id)?;
        if array.groups.contains_key(name) {
            return Err(cli_error(ALREADY_EXISTS, format!("The name {} already exists.", name)));
        }
        let id = array.allocate_id();
        array
            .groups
            .insert(name.to_string(), LcConsistencyGroup::new(id.to_string(), name));
        Ok(created("LocalCopy Consistency Group", id))
    }

    fn group_trigger(&mut self, system_id: &str, args: &Args, trigger: LcMapTrigger) -> Reply {
        let name = args.object()?;
        let array = self.array_mut(system_id)?;
        let fail_flush = trigger == LcMapTrigger::Prepare && std::mem::take(&mut array.faults.fail_next_prepare);
        let group = array
            .groups
            .get(name)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The group {} does not exist.", name)))?;

        let trigger = match (trigger, group.status) {
            (LcMapTrigger::Stop, LcMapStatus::Preparing) => LcMapTrigger::FlushFailed,
            _ => trigger,
        };
        group.check(trigger).map_err(|e| cli_error(LC_STATE, e))?;

        let members: Vec<u32> = group.members.iter().filter_map(|m| m.parse().ok()).collect();
        let member_trigger = |status: LcMapStatus| match trigger {
            LcMapTrigger::Stop | LcMapTrigger::FlushFailed => match status {
                LcMapStatus::Preparing => Some(LcMapTrigger::FlushFailed),
                LcMapStatus::Prepared | LcMapStatus::Copying => Some(LcMapTrigger::Stop),
                _ => None,
            },
            other => Some(other),
        };

        // Every member must accept the trigger before any of them moves
        let blocked = members.iter().filter_map(|id| array.lcmaps.get(id)).find(|m| {
            member_trigger(m.status).map_or(false, |t| copy_mapping::transition(m.status, t, false).is_none())
        });
        if let Some(map) = blocked {
            return Err(cli_error(
                LC_STATE,
                format!("Mapping {} cannot {} in state {}.", map.id, trigger, map.status),
            ));
        }

        for id in &members {
            if let Some(map) = array.lcmaps.get_mut(id) {
                if let Some(t) = member_trigger(map.status) {
                    let _ = map.apply(t);
                }
            }
            if fail_flush {
                array.flush_failures.insert(*id);
            }
        }
        if let Some(group) = array.groups.get_mut(name) {
            group.apply(trigger, false).map_err(|e| cli_error(LC_STATE, e))?;
        }
        Ok(String::new())
    }

    fn rmlcconsistgrp(&mut self, system_id: &str, args: &Args) -> Reply {
        let name = args.object()?;
        let array = self.array_mut(system_id)?;
        let trigger = if args.has("-force") {
            LcMapTrigger::DeleteForce
        } else {
            LcMapTrigger::Delete
        };
        let group = array
            .groups
            .get_mut(name)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The group {} does not exist.", name)))?;
        group.apply(trigger, false).map_err(|e| cli_error(LC_STATE, e))?;

        for map in array.lcmaps.values_mut() {
            if map.group.as_deref() == Some(name) {
                map.group = None;
            }
        }
        array.groups.remove(name);
        Ok(String::new())
    }

    // =========================================================================
    // Remote Copy
    // =========================================================================

    fn mkrcrelationship(&mut self, system_id: &str, args: &Args) -> Reply {
        let master = args.required("-master")?;
        let aux = args.required("-aux")?;
        let cluster = args.required("-cluster")?;
        let copy_type = if args.has("-global") {
            ReplicationType::Async
        } else {
            ReplicationType::Sync
        };

        let local = self.array(system_id)?;
        let master_size = local.vdisk(master)?.capacity;
        let remote = self
            .find_system(cluster)
            .ok_or_else(|| cli_error(CLUSTER_UNREACHABLE, format!("Cluster {} is not available.", cluster)))?;
        if local.partnership_state(Some(remote), &remote.id) != "fully_configured" {
            return Err(cli_error(
                NO_PARTNERSHIP,
                format!("No fully configured partnership with {}.", cluster),
            ));
        }
        let aux_size = remote.vdisk(aux)?.capacity;
        if aux_size != master_size {
            return Err(cli_error(SIZE_MISMATCH, "The master and auxiliary vdisks are different sizes."));
        }
        if self.relationship_of(system_id, master).is_some() || self.relationship_of(&remote.id, aux).is_some() {
            return Err(cli_error(VDISK_IN_USE, "The vdisk is already in a relationship."));
        }

        let rate = local
            .partnerships
            .get(&remote.id)
            .map(|p| p.background_copy_rate)
            .unwrap_or(50);
        let remote_id = remote.id.clone();

        let id = self.next_rc_id;
        self.next_rc_id += 1;
        let mut rel = RemoteCopyRelationship::new(id.to_string(), master, aux, system_id, remote_id, copy_type);
        rel.background_copy_rate = rate;
        self.relationships.insert(id, rel);
        Ok(created("RC Relationship", id))
    }

    fn rc_trigger(&mut self, system_id: &str, args: &Args, trigger: RcTrigger) -> Reply {
        let id = self.relationship_id(system_id, args.object()?)?;
        let rel = self
            .relationships
            .get_mut(&id)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The relationship {} does not exist.", id)))?;
        let next = rel.apply(trigger).map_err(|e| cli_error(RC_STATE, e))?;
        if next == RcRelState::End {
            self.relationships.remove(&id);
        }
        Ok(String::new())
    }

    fn startrcrelationship(&mut self, system_id: &str, args: &Args) -> Reply {
        let primary = args
            .value("-primary")
            .map(str::parse::<RcPrimary>)
            .transpose()
            .map_err(|e| cli_error(INVALID_PARAMETER, format!("Invalid primary {}.", e)))?;
        if self.array(system_id)?.faults.reject_rc_start {
            return Err(cli_error(RC_STATE, "The relationship cannot be started at this time."));
        }
        self.rc_trigger(system_id, args, RcTrigger::Start { primary })
    }

    fn switchrcrelationship(&mut self, system_id: &str, args: &Args) -> Reply {
        let primary: RcPrimary = args
            .required("-primary")?
            .parse()
            .map_err(|e| cli_error(INVALID_PARAMETER, format!("Invalid primary {}.", e)))?;
        if self.array(system_id)?.faults.reject_switch {
            return Err(cli_error(SWITCH_REJECTED, "The relationship cannot be switched at this time."));
        }
        self.rc_trigger(system_id, args, RcTrigger::Switch { primary })
    }

    fn mkippartnership(&mut self, system_id: &str, args: &Args) -> Reply {
        let cluster_ip = args.required("-clusterip")?;
        let rate: u8 = args.number("-backgroundcopyrate")?;
        let remote = self
            .addresses
            .get(cluster_ip)
            .and_then(|a| self.arrays.get(&a.system_id))
            .filter(|a| a.id != system_id)
            .ok_or_else(|| cli_error(CLUSTER_UNREACHABLE, format!("No remote cluster at {}.", cluster_ip)))?;
        let (remote_id, remote_name) = (remote.id.clone(), remote.name.clone());

        let array = self.array_mut(system_id)?;
        if array.partnerships.contains_key(&remote_id) {
            return Err(cli_error(ALREADY_EXISTS, format!("A partnership with {} already exists.", remote_name)));
        }
        array.partnerships.insert(
            remote_id,
            Partnership {
                remote_name,
                cluster_ip: cluster_ip.to_string(),
                background_copy_rate: rate,
                started: false,
            },
        );
        Ok(String::new())
    }

    fn chpartnership(&mut self, system_id: &str, args: &Args) -> Reply {
        let name = args.object()?;
        let array = self.array_mut(system_id)?;
        let partnership = array
            .partnerships
            .iter_mut()
            .find(|(id, p)| id.as_str() == name || p.remote_name == name)
            .map(|(_, p)| p)
            .ok_or_else(|| cli_error(OBJECT_NOT_FOUND, format!("The partnership {} does not exist.", name)))?;
        if args.has("-start") {
            partnership.started = true;
        }
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fabric() -> (FabricState, String) {
        let mut state = FabricState::default();
        let mut array = ArrayState::new("0000020060A00000".into(), "array-a".into(), "10.0.0.1".into());
        array.add_vdisk("vol-1", "pool0", 10);
        state.arrays.insert(array.id.clone(), array);
        (state, "0000020060A00000".to_string())
    }

    #[test]
    fn test_record_output() {
        let (mut state, id) = fabric();
        let result = state.execute(&id, "mcsinq lsvdisk -delim ! -bytes vol-1");
        assert!(result.succeeded());
        assert!(result.stdout.contains("name!vol-1\n"));
        assert!(result.stdout.contains(&format!("capacity!{}\n", 10 * GIB)));
        assert!(result.stdout.contains("RC_name!\n"));
    }

    #[test]
    fn test_missing_object_reports_code() {
        let (mut state, id) = fabric();
        let result = state.execute(&id, "mcsinq lsvdisk -delim ! -bytes nope");
        assert!(!result.succeeded());
        assert!(result.stderr.starts_with(NAME_NOT_FOUND));
    }

    #[test]
    fn test_snapshot_mapping_advances_on_query() {
        let (mut state, id) = fabric();
        state.execute(&id, "mcsop mkvdisk -name snap-1 -mdiskgrp pool0 -iogrp 0 -size 10 -unit gb");
        let created = state.execute(&id, "mcsop mklcmap -source vol-1 -target snap-1 -copyrate 0");
        assert_eq!(created.stdout, "LocalCopy Mapping, id [0], successfully created\n");

        assert!(state.execute(&id, "mcsop prestartlcmap 0").succeeded());
        let listed = state.execute(&id, "mcsinq lslcmap -delim ! 0");
        assert!(listed.stdout.contains("status!prepared"));
        assert!(state.execute(&id, "mcsop startlcmap 0").succeeded());
        let listed = state.execute(&id, "mcsinq lslcmap -delim ! 0");
        assert!(listed.stdout.contains("status!idle_or_copied"));

        let rejected = state.execute(&id, "mcsop startlcmap 0");
        assert!(rejected.stderr.starts_with(LC_STATE));
    }

    #[test]
    fn test_unknown_command() {
        let (mut state, id) = fabric();
        let result = state.execute(&id, "mcsop reboot now");
        assert!(result.stderr.starts_with(UNKNOWN_COMMAND));
    }
}
