//! Typed CLI Commands
//!
//! The closed set of commands the client sends to the array. Inquiries go
//! through `mcsinq`, state-changing operations through `mcsop`. Every
//! inquiry asks for `!`-delimited output.

use crate::cli::parser::Layout;
use crate::domain::ports::ReplicationType;
use crate::lifecycle::RcPrimary;
use serde::{Deserialize, Serialize};

/// Delimiter requested from every inquiry
pub const DELIMITER: char = '!';

const INQUIRY: &str = "mcsinq";
const OPERATION: &str = "mcsop";

// =============================================================================
// Command Parameters
// =============================================================================

/// Thin-provisioning options for a new vdisk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinProvisioning {
    /// Initial real capacity as a percentage of virtual size
    pub rsize_percent: u8,
    /// Capacity warning threshold percentage
    pub warning_percent: u8,
    /// Grain size in KiB
    pub grain_size_kb: u32,
    pub autoexpand: bool,
}

impl Default for ThinProvisioning {
    fn default() -> Self {
        Self {
            rsize_percent: 2,
            warning_percent: 80,
            grain_size_kb: 256,
            autoexpand: true,
        }
    }
}

/// Initiator identity used when creating a host object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostInitiator {
    Iscsi(String),
    Fc(Vec<String>),
}

// =============================================================================
// Commands
// =============================================================================

/// One array CLI command with typed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayCommand {
    // Inquiries
    LsSystem,
    LsVdisk { name: String },
    LsVdiskLcMappings { vdisk: String },
    LsVdiskHostMap { vdisk: String },
    LsHost { name: String },
    LsHostVdiskMap { host: String },
    LsLcMap { id: String },
    LsLcConsistGrp { name: String },
    LsRcRelationship { name: String },
    LsPartnership,

    // Vdisks and hosts
    MkVdisk {
        name: String,
        pool: String,
        size_gb: u64,
        iogrp: u32,
        thin: Option<ThinProvisioning>,
    },
    RmVdisk { name: String, force: bool },
    ExpandVdiskSize { name: String, add_gb: u64 },
    MkHost { name: String, initiator: HostInitiator },
    RmHost { name: String },
    MkVdiskHostMap { host: String, vdisk: String, scsi_id: u32 },
    RmVdiskHostMap { host: String, vdisk: String },

    // Local copy
    MkLcMap {
        source: String,
        target: String,
        copy_rate: u8,
        consistgrp: Option<String>,
        autodelete: bool,
    },
    PrestartLcMap { id: String },
    StartLcMap { id: String },
    StopLcMap { id: String, force: bool },
    RmLcMap { id: String, force: bool },
    MkLcConsistGrp { name: String },
    PrestartLcConsistGrp { name: String },
    StartLcConsistGrp { name: String },
    StopLcConsistGrp { name: String, force: bool },
    RmLcConsistGrp { name: String, force: bool },

    // Remote copy
    MkRcRelationship {
        master: String,
        aux: String,
        aux_system: String,
        copy_type: ReplicationType,
    },
    StartRcRelationship {
        name: String,
        primary: Option<RcPrimary>,
        force: bool,
    },
    StopRcRelationship { name: String, access: bool },
    SwitchRcRelationship { name: String, primary: RcPrimary },
    RmRcRelationship { name: String, force: bool },
    MkIpPartnership {
        cluster_ip: String,
        link_bandwidth_mbits: u32,
        background_copy_rate: u8,
    },
    StartPartnership { name: String },
}

impl ArrayCommand {
    /// CLI verb, e.g. `lsvdisk`
    pub fn verb(&self) -> &'static str {
        use ArrayCommand::*;
        match self {
            LsSystem => "lssystem",
            LsVdisk { .. } => "lsvdisk",
            LsVdiskLcMappings { .. } => "lsvdisklcmappings",
            LsVdiskHostMap { .. } => "lsvdiskhostmap",
            LsHost { .. } => "lshost",
            LsHostVdiskMap { .. } => "lshostvdiskmap",
            LsLcMap { .. } => "lslcmap",
            LsLcConsistGrp { .. } => "lslcconsistgrp",
            LsRcRelationship { .. } => "lsrcrelationship",
            LsPartnership => "lspartnership",
            MkVdisk { .. } => "mkvdisk",
            RmVdisk { .. } => "rmvdisk",
            ExpandVdiskSize { .. } => "expandvdisksize",
            MkHost { .. } => "mkhost",
            RmHost { .. } => "rmhost",
            MkVdiskHostMap { .. } => "mkvdiskhostmap",
            RmVdiskHostMap { .. } => "rmvdiskhostmap",
            MkLcMap { .. } => "mklcmap",
            PrestartLcMap { .. } => "prestartlcmap",
            StartLcMap { .. } => "startlcmap",
            StopLcMap { .. } => "stoplcmap",
            RmLcMap { .. } => "rmlcmap",
            MkLcConsistGrp { .. } => "mklcconsistgrp",
            PrestartLcConsistGrp { .. } => "prestartlcconsistgrp",
            StartLcConsistGrp { .. } => "startlcconsistgrp",
            StopLcConsistGrp { .. } => "stoplcconsistgrp",
            RmLcConsistGrp { .. } => "rmlcconsistgrp",
            MkRcRelationship { .. } => "mkrcrelationship",
            StartRcRelationship { .. } => "startrcrelationship",
            StopRcRelationship { .. } => "stoprcrelationship",
            SwitchRcRelationship { .. } => "switchrcrelationship",
            RmRcRelationship { .. } => "rmrcrelationship",
            MkIpPartnership { .. } => "mkippartnership",
            StartPartnership { .. } => "chpartnership",
        }
    }

    /// Output layout for inquiries, `None` for operations
    pub fn layout(&self) -> Option<Layout> {
        use ArrayCommand::*;
        match self {
            LsVdiskLcMappings { .. } | LsVdiskHostMap { .. } | LsHostVdiskMap { .. } | LsPartnership => {
                Some(Layout::Table)
            }
            LsSystem
            | LsVdisk { .. }
            | LsHost { .. }
            | LsLcMap { .. }
            | LsLcConsistGrp { .. }
            | LsRcRelationship { .. } => Some(Layout::Record),
            _ => None,
        }
    }

    /// Inquiries are read-only and safe to retry
    pub fn is_inquiry(&self) -> bool {
        self.layout().is_some()
    }

    /// Whether this command touches remote-copy state
    pub fn is_remote_copy(&self) -> bool {
        use ArrayCommand::*;
        matches!(
            self,
            MkRcRelationship { .. }
                | StartRcRelationship { .. }
                | StopRcRelationship { .. }
                | SwitchRcRelationship { .. }
                | RmRcRelationship { .. }
        )
    }

    /// Token list shipped to the command channel
    pub fn tokens(&self) -> Vec<String> {
        use ArrayCommand::*;

        let prefix = if self.is_inquiry() { INQUIRY } else { OPERATION };
        let mut t = Tokens::new(prefix, self.verb());
        if self.is_inquiry() {
            t.flag_value("-delim", DELIMITER.to_string());
        }

        match self {
            LsSystem | LsPartnership => {}
            LsVdisk { name } => {
                t.flag("-bytes");
                t.arg(name);
            }
            LsVdiskLcMappings { vdisk } | LsVdiskHostMap { vdisk } => t.arg(vdisk),
            LsHost { name } | LsLcConsistGrp { name } | LsRcRelationship { name } => t.arg(name),
            LsHostVdiskMap { host } => t.arg(host),
            LsLcMap { id } => t.arg(id),

            MkVdisk {
                name,
                pool,
                size_gb,
                iogrp,
                thin,
            } => {
                t.flag_value("-name", name);
                t.flag_value("-mdiskgrp", pool);
                t.flag_value("-iogrp", iogrp.to_string());
                t.flag_value("-size", size_gb.to_string());
                t.flag_value("-unit", "gb");
                if let Some(thin) = thin {
                    t.flag_value("-rsize", format!("{}%", thin.rsize_percent));
                    if thin.autoexpand {
                        t.flag("-autoexpand");
                    }
                    t.flag_value("-warning", format!("{}%", thin.warning_percent));
                    t.flag_value("-grainsize", thin.grain_size_kb.to_string());
                }
            }
            RmVdisk { name, force } => {
                t.flag_if("-force", *force);
                t.arg(name);
            }
            ExpandVdiskSize { name, add_gb } => {
                t.flag_value("-size", add_gb.to_string());
                t.flag_value("-unit", "gb");
                t.arg(name);
            }
            MkHost { name, initiator } => {
                t.flag_value("-name", name);
                match initiator {
                    HostInitiator::Iscsi(iqn) => t.flag_value("-iscsiname", iqn),
                    HostInitiator::Fc(wwpns) => t.flag_value("-hbawwpn", wwpns.join(":")),
                }
                t.flag("-force");
            }
            RmHost { name } => t.arg(name),
            MkVdiskHostMap { host, vdisk, scsi_id } => {
                t.flag_value("-host", host);
                t.flag_value("-scsi", scsi_id.to_string());
                t.arg(vdisk);
            }
            RmVdiskHostMap { host, vdisk } => {
                t.flag_value("-host", host);
                t.arg(vdisk);
            }

            MkLcMap {
                source,
                target,
                copy_rate,
                consistgrp,
                autodelete,
            } => {
                t.flag_value("-source", source);
                t.flag_value("-target", target);
                t.flag_value("-copyrate", copy_rate.to_string());
                if let Some(group) = consistgrp {
                    t.flag_value("-consistgrp", group);
                }
                t.flag_if("-autodelete", *autodelete);
            }
            PrestartLcMap { id } | StartLcMap { id } => t.arg(id),
            StopLcMap { id, force } | RmLcMap { id, force } => {
                t.flag_if("-force", *force);
                t.arg(id);
            }
            MkLcConsistGrp { name } => t.flag_value("-name", name),
            PrestartLcConsistGrp { name } | StartLcConsistGrp { name } => t.arg(name),
            StopLcConsistGrp { name, force } | RmLcConsistGrp { name, force } => {
                t.flag_if("-force", *force);
                t.arg(name);
            }

            MkRcRelationship {
                master,
                aux,
                aux_system,
                copy_type,
            } => {
                t.flag_value("-master", master);
                t.flag_value("-aux", aux);
                t.flag_value("-cluster", aux_system);
                if *copy_type == ReplicationType::Async {
                    t.flag("-global");
                }
            }
            StartRcRelationship { name, primary, force } => {
                if let Some(primary) = primary {
                    t.flag_value("-primary", primary.to_string());
                }
                t.flag_if("-force", *force);
                t.arg(name);
            }
            StopRcRelationship { name, access } => {
                t.flag_if("-access", *access);
                t.arg(name);
            }
            SwitchRcRelationship { name, primary } => {
                t.flag_value("-primary", primary.to_string());
                t.arg(name);
            }
            RmRcRelationship { name, force } => {
                t.flag_if("-force", *force);
                t.arg(name);
            }
            MkIpPartnership {
                cluster_ip,
                link_bandwidth_mbits,
                background_copy_rate,
            } => {
                t.flag_value("-type", "ipv4");
                t.flag_value("-clusterip", cluster_ip);
                t.flag_value("-linkbandwidthmbits", link_bandwidth_mbits.to_string());
                t.flag_value("-backgroundcopyrate", background_copy_rate.to_string());
            }
            StartPartnership { name } => {
                t.flag("-start");
                t.arg(name);
            }
        }

        t.0
    }
}

impl std::fmt::Display for ArrayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tokens().join(" "))
    }
}

struct Tokens(Vec<String>);

impl Tokens {
    fn new(prefix: &str, verb: &str) -> Self {
        Self(vec![prefix.to_string(), verb.to_string()])
    }

    fn flag(&mut self, flag: &str) {
        self.0.push(flag.to_string());
    }

    fn flag_if(&mut self, flag: &str, enabled: bool) {
        if enabled {
            self.flag(flag);
        }
    }

    fn flag_value(&mut self, flag: &str, value: impl AsRef<str>) {
        self.0.push(flag.to_string());
        self.0.push(value.as_ref().to_string());
    }

    fn arg(&mut self, value: impl AsRef<str>) {
        self.0.push(value.as_ref().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inquiry_tokens() {
        let cmd = ArrayCommand::LsVdisk { name: "vol-1".into() };
        assert!(cmd.is_inquiry());
        assert_eq!(cmd.layout(), Some(Layout::Record));
        assert_eq!(cmd.tokens(), vec!["mcsinq", "lsvdisk", "-delim", "!", "-bytes", "vol-1"]);

        let cmd = ArrayCommand::LsPartnership;
        assert_eq!(cmd.layout(), Some(Layout::Table));
        assert_eq!(cmd.to_string(), "mcsinq lspartnership -delim !");
    }

    #[test]
    fn test_mkvdisk_thin_tokens() {
        let cmd = ArrayCommand::MkVdisk {
            name: "vol-1".into(),
            pool: "pool0".into(),
            size_gb: 10,
            iogrp: 0,
            thin: Some(ThinProvisioning::default()),
        };
        assert!(!cmd.is_inquiry());
        assert_eq!(
            cmd.to_string(),
            "mcsop mkvdisk -name vol-1 -mdiskgrp pool0 -iogrp 0 -size 10 -unit gb \
             -rsize 2% -autoexpand -warning 80% -grainsize 256"
        );
    }

    #[test]
    fn test_lcmap_tokens() {
        let cmd = ArrayCommand::MkLcMap {
            source: "vol-1".into(),
            target: "snap-1".into(),
            copy_rate: 0,
            consistgrp: Some("cg-1".into()),
            autodelete: false,
        };
        assert_eq!(
            cmd.to_string(),
            "mcsop mklcmap -source vol-1 -target snap-1 -copyrate 0 -consistgrp cg-1"
        );

        let cmd = ArrayCommand::StopLcMap {
            id: "4".into(),
            force: true,
        };
        assert_eq!(cmd.tokens(), vec!["mcsop", "stoplcmap", "-force", "4"]);
    }

    #[test]
    fn test_remote_copy_tokens() {
        let cmd = ArrayCommand::MkRcRelationship {
            master: "vol-1".into(),
            aux: "aux_vol-1".into(),
            aux_system: "array-b".into(),
            copy_type: ReplicationType::Async,
        };
        assert!(cmd.is_remote_copy());
        assert_eq!(
            cmd.to_string(),
            "mcsop mkrcrelationship -master vol-1 -aux aux_vol-1 -cluster array-b -global"
        );

        let cmd = ArrayCommand::StartRcRelationship {
            name: "rcrel0".into(),
            primary: Some(RcPrimary::Aux),
            force: false,
        };
        assert_eq!(cmd.to_string(), "mcsop startrcrelationship -primary aux rcrel0");
    }

    #[test]
    fn test_fc_host_tokens() {
        let cmd = ArrayCommand::MkHost {
            name: "host-1".into(),
            initiator: HostInitiator::Fc(vec!["10000090FA0D1234".into(), "10000090FA0D5678".into()]),
        };
        assert_eq!(
            cmd.to_string(),
            "mcsop mkhost -name host-1 -hbawwpn 10000090FA0D1234:10000090FA0D5678 -force"
        );
    }
}
